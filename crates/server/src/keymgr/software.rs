//! Software backend: AES-256-GCM with an in-memory master key.
//!
//! The key is loaded once from a hex-encoded file and lives in process memory
//! inside a zeroize-on-drop buffer. The cipher context is immutable after
//! construction and safe for concurrent use; the per-call nonce draw is the
//! only mutation and goes through the OS CSPRNG.

use std::path::Path;

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{KeyError, KeyManager, KEY_LEN, NONCE_LEN};

/// Fixed-size key buffer, overwritten with zeroes when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeyBytes(pub(crate) [u8; KEY_LEN]);

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}

struct EngineState {
    cipher: Aes256Gcm,
    // Held only so teardown has something concrete to zero; the cipher's own
    // round keys are dropped together with it.
    _key: KeyBytes,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("cipher", &"[REDACTED]")
            .field("_key", &self._key)
            .finish()
    }
}

/// AES-256-GCM engine shared by every backend that ends up holding a raw
/// 32-byte data key in memory (software, AWS, Azure).
#[derive(Debug)]
pub(crate) struct GcmEngine {
    state: RwLock<Option<EngineState>>,
}

impl GcmEngine {
    pub(crate) fn new(key: [u8; KEY_LEN]) -> Self {
        let cipher = Aes256Gcm::new(&key.into());
        Self {
            state: RwLock::new(Some(EngineState {
                cipher,
                _key: KeyBytes(key),
            })),
        }
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        let guard = self.state.read();
        let state = guard
            .as_ref()
            .ok_or_else(|| KeyError::BackendUnavailable("key manager closed".into()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = state
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| KeyError::CryptoFailure("aead seal failed".into()))?;

        Ok((ciphertext, nonce_bytes.to_vec()))
    }

    pub(crate) fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
        if nonce.len() != NONCE_LEN {
            return Err(KeyError::InvalidInput(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce.len()
            )));
        }
        let guard = self.state.read();
        let state = guard
            .as_ref()
            .ok_or_else(|| KeyError::BackendUnavailable("key manager closed".into()))?;

        state
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| KeyError::AuthenticationFailed)
    }

    /// Drop the cipher and zero the key copy. Idempotent.
    pub(crate) fn close(&self) {
        self.state.write().take();
    }
}

/// Key manager backed by a file-resident master key.
#[derive(Debug)]
pub struct SoftwareKeyManager {
    engine: GcmEngine,
}

impl SoftwareKeyManager {
    /// Load the master key from `path`.
    ///
    /// The file content, after trimming ASCII whitespace, must be exactly
    /// 64 hex characters (a 32-byte AES-256 key).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not decode to a
    /// 32-byte key.
    pub fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read master key file {}", path.display()))?;
        Self::from_hex(data.trim())
    }

    /// Build a manager from a hex-encoded 32-byte key.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let decoded = hex::decode(hex_key).context("master key is not valid hex")?;
        let key: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("master key must be 32 bytes, got {}", v.len()))?;
        Ok(Self {
            engine: GcmEngine::new(key),
        })
    }
}

#[async_trait]
impl KeyManager for SoftwareKeyManager {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        self.engine.encrypt(plaintext)
    }

    async fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.engine.decrypt(ciphertext, nonce)
    }

    async fn close(&self) {
        self.engine.close();
    }
}
