//! PKCS#11 backend: AES-256-GCM performed inside the HSM.
//!
//! The raw key never leaves the device. All operations run against a single
//! logged-in session; PKCS#11 sessions are not concurrency-safe, so every
//! call takes an exclusive lock and runs on the blocking thread pool.
//!
//! Startup performs a self-test (encrypt the literal `"ping"` under the
//! configured label) so a wrong slot or label fails the process immediately
//! instead of the first production request.

use std::sync::Arc;

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use anyhow::{Context, Result};
use async_trait::async_trait;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::aead::GcmParams;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::{AuthPin, Ulong};
use parking_lot::Mutex;
use tracing::warn;

use super::{KeyError, KeyManager, NONCE_LEN};

/// GCM authentication tag length in bits.
const TAG_BITS: u64 = 128;

struct Inner {
    // Keeps the module loaded; dropping it finalizes the library.
    _ctx: Pkcs11,
    session: Mutex<Option<Session>>,
    key_label: String,
}

/// Key manager driving an HSM through its PKCS#11 interface.
pub struct Pkcs11KeyManager {
    inner: Arc<Inner>,
}

impl Pkcs11KeyManager {
    /// Load the module, pick a slot, open and log into a session, and run the
    /// startup self-test.
    ///
    /// If `preferred_slot` is not among the slots currently holding a token,
    /// the first such slot is used instead and the substitution is logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot be loaded, no token is present,
    /// login fails, or the self-test fails.
    pub async fn initialize(
        lib_path: &str,
        preferred_slot: u64,
        pin: &str,
        key_label: &str,
    ) -> Result<Self> {
        let lib_path = lib_path.to_owned();
        let pin = pin.to_owned();
        let key_label = key_label.to_owned();
        tokio::task::spawn_blocking(move || {
            Self::initialize_blocking(&lib_path, preferred_slot, &pin, key_label)
        })
        .await
        .context("PKCS#11 initialisation task failed")?
    }

    fn initialize_blocking(
        lib_path: &str,
        preferred_slot: u64,
        pin: &str,
        key_label: String,
    ) -> Result<Self> {
        let ctx = Pkcs11::new(lib_path)
            .with_context(|| format!("failed to load PKCS#11 library {lib_path}"))?;
        ctx.initialize(CInitializeArgs::OsThreads)
            .context("failed to initialise PKCS#11 library")?;

        let slots = ctx
            .get_slots_with_token()
            .context("failed to enumerate PKCS#11 slots")?;

        let slot = match slots.iter().copied().find(|s| s.id() == preferred_slot) {
            Some(slot) => slot,
            None => {
                let first = *slots
                    .first()
                    .ok_or_else(|| anyhow::anyhow!("no PKCS#11 slots with tokens found"))?;
                warn!(
                    configured_slot = preferred_slot,
                    substituted_slot = first.id(),
                    "configured slot has no token; falling back to first available slot"
                );
                first
            }
        };

        let session = ctx
            .open_rw_session(slot)
            .with_context(|| format!("failed to open PKCS#11 session on slot {}", slot.id()))?;
        session
            .login(UserType::User, Some(&AuthPin::new(pin.to_owned())))
            .context("failed to log into PKCS#11 token")?;

        let inner = Inner {
            _ctx: ctx,
            session: Mutex::new(Some(session)),
            key_label,
        };

        encrypt_blocking(&inner, b"ping")
            .map_err(|e| anyhow::anyhow!("HSM self-test failed (check slot id and key label): {e}"))?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

/// Locate the key object by label, restricted to secret keys.
fn find_key(session: &Session, label: &str) -> Result<ObjectHandle, KeyError> {
    let template = [
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::Label(label.as_bytes().to_vec()),
    ];
    let objects = session
        .find_objects(&template)
        .map_err(|e| KeyError::BackendUnavailable(format!("key lookup failed: {e}")))?;
    objects
        .into_iter()
        .next()
        .ok_or_else(|| KeyError::KeyNotFound(label.to_owned()))
}

fn encrypt_blocking(inner: &Inner, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
    let guard = inner.session.lock();
    let session = guard
        .as_ref()
        .ok_or_else(|| KeyError::BackendUnavailable("HSM session closed".into()))?;

    let key = find_key(session, &inner.key_label)?;

    // The HSM does not produce nonces; draw one locally.
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let params = GcmParams::new(&nonce, &[], Ulong::from(TAG_BITS));
    let ciphertext = session
        .encrypt(&Mechanism::AesGcm(params), key, plaintext)
        .map_err(|e| KeyError::CryptoFailure(format!("HSM encrypt failed: {e}")))?;

    Ok((ciphertext, nonce.to_vec()))
}

fn decrypt_blocking(inner: &Inner, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
    if nonce.len() != NONCE_LEN {
        return Err(KeyError::InvalidInput(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    let guard = inner.session.lock();
    let session = guard
        .as_ref()
        .ok_or_else(|| KeyError::BackendUnavailable("HSM session closed".into()))?;

    let key = find_key(session, &inner.key_label)?;

    let params = GcmParams::new(nonce, &[], Ulong::from(TAG_BITS));
    session
        .decrypt(&Mechanism::AesGcm(params), key, ciphertext)
        // Tokens report tag mismatch and malformed ciphertext through the
        // same return path.
        .map_err(|_| KeyError::AuthenticationFailed)
}

#[async_trait]
impl KeyManager for Pkcs11KeyManager {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
        let inner = Arc::clone(&self.inner);
        let plaintext = plaintext.to_vec();
        tokio::task::spawn_blocking(move || encrypt_blocking(&inner, &plaintext))
            .await
            .map_err(|e| KeyError::BackendUnavailable(format!("HSM task failed: {e}")))?
    }

    async fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
        let inner = Arc::clone(&self.inner);
        let ciphertext = ciphertext.to_vec();
        let nonce = nonce.to_vec();
        tokio::task::spawn_blocking(move || decrypt_blocking(&inner, &ciphertext, &nonce))
            .await
            .map_err(|e| KeyError::BackendUnavailable(format!("HSM task failed: {e}")))?
    }

    async fn export_key(&self) -> Result<Vec<u8>, KeyError> {
        Err(KeyError::SecurityViolation(
            "cannot extract a sensitive key from the HSM",
        ))
    }

    async fn close(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = session.logout() {
                warn!(error = %e, "PKCS#11 logout failed");
            }
            // Dropping the session closes it; dropping the context (when the
            // last Arc goes away) finalizes the library.
        }
    }
}
