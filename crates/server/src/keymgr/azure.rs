//! Azure Key Vault backend via envelope encryption.
//!
//! Key Vault does not export AES key material, so the deployment stores a
//! base64-encoded 32-byte data key as a vault *secret*. The provider fetches
//! it once at startup (DefaultAzureCredential chain) and performs GCM in
//! software, matching the AWS variant.

use anyhow::{Context, Result};
use async_trait::async_trait;
use azure_security_keyvault::SecretClient;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::software::GcmEngine;
use super::{KeyError, KeyManager, KEY_LEN};

/// Key manager backed by a data key stored in Azure Key Vault.
pub struct AzureKeyVaultManager {
    engine: GcmEngine,
}

impl AzureKeyVaultManager {
    /// Fetch the data-key secret from `vault_url` and build the GCM engine.
    ///
    /// # Errors
    ///
    /// Returns an error if credential resolution fails, the secret cannot be
    /// fetched, or its value does not decode to a 32-byte key.
    pub async fn initialize(vault_url: &str, secret_name: &str) -> Result<Self> {
        let credential =
            azure_identity::create_credential().context("failed to create Azure credential")?;
        let client = SecretClient::new(vault_url, credential)
            .context("failed to create Azure Key Vault client")?;

        let secret = client
            .get(secret_name)
            .await
            .with_context(|| format!("failed to fetch secret {secret_name} from Key Vault"))?;

        let decoded = STANDARD
            .decode(secret.value.trim())
            .context("Key Vault data-key secret is not valid base64")?;
        let key: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|v: Vec<u8>| {
                anyhow::anyhow!("Key Vault data key must be 32 bytes, got {}", v.len())
            })?;

        Ok(Self {
            engine: GcmEngine::new(key),
        })
    }
}

#[async_trait]
impl KeyManager for AzureKeyVaultManager {
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
