//! Key-manager capability: a uniform encrypt/decrypt surface over any
//! key-storage backend.
//!
//! Callers hold an `Arc<dyn KeyManager>` and never learn which backend is
//! active. The software backend keeps the master key in process memory
//! (zeroed on teardown); the HSM backends either drive the device directly
//! (PKCS#11) or perform envelope encryption against a provider-issued data
//! key (AWS, Azure).

pub mod software;

#[cfg(feature = "aws-kms")]
pub mod aws;
#[cfg(feature = "azure-kv")]
pub mod azure;
#[cfg(feature = "pkcs11")]
pub mod pkcs11;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, HsmType};

pub use software::SoftwareKeyManager;

/// Byte length of an AES-256 key.
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce.
pub const NONCE_LEN: usize = kms_common::NONCE_SIZE;

/// Errors surfaced by key-manager operations.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The cipher operation itself failed (never a tag mismatch).
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// The GCM authentication tag did not verify on decrypt.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The backend cannot be reached, or has been closed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An input had the wrong size or shape.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A caller asked for something the backend must never do.
    #[error("security violation: {0}")]
    SecurityViolation(&'static str),

    /// No key object exists under the configured label.
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

impl From<KeyError> for tonic::Status {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidInput(_) => tonic::Status::invalid_argument(err.to_string()),
            KeyError::AuthenticationFailed => {
                tonic::Status::invalid_argument("authentication failed")
            }
            KeyError::BackendUnavailable(_) => tonic::Status::unavailable(err.to_string()),
            KeyError::SecurityViolation(_) => tonic::Status::permission_denied(err.to_string()),
            KeyError::CryptoFailure(_) | KeyError::KeyNotFound(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}

/// The uniform capability exposed to the RPC layer and the pipelines.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Encrypt `plaintext`, returning `(ciphertext_with_tag, nonce)`.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError>;

    /// Decrypt `ciphertext_with_tag` using `nonce`, returning the plaintext.
    async fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Export the raw key material.
    ///
    /// Disallowed for every backend: raw key extraction defeats the point of
    /// centralising crypto behind the service.
    async fn export_key(&self) -> Result<Vec<u8>, KeyError> {
        Err(KeyError::SecurityViolation(
            "raw key material is not extractable",
        ))
    }

    /// Release backend resources and zero any in-memory key material.
    /// Idempotent; operations after `close` fail with
    /// [`KeyError::BackendUnavailable`].
    async fn close(&self);
}

/// Build the configured key manager.
///
/// `KMS_HSM_TYPE` absent selects the software backend; `pkcs11`, `aws` and
/// `azure` select the matching HSM backend. Selecting a backend this build
/// was compiled without is a startup error.
///
/// # Errors
///
/// Returns an error if backend initialisation fails (missing key file, failed
/// HSM self-test, unreachable provider).
pub async fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn KeyManager>> {
    match cfg.hsm_type {
        None => {
            tracing::info!(path = %cfg.master_key_path, "using software key manager");
            let mgr = SoftwareKeyManager::from_key_file(&cfg.master_key_path)?;
            Ok(Arc::new(mgr))
        }
        #[cfg(feature = "pkcs11")]
        Some(HsmType::Pkcs11) => {
            tracing::info!(lib = %cfg.pkcs11_lib, label = %cfg.pkcs11_key_label, "using PKCS#11 key manager");
            let mgr = pkcs11::Pkcs11KeyManager::initialize(
                &cfg.pkcs11_lib,
                cfg.pkcs11_slot,
                &cfg.pkcs11_pin,
                &cfg.pkcs11_key_label,
            )
            .await?;
            Ok(Arc::new(mgr))
        }
        #[cfg(not(feature = "pkcs11"))]
        Some(HsmType::Pkcs11) => {
            anyhow::bail!("this build was compiled without pkcs11 support (enable the `pkcs11` feature)")
        }
        #[cfg(feature = "aws-kms")]
        Some(HsmType::Aws) => {
            tracing::info!(key_id = %cfg.aws_key_id, region = %cfg.aws_region, "using AWS KMS key manager");
            let mgr = aws::AwsKmsKeyManager::initialize(&cfg.aws_key_id, &cfg.aws_region).await?;
            Ok(Arc::new(mgr))
        }
        #[cfg(not(feature = "aws-kms"))]
        Some(HsmType::Aws) => {
            anyhow::bail!("this build was compiled without AWS KMS support (enable the `aws-kms` feature)")
        }
        #[cfg(feature = "azure-kv")]
        Some(HsmType::Azure) => {
            tracing::info!(vault = %cfg.azure_vault_url, "using Azure Key Vault key manager");
            let mgr =
                azure::AzureKeyVaultManager::initialize(&cfg.azure_vault_url, &cfg.azure_secret_name)
                    .await?;
            Ok(Arc::new(mgr))
        }
        #[cfg(not(feature = "azure-kv"))]
        Some(HsmType::Azure) => {
            anyhow::bail!("this build was compiled without Azure Key Vault support (enable the `azure-kv` feature)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopManager;

    #[async_trait]
    impl KeyManager for NoopManager {
        async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
            Ok((plaintext.to_vec(), vec![0; NONCE_LEN]))
        }
        async fn decrypt(&self, ciphertext: &[u8], _nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
            Ok(ciphertext.to_vec())
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn export_key_is_denied_by_default() {
        let mgr = NoopManager;
        let err = mgr.export_key().await.unwrap_err();
        assert!(matches!(err, KeyError::SecurityViolation(_)));
    }

    #[test]
    fn status_mapping() {
        let status: tonic::Status = KeyError::AuthenticationFailed.into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "authentication failed");

        let status: tonic::Status = KeyError::BackendUnavailable("closed".into()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status =
            KeyError::SecurityViolation("raw key material is not extractable").into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status: tonic::Status = KeyError::CryptoFailure("seal".into()).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
