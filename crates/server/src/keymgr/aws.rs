//! AWS KMS backend via envelope encryption.
//!
//! AWS KMS cannot bulk-encrypt arbitrary payload sizes, so the provider asks
//! KMS for a fresh AES-256 data key at startup and performs GCM in software
//! against that key. Rotation of the underlying master key is an operator
//! concern outside this service.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_kms::types::DataKeySpec;

use super::software::GcmEngine;
use super::{KeyError, KeyManager, KEY_LEN};

/// Key manager backed by an AWS KMS data key.
pub struct AwsKmsKeyManager {
    engine: GcmEngine,
}

impl AwsKmsKeyManager {
    /// Resolve AWS credentials, generate an AES-256 data key under `key_id`,
    /// and build the in-memory GCM engine from its plaintext half.
    ///
    /// # Errors
    ///
    /// Returns an error if the SDK config cannot be loaded, the
    /// `GenerateDataKey` call fails, or the returned key is not 32 bytes.
    pub async fn initialize(key_id: &str, region: &str) -> Result<Self> {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_owned()))
            .load()
            .await;
        let client = aws_sdk_kms::Client::new(&config);

        let resp = client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(DataKeySpec::Aes256)
            .send()
            .await
            .context("failed to generate data key from AWS KMS")?;

        let plaintext = resp
            .plaintext()
            .context("AWS KMS response contained no plaintext data key")?;
        let key: [u8; KEY_LEN] = plaintext
            .as_ref()
            .try_into()
            .map_err(|_| anyhow::anyhow!("AWS KMS returned a data key of unexpected size"))?;

        Ok(Self {
            engine: GcmEngine::new(key),
        })
    }
}

#[async_trait]
impl KeyManager for AwsKmsKeyManager {
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
