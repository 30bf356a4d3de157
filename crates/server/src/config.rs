//! Configuration loading and validation for the KMS server.
//!
//! All values are read from `KMS_*` environment variables at startup. The
//! process exits with a clear error message if a required variable is missing
//! for the selected backend.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Which key-storage backend serves cryptographic operations.
///
/// Selected via `KMS_HSM_TYPE`; when the variable is absent the software
/// backend (file-resident master key) is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HsmType {
    Pkcs11,
    Aws,
    Azure,
}

/// Validated KMS server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the gRPC server binds, e.g. `0.0.0.0:50051`.
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: String,

    /// Path to the hex-encoded 32-byte master key (software backend only).
    #[serde(default = "default_master_key_path")]
    pub master_key_path: String,

    /// HSM backend selector; absent means software backend.
    #[serde(default)]
    pub hsm_type: Option<HsmType>,

    /// HMAC secret for bearer-token validation. Empty disables auth.
    #[serde(default)]
    pub jwt_secret: String,

    /// Expected `aud` claim; empty disables the check.
    #[serde(default)]
    pub jwt_aud: String,

    /// Expected `iss` claim; empty disables the check.
    #[serde(default)]
    pub jwt_iss: String,

    /// Lifetime of issued tokens, in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Username accepted by `Login`.
    #[serde(default = "default_demo_user")]
    pub demo_user: String,

    /// Password accepted by `Login`.
    #[serde(default = "default_demo_pass")]
    pub demo_pass: String,

    /// Path to the PKCS#11 module library. **Required** for `hsm_type=pkcs11`.
    #[serde(default)]
    pub pkcs11_lib: String,

    /// Preferred PKCS#11 slot id. Falls back to the first slot holding a
    /// token when the id is not found.
    #[serde(default)]
    pub pkcs11_slot: u64,

    /// User PIN for the PKCS#11 session.
    #[serde(default)]
    pub pkcs11_pin: String,

    /// Label of the AES secret key object inside the token.
    #[serde(default = "default_pkcs11_key_label")]
    pub pkcs11_key_label: String,

    /// AWS KMS key id or ARN. **Required** for `hsm_type=aws`.
    #[serde(default)]
    pub aws_key_id: String,

    /// AWS region for the KMS client.
    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    /// Azure Key Vault URL. **Required** for `hsm_type=azure`.
    #[serde(default)]
    pub azure_vault_url: String,

    /// Name of the vault secret holding the base64-encoded data key.
    #[serde(default = "default_azure_secret_name")]
    pub azure_secret_name: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_grpc_addr() -> String {
    "0.0.0.0:50051".into()
}
fn default_master_key_path() -> String {
    "master.key".into()
}
fn default_token_ttl_secs() -> u64 {
    3600
}
fn default_demo_user() -> String {
    "demo".into()
}
fn default_demo_pass() -> String {
    "demo123".into()
}
fn default_pkcs11_key_label() -> String {
    "kms-master-key".into()
}
fn default_aws_region() -> String {
    "us-east-1".into()
}
fn default_azure_secret_name() -> String {
    "kms-data-key".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from `KMS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or a backend-specific
    /// requirement is not met.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("KMS"))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate backend-specific requirements, returning a descriptive error
    /// on the first failure.
    pub fn validate(&self) -> Result<()> {
        match self.hsm_type {
            None => {
                if self.master_key_path.trim().is_empty() {
                    anyhow::bail!("KMS_MASTER_KEY_PATH must not be empty");
                }
            }
            Some(HsmType::Pkcs11) => {
                if self.pkcs11_lib.trim().is_empty() {
                    anyhow::bail!("KMS_PKCS11_LIB is required for the pkcs11 backend");
                }
            }
            Some(HsmType::Aws) => {
                if self.aws_key_id.trim().is_empty() {
                    anyhow::bail!("KMS_AWS_KEY_ID is required for the aws backend");
                }
            }
            Some(HsmType::Azure) => {
                if self.azure_vault_url.trim().is_empty() {
                    anyhow::bail!("KMS_AZURE_VAULT_URL is required for the azure backend");
                }
            }
        }
        if self.token_ttl_secs == 0 {
            anyhow::bail!("KMS_TOKEN_TTL_SECS must be > 0");
        }
        Ok(())
    }

    /// Whether bearer-token authentication is enabled.
    pub fn auth_enabled(&self) -> bool {
        !self.jwt_secret.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            grpc_addr: default_grpc_addr(),
            master_key_path: default_master_key_path(),
            hsm_type: None,
            jwt_secret: String::new(),
            jwt_aud: String::new(),
            jwt_iss: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
            demo_user: default_demo_user(),
            demo_pass: default_demo_pass(),
            pkcs11_lib: String::new(),
            pkcs11_slot: 0,
            pkcs11_pin: String::new(),
            pkcs11_key_label: default_pkcs11_key_label(),
            aws_key_id: String::new(),
            aws_region: default_aws_region(),
            azure_vault_url: String::new(),
            azure_secret_name: default_azure_secret_name(),
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_grpc_addr(), "0.0.0.0:50051");
        assert_eq!(default_master_key_path(), "master.key");
        assert_eq!(default_token_ttl_secs(), 3600);
        assert_eq!(default_pkcs11_key_label(), "kms-master-key");
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn software_backend_requires_key_path() {
        let mut cfg = base_config();
        cfg.master_key_path = "  ".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pkcs11_backend_requires_library() {
        let mut cfg = base_config();
        cfg.hsm_type = Some(HsmType::Pkcs11);
        assert!(cfg.validate().is_err());
        cfg.pkcs11_lib = "/usr/lib/softhsm/libsofthsm2.so".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn aws_backend_requires_key_id() {
        let mut cfg = base_config();
        cfg.hsm_type = Some(HsmType::Aws);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_ttl_rejected() {
        let mut cfg = base_config();
        cfg.token_ttl_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auth_enabled_tracks_secret() {
        let mut cfg = base_config();
        assert!(!cfg.auth_enabled());
        cfg.jwt_secret = "s".into();
        assert!(cfg.auth_enabled());
    }
}
