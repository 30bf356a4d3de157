//! Configuration loading and validation for the HTTP gateway.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated gateway configuration, read from `KMS_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Upstream KMS gRPC address.
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: String,

    /// Pre-issued bearer token used when a request carries no
    /// `Authorization` header.
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".into()
}
fn default_grpc_addr() -> String {
    "127.0.0.1:50051".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("KMS"))
            .build()
            .context("failed to build gateway configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise gateway configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.http_addr.trim().is_empty() {
            anyhow::bail!("KMS_HTTP_ADDR must not be empty");
        }
        if self.grpc_addr.trim().is_empty() {
            anyhow::bail!("KMS_GRPC_ADDR must not be empty");
        }
        Ok(())
    }
}
