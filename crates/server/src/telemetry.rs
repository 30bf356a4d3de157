//! Telemetry initialisation for the KMS binaries.
//!
//! Structured logs only: JSON when `KMS_LOG_JSON=1` (container deployments),
//! human-readable otherwise. No exporter pipeline; the service runs behind a
//! trusted boundary and log shipping is the platform's concern.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured `log_level`.
///
/// # Errors
///
/// Returns an error if a subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let json = std::env::var("KMS_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}
