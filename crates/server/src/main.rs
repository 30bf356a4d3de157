//! `kms-server` — gRPC KMS binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from `KMS_*` environment variables.
//! 2. Initialise the tracing subscriber.
//! 3. Initialise the configured key-manager backend (software or HSM);
//!    HSM backends self-test before the server accepts traffic.
//! 4. Serve the `Kms` and `Auth` gRPC services.

use std::time::Duration;

use anyhow::Result;
use tracing::info;

use kms_server::auth::JwtConfig;
use kms_server::config::Config;
use kms_server::grpc::{self, LoginCredentials};
use kms_server::{keymgr, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %cfg.grpc_addr,
        "kms-server starting"
    );

    // -----------------------------------------------------------------------
    // 3. Key manager
    // -----------------------------------------------------------------------
    let manager = keymgr::from_config(&cfg).await?;

    // -----------------------------------------------------------------------
    // 4. gRPC server
    // -----------------------------------------------------------------------
    if cfg.auth_enabled() {
        info!(aud = %cfg.jwt_aud, iss = %cfg.jwt_iss, "bearer-token auth enabled");
    } else {
        info!("bearer-token auth disabled (KMS_JWT_SECRET not set)");
    }

    let jwt = JwtConfig {
        secret: cfg.jwt_secret.clone(),
        audience: (!cfg.jwt_aud.is_empty()).then(|| cfg.jwt_aud.clone()),
        issuer: (!cfg.jwt_iss.is_empty()).then(|| cfg.jwt_iss.clone()),
        ttl: Duration::from_secs(cfg.token_ttl_secs),
    };
    let credentials = LoginCredentials {
        username: cfg.demo_user.clone(),
        password: cfg.demo_pass.clone(),
    };

    grpc::serve(&cfg.grpc_addr, manager, jwt, credentials).await
}
