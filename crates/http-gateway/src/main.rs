//! `kms-http-gateway` — REST adapter binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the tracing subscriber.
//! 3. Open a lazy gRPC channel to the upstream KMS.
//! 4. Build the Axum router and serve.

use anyhow::{Context, Result};
use tonic::transport::Channel;
use tracing::info;

use kms_http_gateway::config::Config;
use kms_http_gateway::state::AppState;
use kms_http_gateway::{router, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        eprintln!("ERROR: gateway configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        http_addr = %cfg.http_addr,
        grpc_addr = %cfg.grpc_addr,
        "kms-http-gateway starting"
    );

    // -----------------------------------------------------------------------
    // 3. Upstream channel (lazy: the gateway may start before the KMS)
    // -----------------------------------------------------------------------
    let endpoint = format!("http://{}", cfg.grpc_addr);
    let channel = Channel::from_shared(endpoint.clone())
        .with_context(|| format!("invalid upstream endpoint {endpoint}"))?
        .connect_lazy();

    let state = AppState::new(channel, cfg.bearer_token.clone());

    // -----------------------------------------------------------------------
    // 4. HTTP server
    // -----------------------------------------------------------------------
    let app = router::build(state);
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http_addr))?;
    info!(addr = %cfg.http_addr, "listening");
    axum::serve(listener, app).await.context("HTTP server failed")
}
