//! Axum router construction.

use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::handlers;
use crate::state::AppState;

/// Per-request timeout applied to all routes; also used as the upstream gRPC
/// deadline so a stalled KMS cannot pin gateway connections.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the application [`Router`] with all routes and middleware attached.
///
/// CORS is wide open: the gateway sits behind a network boundary and is
/// called by non-browser automation tooling.
pub fn build(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/encrypt", post(handlers::encrypt))
        .route("/api/v1/encrypt/batch", post(handlers::encrypt_batch))
        .route("/api/v1/decrypt", post(handlers::decrypt))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .with_state(state)
}
