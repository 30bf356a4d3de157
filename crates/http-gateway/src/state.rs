//! Shared application state injected into every Axum handler.

use kms_protos::v1::kms_client::KmsClient;
use tonic::transport::Channel;

/// State shared across all request handlers.
///
/// The gRPC client is a thin handle over a shared channel, so cloning per
/// request is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Upstream KMS client.
    pub kms: KmsClient<Channel>,
    /// Token used when a request carries no `Authorization` header.
    pub fallback_token: Option<String>,
}

impl AppState {
    pub fn new(channel: Channel, fallback_token: Option<String>) -> Self {
        Self {
            kms: KmsClient::new(channel),
            fallback_token,
        }
    }
}
