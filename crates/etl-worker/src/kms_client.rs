//! Thin client wrapper over the generated gRPC stubs.
//!
//! Adds what every pipeline call needs: bearer metadata on each request and a
//! locally-enforced per-call deadline (5 s for encrypt, 10 s for decrypt).

use std::time::Duration;

use anyhow::{Context, Result};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Request, Status};
use tracing::{info, warn};

use kms_protos::v1::auth_client::AuthClient;
use kms_protos::v1::kms_client::KmsClient;
use kms_protos::v1::{DecryptRequest, EncryptRequest, LoginRequest};

use crate::config::AppConfig;

/// Per-call deadline for encrypt RPCs.
pub const ENCRYPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-call deadline for decrypt RPCs.
pub const DECRYPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared, cloneable handle to the upstream KMS.
#[derive(Clone)]
pub struct KmsApi {
    client: KmsClient<Channel>,
    token: Option<MetadataValue<Ascii>>,
}

impl KmsApi {
    /// Wrap a channel, pre-parsing the bearer token if one is set.
    pub fn new(channel: Channel, token: Option<String>) -> Result<Self> {
        let token = token
            .map(|t| MetadataValue::try_from(format!("Bearer {t}")))
            .transpose()
            .context("bearer token contains invalid characters")?;
        Ok(Self {
            client: KmsClient::new(channel),
            token,
        })
    }

    /// Encrypt `plaintext`, returning `(ciphertext_with_tag, nonce)`.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), Status> {
        let request = self.request(EncryptRequest {
            plaintext: plaintext.to_vec(),
            key_id: String::new(),
        });
        let mut client = self.client.clone();
        match tokio::time::timeout(ENCRYPT_TIMEOUT, client.encrypt(request)).await {
            Ok(result) => result.map(|resp| {
                let resp = resp.into_inner();
                (resp.ciphertext, resp.nonce)
            }),
            Err(_) => Err(Status::deadline_exceeded("encrypt call timed out")),
        }
    }

    /// Decrypt `ciphertext` with `nonce`.
    pub async fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, Status> {
        let request = self.request(DecryptRequest {
            ciphertext: ciphertext.to_vec(),
            nonce: nonce.to_vec(),
            key_id: String::new(),
        });
        let mut client = self.client.clone();
        match tokio::time::timeout(DECRYPT_TIMEOUT, client.decrypt(request)).await {
            Ok(result) => result.map(|resp| resp.into_inner().plaintext),
            Err(_) => Err(Status::deadline_exceeded("decrypt call timed out")),
        }
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        request
    }
}

/// Open a lazily-connecting channel to `addr`.
pub fn open_channel(addr: &str) -> Result<Channel> {
    let endpoint = format!("http://{addr}");
    Ok(Channel::from_shared(endpoint.clone())
        .with_context(|| format!("invalid KMS endpoint {endpoint}"))?
        .connect_lazy())
}

/// Exchange the configured credentials for a token.
pub async fn login(channel: Channel, username: &str, password: &str) -> Result<String> {
    let mut client = AuthClient::new(channel);
    let resp = tokio::time::timeout(
        Duration::from_secs(5),
        client.login(LoginRequest {
            username: username.to_owned(),
            password: password.to_owned(),
        }),
    )
    .await
    .context("login call timed out")?
    .context("login failed")?;

    let token = resp.into_inner().token;
    if token.is_empty() {
        anyhow::bail!("login returned an empty token");
    }
    Ok(token)
}

/// Resolve the bearer token to use for this run.
///
/// Order: `KMS_BEARER_TOKEN` env var, then `auth.bearerToken` from the config
/// file, then auto-login with `auth.username`/`auth.password`. Running with
/// no token at all is allowed (the server may have auth disabled) but logged.
pub async fn resolve_token(channel: &Channel, cfg: &AppConfig) -> Result<Option<String>> {
    if let Ok(token) = std::env::var("KMS_BEARER_TOKEN") {
        if !token.is_empty() {
            info!("using bearer token from KMS_BEARER_TOKEN");
            return Ok(Some(token));
        }
    }
    if !cfg.auth.bearer_token.is_empty() {
        info!("using bearer token from config file");
        return Ok(Some(cfg.auth.bearer_token.clone()));
    }
    if !cfg.auth.username.is_empty() {
        info!(username = %cfg.auth.username, "logging in to KMS");
        let token = login(channel.clone(), &cfg.auth.username, &cfg.auth.password)
            .await
            .context("auto-login failed")?;
        info!("auto-login succeeded");
        return Ok(Some(token));
    }
    warn!("no authentication configured; requests will fail if the server enforces auth");
    Ok(None)
}
