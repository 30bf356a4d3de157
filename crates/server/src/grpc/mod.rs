//! gRPC service implementations and the server assembly.
//!
//! Two services share one listener: `Kms` (encrypt/decrypt, gated by the
//! bearer interceptor) and `Auth` (login, never gated).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{async_trait, transport::Server, Request, Response, Status};
use tower_http::trace::TraceLayer;
use tracing::info;

use kms_protos::v1::auth_server::{Auth, AuthServer};
use kms_protos::v1::kms_server::{Kms, KmsServer};
use kms_protos::v1::{
    DecryptRequest, DecryptResponse, EncryptRequest, EncryptResponse, LoginRequest, LoginResponse,
};

use crate::auth::{issue_token, BearerAuth, JwtConfig};
use crate::keymgr::KeyManager;

/// Username/password pair accepted by `Login`.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

/// The `Kms` service: encrypt/decrypt against the active key manager.
pub struct KmsGrpc {
    manager: Arc<dyn KeyManager>,
}

impl KmsGrpc {
    pub fn new(manager: Arc<dyn KeyManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Kms for KmsGrpc {
    async fn encrypt(
        &self,
        request: Request<EncryptRequest>,
    ) -> Result<Response<EncryptResponse>, Status> {
        let req = request.into_inner();
        let (ciphertext, nonce) = self.manager.encrypt(&req.plaintext).await?;
        Ok(Response::new(EncryptResponse { ciphertext, nonce }))
    }

    async fn decrypt(
        &self,
        request: Request<DecryptRequest>,
    ) -> Result<Response<DecryptResponse>, Status> {
        let req = request.into_inner();
        let plaintext = self.manager.decrypt(&req.ciphertext, &req.nonce).await?;
        Ok(Response::new(DecryptResponse { plaintext }))
    }
}

/// The `Auth` service: issue tokens for the preconfigured credential pair.
pub struct AuthGrpc {
    jwt: Arc<JwtConfig>,
    credentials: LoginCredentials,
}

impl AuthGrpc {
    pub fn new(jwt: Arc<JwtConfig>, credentials: LoginCredentials) -> Self {
        Self { jwt, credentials }
    }
}

#[async_trait]
impl Auth for AuthGrpc {
    async fn login(
        &self,
        request: Request<LoginRequest>,
    ) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        if req.username != self.credentials.username || req.password != self.credentials.password {
            return Err(Status::unauthenticated("invalid credentials"));
        }

        let token = issue_token(&self.jwt, &req.username)
            .map_err(|e| Status::internal(format!("failed to issue token: {e}")))?;
        Ok(Response::new(LoginResponse { token }))
    }
}

/// Bind `addr` and serve both services until the process is stopped.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(
    addr: &str,
    manager: Arc<dyn KeyManager>,
    jwt: JwtConfig,
    credentials: LoginCredentials,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid gRPC listen address {addr}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve_with_listener(listener, manager, jwt, credentials).await
}

/// Serve both services on an already-bound listener.
///
/// Split out from [`serve`] so tests can bind port 0 and discover the local
/// address before starting the server.
pub async fn serve_with_listener(
    listener: TcpListener,
    manager: Arc<dyn KeyManager>,
    jwt: JwtConfig,
    credentials: LoginCredentials,
) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    info!(addr = %local_addr, auth = !jwt.secret.is_empty(), "KMS gRPC server listening");

    let jwt = Arc::new(jwt);
    let kms = KmsGrpc::new(Arc::clone(&manager));
    let auth = AuthGrpc::new(Arc::clone(&jwt), credentials);
    let interceptor = BearerAuth::new(jwt);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    Server::builder()
        .layer(TraceLayer::new_for_grpc())
        .add_service(KmsServer::with_interceptor(kms, interceptor))
        .add_service(AuthServer::new(auth))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("gRPC server failed")?;

    // Zero in-memory key material before the process exits.
    manager.close().await;
    Ok(())
}
