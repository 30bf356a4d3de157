//! Bearer-token authentication: HS256 token issuance for `Login` and a tonic
//! interceptor that gates every other RPC.
//!
//! Algorithm substitution (`alg=none`, RS256) is rejected explicitly, and
//! validation runs with zero leeway so expiry is exact. All failures surface
//! as `Unauthenticated` with stable, non-revealing messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::{service::Interceptor, Request, Status};

/// Default lifetime of issued tokens.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// How incoming bearer tokens are validated and outgoing tokens are signed.
#[derive(Debug, Clone, Default)]
pub struct JwtConfig {
    /// HMAC secret (HS256). Empty disables validation entirely.
    pub secret: String,
    /// Expected audience; `None` disables the check.
    pub audience: Option<String>,
    /// Expected issuer; `None` disables the check.
    pub issuer: Option<String>,
    /// Lifetime applied to issued tokens.
    pub ttl: Duration,
}

impl JwtConfig {
    /// Config with validation disabled (open deployment).
    pub fn disabled() -> Self {
        Self {
            ttl: DEFAULT_TOKEN_TTL,
            ..Self::default()
        }
    }
}

/// Registered claims carried by issued tokens.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
}

/// Authentication failures. Every variant maps to `Unauthenticated`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingHeader,
    #[error("invalid authorization scheme")]
    InvalidScheme,
    #[error("empty bearer token")]
    EmptyToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("invalid audience")]
    InvalidAudience,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("JWT secret not configured")]
    SecretNotConfigured,
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        Status::unauthenticated(err.to_string())
    }
}

/// Sign a token for `subject` using `cfg`.
///
/// # Errors
///
/// Returns [`AuthError::SecretNotConfigured`] when no secret is set.
pub fn issue_token(cfg: &JwtConfig, subject: &str) -> Result<String, AuthError> {
    if cfg.secret.is_empty() {
        return Err(AuthError::SecretNotConfigured);
    }

    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: subject.to_owned(),
        iat: now,
        exp: now + cfg.ttl.as_secs() as i64,
        nbf: None,
        aud: cfg.audience.clone(),
        iss: cfg.issuer.clone(),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidToken)
}

/// Validate an `Authorization` header value against `cfg`.
///
/// A no-op when no secret is configured. Otherwise requires
/// `Bearer <token>` (scheme match is case-insensitive), an HS256 signature
/// under the configured secret, an unexpired/valid-time window, and matching
/// audience/issuer claims when those are configured.
pub fn verify_bearer(cfg: &JwtConfig, header: Option<&str>) -> Result<(), AuthError> {
    if cfg.secret.is_empty() {
        return Ok(());
    }

    let header = header.ok_or(AuthError::MissingHeader)?;
    let (scheme, rest) = header.split_once(' ').ok_or(AuthError::InvalidScheme)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidScheme);
    }
    let token = rest.trim();
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }

    // HS256 only; a token claiming any other algorithm fails here instead of
    // being trusted implicitly.
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;
    validation.validate_nbf = true;
    // Audience and issuer are checked manually below for exact-match
    // semantics and stable error strings.
    validation.validate_aud = false;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        jsonwebtoken::errors::ErrorKind::ImmatureSignature => AuthError::NotYetValid,
        _ => AuthError::InvalidToken,
    })?;

    if let Some(expected) = &cfg.audience {
        if data.claims.aud.as_deref() != Some(expected.as_str()) {
            return Err(AuthError::InvalidAudience);
        }
    }
    if let Some(expected) = &cfg.issuer {
        if data.claims.iss.as_deref() != Some(expected.as_str()) {
            return Err(AuthError::InvalidIssuer);
        }
    }

    Ok(())
}

/// Tonic interceptor enforcing bearer auth on the `Kms` service.
///
/// Installed via `KmsServer::with_interceptor`, so the `Auth` service (and
/// with it `Login`) is never gated.
#[derive(Clone)]
pub struct BearerAuth {
    cfg: Arc<JwtConfig>,
}

impl BearerAuth {
    pub fn new(cfg: Arc<JwtConfig>) -> Self {
        Self { cfg }
    }
}

impl Interceptor for BearerAuth {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok());
        verify_bearer(&self.cfg, header)?;
        Ok(request)
    }
}
