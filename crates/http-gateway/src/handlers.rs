//! Axum request handlers for the REST surface.
//!
//! Each handler translates the JSON body onto the upstream gRPC call,
//! forwarding the caller's bearer token (or the configured fallback) and
//! mapping `tonic::Status` codes back onto HTTP statuses.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Code, Request};
use tracing::warn;

use kms_common::protocol::{
    BatchEncryptRequest, BatchEncryptResponse, DecryptRequest, DecryptResponse, EncryptRequest,
    EncryptResponse, ErrorResponse, HealthResponse, MAX_BATCH_ITEMS,
};
use kms_common::{envelope, NONCE_SIZE};
use kms_protos::v1 as pb;

use crate::router::REQUEST_TIMEOUT;
use crate::state::AppState;

/// Concurrency cap for upstream calls made by one batch request.
const MAX_CONCURRENT_UPSTREAM: usize = 50;

/// `GET /health` — liveness check.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

/// `POST /api/v1/encrypt` — encrypt a single plaintext upstream.
pub async fn encrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EncryptRequest>,
) -> Response {
    if req.plaintext.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "plaintext is required");
    }
    let token = match bearer_value(&headers, state.fallback_token.as_deref()) {
        Ok(token) => token,
        Err(resp) => return resp,
    };

    let mut client = state.kms.clone();
    match client.encrypt(upstream_request(encrypt_pb(req), &token)).await {
        Ok(resp) => {
            let resp = resp.into_inner();
            Json(EncryptResponse {
                ciphertext: STANDARD.encode(resp.ciphertext),
                nonce: STANDARD.encode(resp.nonce),
            })
            .into_response()
        }
        Err(status) => grpc_error_response(&status),
    }
}

/// `POST /api/v1/encrypt/batch` — fan one request out across up to
/// [`MAX_CONCURRENT_UPSTREAM`] concurrent upstream calls.
///
/// `results[i]` always corresponds to `items[i]`: each result is written into
/// a pre-sized slot by index, and failed slots stay empty with an indexed
/// message in `errors`. The response array is never filtered or compacted.
pub async fn encrypt_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BatchEncryptRequest>,
) -> Response {
    if req.items.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "items array is required");
    }
    if req.items.len() > MAX_BATCH_ITEMS {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("batch size cannot exceed {MAX_BATCH_ITEMS} items"),
        );
    }
    let token = match bearer_value(&headers, state.fallback_token.as_deref()) {
        Ok(token) => token,
        Err(resp) => return resp,
    };

    let mut results = vec![EncryptResponse::default(); req.items.len()];
    let mut failures: Vec<(usize, String)> = Vec::new();

    let outcomes: Vec<(usize, Result<pb::EncryptResponse, tonic::Status>)> =
        futures::stream::iter(req.items.into_iter().enumerate().map(|(index, item)| {
            let mut client = state.kms.clone();
            let token = token.clone();
            async move {
                let outcome = client
                    .encrypt(upstream_request(encrypt_pb(item), &token))
                    .await
                    .map(|resp| resp.into_inner());
                (index, outcome)
            }
        }))
        .buffer_unordered(MAX_CONCURRENT_UPSTREAM)
        .collect()
        .await;

    for (index, outcome) in outcomes {
        match outcome {
            Ok(resp) => {
                results[index] = EncryptResponse {
                    ciphertext: STANDARD.encode(resp.ciphertext),
                    nonce: STANDARD.encode(resp.nonce),
                };
            }
            Err(status) => failures.push((index, status.message().to_owned())),
        }
    }

    if !failures.is_empty() {
        warn!(failed = failures.len(), "batch encrypt had failing items");
    }
    failures.sort_unstable_by_key(|(index, _)| *index);
    let errors = failures
        .into_iter()
        .map(|(index, message)| format!("item {index}: {message}"))
        .collect();

    Json(BatchEncryptResponse { results, errors }).into_response()
}

/// `POST /api/v1/decrypt` — decrypt either an explicit `{ciphertext, nonce}`
/// pair or a combined `{encrypted}` envelope (split server-side).
pub async fn decrypt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DecryptRequest>,
) -> Response {
    let token = match bearer_value(&headers, state.fallback_token.as_deref()) {
        Ok(token) => token,
        Err(resp) => return resp,
    };

    let (nonce, ciphertext) = if let Some(encrypted) = &req.encrypted {
        match envelope::split(encrypted, NONCE_SIZE) {
            Ok(parts) => parts,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid encrypted format: {e}"),
                )
            }
        }
    } else {
        let Some(ciphertext_b64) = &req.ciphertext else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "either encrypted or ciphertext+nonce is required",
            );
        };
        let Some(nonce_b64) = &req.nonce else {
            return error_response(StatusCode::BAD_REQUEST, "nonce is required");
        };
        let Ok(ciphertext) = STANDARD.decode(ciphertext_b64) else {
            return error_response(StatusCode::BAD_REQUEST, "invalid ciphertext encoding");
        };
        let Ok(nonce) = STANDARD.decode(nonce_b64) else {
            return error_response(StatusCode::BAD_REQUEST, "invalid nonce encoding");
        };
        (nonce, ciphertext)
    };

    let request = pb::DecryptRequest {
        ciphertext,
        nonce,
        key_id: req.key_id.unwrap_or_default(),
    };

    let mut client = state.kms.clone();
    match client.decrypt(upstream_request(request, &token)).await {
        Ok(resp) => {
            let plaintext = String::from_utf8_lossy(&resp.into_inner().plaintext).into_owned();
            Json(DecryptResponse { plaintext }).into_response()
        }
        Err(status) => grpc_error_response(&status),
    }
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    error_response(StatusCode::NOT_FOUND, "the requested resource does not exist")
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn encrypt_pb(item: EncryptRequest) -> pb::EncryptRequest {
    pb::EncryptRequest {
        plaintext: item.plaintext.into_bytes(),
        key_id: item.key_id.unwrap_or_default(),
    }
}

/// Build an upstream request with the deadline and bearer metadata attached.
fn upstream_request<T>(message: T, token: &Option<MetadataValue<Ascii>>) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(REQUEST_TIMEOUT);
    if let Some(token) = token {
        request.metadata_mut().insert("authorization", token.clone());
    }
    request
}

/// Resolve the bearer header to forward: the caller's `Authorization` header
/// verbatim when present, otherwise the configured fallback token.
fn bearer_value(
    headers: &HeaderMap,
    fallback_token: Option<&str>,
) -> Result<Option<MetadataValue<Ascii>>, Response> {
    let raw = match headers.get(header::AUTHORIZATION) {
        Some(value) => match value.to_str() {
            Ok(s) => Some(s.to_owned()),
            Err(_) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "authorization header contains non-ASCII characters",
                ))
            }
        },
        None => fallback_token.map(|token| format!("Bearer {token}")),
    };

    match raw {
        None => Ok(None),
        Some(raw) => MetadataValue::try_from(raw.as_str())
            .map(Some)
            .map_err(|_| {
                error_response(StatusCode::BAD_REQUEST, "invalid authorization header")
            }),
    }
}

fn grpc_error_response(status: &tonic::Status) -> Response {
    error_response(grpc_status_to_http(status.code()), status.message())
}

fn grpc_status_to_http(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded | Code::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorResponse::new(message))).into_response()
}
