//! End-to-end tests: Axum router → gRPC client → in-process KMS server.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tonic::transport::Channel;
use tower::ServiceExt;

use kms_common::envelope;
use kms_common::protocol::{
    BatchEncryptRequest, BatchEncryptResponse, DecryptResponse, EncryptRequest, EncryptResponse,
    ErrorResponse,
};
use kms_http_gateway::router;
use kms_http_gateway::state::AppState;
use kms_server::auth::JwtConfig;
use kms_server::grpc::{serve_with_listener, LoginCredentials};
use kms_server::keymgr::SoftwareKeyManager;

const ZERO_KEY_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Start an in-process KMS server and return a gateway router wired to it.
async fn gateway(jwt: JwtConfig, fallback_token: Option<String>) -> axum::Router {
    let manager = Arc::new(SoftwareKeyManager::from_hex(ZERO_KEY_HEX).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let credentials = LoginCredentials {
        username: "demo".into(),
        password: "demo123".into(),
    };
    tokio::spawn(async move {
        serve_with_listener(listener, manager, jwt, credentials)
            .await
            .unwrap();
    });

    let endpoint = format!("http://{addr}");
    let channel = loop {
        match Channel::from_shared(endpoint.clone()).unwrap().connect().await {
            Ok(channel) => break channel,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    router::build(AppState::new(channel, fallback_token))
}

fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_ok() {
    let app = gateway(JwtConfig::disabled(), None).await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = read_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn encrypt_then_decrypt_split_form() {
    let app = gateway(JwtConfig::disabled(), None).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/encrypt",
            &EncryptRequest {
                plaintext: "4111111111111111".into(),
                key_id: None,
            },
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let enc: EncryptResponse = read_json(response).await;
    assert!(!enc.ciphertext.is_empty());
    assert!(!enc.nonce.is_empty());

    let response = app
        .oneshot(post_json(
            "/api/v1/decrypt",
            &serde_json::json!({"ciphertext": enc.ciphertext, "nonce": enc.nonce}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let dec: DecryptResponse = read_json(response).await;
    assert_eq!(dec.plaintext, "4111111111111111");
}

#[tokio::test]
async fn decrypt_combined_form() {
    let app = gateway(JwtConfig::disabled(), None).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/encrypt",
            &EncryptRequest {
                plaintext: "combined".into(),
                key_id: None,
            },
        ))
        .await
        .unwrap();
    let enc: EncryptResponse = read_json(response).await;

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let nonce = STANDARD.decode(&enc.nonce).unwrap();
    let ciphertext = STANDARD.decode(&enc.ciphertext).unwrap();
    let combined = envelope::combine(&nonce, &ciphertext);

    let response = app
        .oneshot(post_json(
            "/api/v1/decrypt",
            &serde_json::json!({"encrypted": combined}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let dec: DecryptResponse = read_json(response).await;
    assert_eq!(dec.plaintext, "combined");
}

#[tokio::test]
async fn decrypt_rejects_malformed_envelope() {
    let app = gateway(JwtConfig::disabled(), None).await;
    let response = app
        .oneshot(post_json(
            "/api/v1/decrypt",
            &serde_json::json!({"encrypted": "!!!"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ErrorResponse = read_json(response).await;
    assert!(err.error.contains("invalid encrypted format"));
}

#[tokio::test]
async fn encrypt_requires_plaintext() {
    let app = gateway(JwtConfig::disabled(), None).await;
    let response = app
        .oneshot(post_json(
            "/api/v1/encrypt",
            &serde_json::json!({"plaintext": ""}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_preserves_input_order() {
    let app = gateway(JwtConfig::disabled(), None).await;

    let items: Vec<EncryptRequest> = (0..20)
        .map(|i| EncryptRequest {
            plaintext: format!("pan-{i}"),
            key_id: None,
        })
        .collect();
    let response = app
        .clone()
        .oneshot(post_json("/api/v1/encrypt/batch", &BatchEncryptRequest { items }))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let batch: BatchEncryptResponse = read_json(response).await;
    assert_eq!(batch.results.len(), 20);
    assert!(batch.errors.is_empty());

    // Decrypting results[i] must yield the i-th input plaintext.
    for (i, result) in batch.results.iter().enumerate() {
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/decrypt",
                &serde_json::json!({"ciphertext": result.ciphertext, "nonce": result.nonce}),
            ))
            .await
            .unwrap();
        let dec: DecryptResponse = read_json(response).await;
        assert_eq!(dec.plaintext, format!("pan-{i}"));
    }
}

#[tokio::test]
async fn batch_with_auth_failure_keeps_alignment() {
    let jwt = JwtConfig {
        secret: "gateway-secret".into(),
        audience: None,
        issuer: None,
        ttl: Duration::from_secs(60),
    };
    // No fallback token and no Authorization header: every item fails.
    let app = gateway(jwt, None).await;

    let items: Vec<EncryptRequest> = (0..3)
        .map(|i| EncryptRequest {
            plaintext: format!("pan-{i}"),
            key_id: None,
        })
        .collect();
    let response = app
        .oneshot(post_json("/api/v1/encrypt/batch", &BatchEncryptRequest { items }))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let batch: BatchEncryptResponse = read_json(response).await;

    // Slots stay aligned and empty; one indexed error per item.
    assert_eq!(batch.results.len(), 3);
    assert!(batch.results.iter().all(|r| r.is_empty()));
    assert_eq!(batch.errors.len(), 3);
    assert!(batch.errors[0].starts_with("item 0:"));
}

#[tokio::test]
async fn batch_rejects_oversized_requests() {
    let app = gateway(JwtConfig::disabled(), None).await;
    let items: Vec<EncryptRequest> = (0..1001)
        .map(|_| EncryptRequest {
            plaintext: "x".into(),
            key_id: None,
        })
        .collect();
    let response = app
        .oneshot(post_json("/api/v1/encrypt/batch", &BatchEncryptRequest { items }))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fallback_token_authenticates_requests() {
    let jwt = JwtConfig {
        secret: "gateway-secret".into(),
        audience: None,
        issuer: None,
        ttl: Duration::from_secs(60),
    };
    let token = kms_server::auth::issue_token(&jwt, "gateway").unwrap();
    let app = gateway(jwt, Some(token)).await;

    let response = app
        .oneshot(post_json(
            "/api/v1/encrypt",
            &EncryptRequest {
                plaintext: "secret".into(),
                key_id: None,
            },
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = gateway(JwtConfig::disabled(), None).await;
    let response = app
        .oneshot(Request::builder().uri("/unknown").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
