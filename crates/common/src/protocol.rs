//! Request and response bodies for the HTTP gateway's JSON surface.
//!
//! Binary fields (`ciphertext`, `nonce`) are carried as standard base64
//! strings; the combined `encrypted` form is an envelope as produced by
//! [`crate::envelope::combine`].

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Encrypt
// ---------------------------------------------------------------------------

/// Request body for `POST /api/v1/encrypt` and items of the batch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptRequest {
    /// UTF-8 plaintext to encrypt.
    pub plaintext: String,
    /// Optional key hint forwarded to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Successful response body for a single encryption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptResponse {
    /// Base64-encoded ciphertext with authentication tag.
    pub ciphertext: String,
    /// Base64-encoded 12-byte nonce.
    pub nonce: String,
}

impl EncryptResponse {
    /// Whether this slot carries a result (batch slots for failed items are
    /// left empty to preserve index alignment).
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Batch encrypt
// ---------------------------------------------------------------------------

/// Request body for `POST /api/v1/encrypt/batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEncryptRequest {
    /// Items to encrypt; at most [`MAX_BATCH_ITEMS`].
    pub items: Vec<EncryptRequest>,
}

/// Upper bound on the number of items accepted per batch request.
pub const MAX_BATCH_ITEMS: usize = 1000;

/// Response body for `POST /api/v1/encrypt/batch`.
///
/// `results[i]` always corresponds to `items[i]` of the request. A slot whose
/// item failed is an empty [`EncryptResponse`], and the failure message is
/// appended to `errors` prefixed with the item index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEncryptResponse {
    pub results: Vec<EncryptResponse>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Decrypt
// ---------------------------------------------------------------------------

/// Request body for `POST /api/v1/decrypt`.
///
/// Two forms are accepted: explicit `ciphertext` + `nonce` fields, or the
/// combined `encrypted` envelope which the gateway splits server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecryptRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Combined envelope form: `base64(nonce ‖ ciphertext)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Successful response body for `POST /api/v1/decrypt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptResponse {
    pub plaintext: String,
}

// ---------------------------------------------------------------------------
// Errors and health
// ---------------------------------------------------------------------------

/// Error body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_request_round_trip() {
        let req = EncryptRequest {
            plaintext: "4111111111111111".into(),
            key_id: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("key_id"));
        let decoded: EncryptRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.plaintext, "4111111111111111");
    }

    #[test]
    fn decrypt_request_accepts_combined_form() {
        let decoded: DecryptRequest =
            serde_json::from_str(r#"{"encrypted":"AAECAw=="}"#).unwrap();
        assert_eq!(decoded.encrypted.as_deref(), Some("AAECAw=="));
        assert!(decoded.ciphertext.is_none());
    }

    #[test]
    fn decrypt_request_accepts_split_form() {
        let decoded: DecryptRequest =
            serde_json::from_str(r#"{"ciphertext":"qq==","nonce":"ww=="}"#).unwrap();
        assert!(decoded.ciphertext.is_some());
        assert!(decoded.nonce.is_some());
        assert!(decoded.encrypted.is_none());
    }

    #[test]
    fn empty_batch_slot_is_detectable() {
        assert!(EncryptResponse::default().is_empty());
    }

    #[test]
    fn error_response_shape() {
        let json = serde_json::to_string(&ErrorResponse::new("plaintext is required")).unwrap();
        assert_eq!(json, r#"{"error":"plaintext is required"}"#);
    }

    #[test]
    fn health_response_shape() {
        let json = serde_json::to_string(&HealthResponse::ok()).unwrap();
        assert_eq!(json, r#"{"status":"ok"}"#);
    }
}
