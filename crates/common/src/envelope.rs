//! Envelope codec: the canonical at-rest serialisation of an encrypted value.
//!
//! # Format
//!
//! ```text
//! base64_std( nonce(12) ‖ ciphertext ‖ tag(16) )
//! ```
//!
//! Collapsing nonce and ciphertext into a single text-safe column removes the
//! class of bugs where the two halves get separated between systems. The
//! envelope is self-describing given the agreed nonce length.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Byte length of an AES-GCM nonce (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Errors produced when parsing an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The envelope is not valid base64.
    #[error("malformed envelope: invalid base64")]
    InvalidBase64(#[from] base64::DecodeError),

    /// The decoded buffer is shorter than the nonce it must begin with.
    #[error("malformed envelope: decoded {len} bytes, expected at least {nonce_size}")]
    TooShort { len: usize, nonce_size: usize },
}

/// Combine a nonce and ciphertext into a single base64 envelope string.
pub fn combine(nonce: &[u8], ciphertext: &[u8]) -> String {
    let mut combined = Vec::with_capacity(nonce.len() + ciphertext.len());
    combined.extend_from_slice(nonce);
    combined.extend_from_slice(ciphertext);
    STANDARD.encode(combined)
}

/// Split a base64 envelope string back into `(nonce, ciphertext)`.
///
/// `nonce_size` is [`NONCE_SIZE`] for AES-GCM.
///
/// # Errors
///
/// Returns [`EnvelopeError`] if the string is not valid base64 or the decoded
/// buffer is shorter than `nonce_size`.
pub fn split(envelope: &str, nonce_size: usize) -> Result<(Vec<u8>, Vec<u8>), EnvelopeError> {
    let mut combined = STANDARD.decode(envelope)?;
    if combined.len() < nonce_size {
        return Err(EnvelopeError::TooShort {
            len: combined.len(),
            nonce_size,
        });
    }
    let ciphertext = combined.split_off(nonce_size);
    Ok((combined, ciphertext))
}
