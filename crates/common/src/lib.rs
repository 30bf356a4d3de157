//! Common types shared across the KMS crates: the envelope codec used for
//! at-rest storage of encrypted fields, and the JSON protocol types of the
//! HTTP gateway.

pub mod envelope;
pub mod protocol;

pub use envelope::{combine, split, EnvelopeError, NONCE_SIZE};
