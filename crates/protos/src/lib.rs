//! Generated gRPC bindings for the KMS wire API.
//!
//! The proto sources live under `api/`; code generation runs at build time
//! via `tonic-prost-build` with a vendored `protoc`.

pub mod v1 {
    tonic::include_proto!("kms.v1");
}
