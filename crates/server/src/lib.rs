//! Library surface of the KMS server.
//!
//! Exposed as a crate so that integration tests (and the ETL worker's test
//! suite) can run the gRPC services in-process against a loopback listener.

pub mod auth;
pub mod config;
pub mod grpc;
pub mod keymgr;
pub mod telemetry;
