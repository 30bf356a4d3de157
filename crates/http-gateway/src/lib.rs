//! Library surface of the HTTP gateway, exposed so integration tests can
//! build the router against an in-process upstream.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod telemetry;
