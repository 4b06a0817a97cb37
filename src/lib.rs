//! pgpump - streaming COPY FROM STDIN bulk loads
//!
//! A backpressure-aware write sink that sequences the Postgres copy-in
//! handshake, frames outgoing row data, and settles exactly once per
//! operation with either the backend's affected-row count or an error.

pub mod connection;
pub mod copy_in;
pub mod protocol;

pub use connection::CopyConnection;
pub use copy_in::{copy_in, CopyInConfig, CopyInEvents, CopyInSink, DEFAULT_MAX_BUFFER};
