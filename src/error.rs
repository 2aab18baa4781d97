//! Canonical error and result types for the crate.
//!
//! This module defines the single public `WirebusError` surface used by
//! connection setup, session operations, and the consumer/producer runtime.

use std::io;

/// Top-level error type exposed by `wirebus`.
///
/// `WirebusError` distinguishes caller mistakes (invalid destinations or
/// operations), lifecycle violations (use after close), broker rejections,
/// and transport failures.
#[derive(Debug, thiserror::Error)]
pub enum WirebusError {
    /// A consumer or producer was created without a destination.
    #[error("a destination must be specified")]
    InvalidDestination,
    /// The requested operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The object was closed or shut down before the call.
    #[error("{0} has been closed")]
    Disposed(&'static str),
    /// The connection failed asynchronously; observed by receivers that wake
    /// with no dispatch available.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    /// The broker rejected a command sent via a synchronous request.
    #[error("broker rejected request: {0}")]
    Broker(String),
    /// A commit was rejected by the broker and the transaction was rolled
    /// back.
    #[error("transaction rolled back")]
    TransactionRolledBack(#[source] Box<WirebusError>),
    /// A destination or broker URI could not be parsed.
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    /// A synchronous request did not complete within its timeout.
    #[error("request timed out")]
    RequestTimeout,
    /// An error in the underlying transport.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Canonical result alias used by `wirebus` public APIs.
pub type Result<T> = std::result::Result<T, WirebusError>;
