//! Error taxonomy for the transport layer.
//!
//! # Propagation
//! - Session-scoped failures (dial errors, broken streams) are recovered
//!   locally by reconnect loops and only surface once exhausted
//! - Caller-scoped failures (acquisition timeout, exhausted retries) are
//!   returned to the caller as typed errors
//! - Nothing here terminates the host process

use std::time::Duration;
use thiserror::Error;

use crate::config::loader::ConfigError;

/// Errors produced by the client transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dial or handshake failure against an endpoint.
    #[error("connection error: {0}")]
    Connection(String),

    /// No pooled connection became available in time.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    /// The pool or client is shutting down.
    #[error("transport is shutting down")]
    ShuttingDown,

    /// The remote service reported a failure.
    #[error("remote call failed ({code}): {message}")]
    Call { code: String, message: String },

    /// A single call exceeded its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Unary retries were used up.
    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<TransportError>,
    },

    /// Transport-level failure on a duplex stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Reconnection gave up.
    #[error("reconnect abandoned after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No transport is connected.
    #[error("client is not connected")]
    NotConnected,

    /// Operation not available on the active transport.
    #[error("unsupported on the active transport: {0}")]
    Unsupported(&'static str),

    /// Failover or failback could not switch address.
    #[error("failover error: {0}")]
    Failover(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Whether a unary call that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_)
                | TransportError::Call { .. }
                | TransportError::Timeout(_)
                | TransportError::Stream(_)
                | TransportError::Io(_)
                | TransportError::Http(_)
        )
    }

    /// Whether the error means the underlying session is unusable.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_) | TransportError::Io(_) | TransportError::Protocol(_)
        )
    }

    /// Stable label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Connection(_) => "connection",
            TransportError::AcquireTimeout(_) => "acquire_timeout",
            TransportError::ShuttingDown => "shutting_down",
            TransportError::Call { .. } => "call",
            TransportError::Timeout(_) => "timeout",
            TransportError::RetriesExhausted { source, .. } => source.kind(),
            TransportError::Stream(_) => "stream",
            TransportError::ReconnectExhausted { .. } => "reconnect_exhausted",
            TransportError::Codec(_) => "codec",
            TransportError::Protocol(_) => "protocol",
            TransportError::NotConnected => "not_connected",
            TransportError::Unsupported(_) => "unsupported",
            TransportError::Failover(_) => "failover",
            TransportError::Config(_) => "config",
            TransportError::Io(_) => "io",
            TransportError::Http(_) => "http",
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
