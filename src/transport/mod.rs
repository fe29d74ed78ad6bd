//! Transport subsystem.
//!
//! # Data Flow
//! ```text
//! Binary RPC (tcp.rs):
//!     Connector::connect(address) → Session (one socket, calls multiplexed by call id)
//!     Connector::open_stream(address) → StreamSink + StreamSource (dedicated socket)
//!
//! Event-stream fallback (event_stream.rs):
//!     POST /v1/check, /v1/check/batch → ack
//!     GET /v1/events (SSE, sse.rs) → typed events → correlated by request id
//! ```
//!
//! # Design Decisions
//! - The pool and stream manager only see these traits, so tests swap in
//!   scripted sessions without sockets
//! - Stream sinks never block; a full buffer hands the message back

pub mod event_stream;
pub mod sse;
pub mod tcp;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{CheckRequest, CheckResponse};
use crate::error::Result;

pub use crate::codec::frame::Metadata;
pub use event_stream::EventStreamTransport;
pub use tcp::TcpConnector;

/// One established session to a server endpoint.
#[async_trait]
pub trait Session: Send + Sync {
    async fn check(
        &self,
        request: &CheckRequest,
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<CheckResponse>;

    async fn check_batch(
        &self,
        requests: &[CheckRequest],
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<Vec<CheckResponse>>;

    /// Liveness probe, bounded by `timeout`.
    async fn probe(&self, timeout: Duration) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dials sessions and streams.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Session>>;

    async fn open_stream(&self, address: &str, headers: &Metadata) -> Result<StreamParts>;
}

/// Why a stream write was refused. The message is handed back.
#[derive(Debug)]
pub enum SinkError {
    /// The transport buffer is at capacity; retry after `drained()`.
    Full(CheckRequest),
    /// The stream is gone.
    Closed(CheckRequest),
}

/// Outbound half of a duplex stream.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Non-blocking write.
    fn try_write(&self, request: CheckRequest) -> std::result::Result<(), SinkError>;

    /// Resolves once the sink can accept writes again, or is closed.
    async fn drained(&self);

    /// Half-close the stream after pending writes.
    async fn close(&self);
}

/// Inbound half of a duplex stream.
#[async_trait]
pub trait StreamSource: Send {
    /// Next response, `None` once the server ends the stream.
    async fn next(&mut self) -> Option<Result<CheckResponse>>;
}

pub struct StreamParts {
    pub sink: Arc<dyn StreamSink>,
    pub source: Box<dyn StreamSource>,
}

/// Produces a fresh duplex stream on every call, used for (re)opening.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn open(&self) -> Result<StreamParts>;
}

/// Opens streams against a fixed address through a connector.
pub struct ConnectorStreamFactory {
    connector: Arc<dyn Connector>,
    address: String,
    headers: Metadata,
}

impl ConnectorStreamFactory {
    pub fn new(connector: Arc<dyn Connector>, address: impl Into<String>, headers: Metadata) -> Self {
        Self {
            connector,
            address: address.into(),
            headers,
        }
    }
}

#[async_trait]
impl StreamFactory for ConnectorStreamFactory {
    async fn open(&self) -> Result<StreamParts> {
        self.connector.open_stream(&self.address, &self.headers).await
    }
}
