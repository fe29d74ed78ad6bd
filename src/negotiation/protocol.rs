//! Active protocol and the transport behind it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{CheckRequest, CheckResponse, Metadata};
use crate::error::{Result, TransportError};
use crate::load_balancer::ConnectionPool;
use crate::transport::{EventStreamTransport, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Pooled binary RPC.
    Rpc,
    /// Event-stream fallback over HTTP.
    EventStream,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rpc => "rpc",
            Protocol::EventStream => "event_stream",
        }
    }

    /// Only binary RPC carries bidirectional streams.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, Protocol::Rpc)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Connected { protocol: Protocol, address: String },
    FellBack { reason: String },
    AddressSwitched { address: String },
    Disconnected,
}

/// Whatever transport currently serves calls.
#[derive(Clone)]
pub enum ActiveTransport {
    Rpc(Arc<ConnectionPool>),
    EventStream(Arc<EventStreamTransport>),
}

impl ActiveTransport {
    pub fn protocol(&self) -> Protocol {
        match self {
            ActiveTransport::Rpc(_) => Protocol::Rpc,
            ActiveTransport::EventStream(_) => Protocol::EventStream,
        }
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        match self {
            ActiveTransport::Rpc(pool) => Some(pool),
            ActiveTransport::EventStream(_) => None,
        }
    }

    pub async fn check(
        &self,
        request: &CheckRequest,
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<CheckResponse> {
        match self {
            ActiveTransport::Rpc(pool) => {
                let lease = pool.acquire().await?;
                let session = lease.session()?;
                let result = session.check(request, headers, timeout).await;
                if let Err(e) = &result {
                    lease.report_failure(e);
                }
                result
            }
            ActiveTransport::EventStream(transport) => transport.check(request, headers, timeout).await,
        }
    }

    pub async fn check_batch(
        &self,
        requests: &[CheckRequest],
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<Vec<CheckResponse>> {
        match self {
            ActiveTransport::Rpc(pool) => {
                let lease = pool.acquire().await?;
                let session = lease.session()?;
                let result = session.check_batch(requests, headers, timeout).await;
                if let Err(e) = &result {
                    lease.report_failure(e);
                }
                result
            }
            ActiveTransport::EventStream(transport) => {
                transport.check_batch(requests, headers, timeout).await
            }
        }
    }

    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        match self {
            ActiveTransport::Rpc(pool) => {
                let lease = pool.acquire().await?;
                let result = lease.session()?.probe(timeout).await;
                if let Err(e) = &result {
                    lease.report_failure(e);
                }
                result
            }
            ActiveTransport::EventStream(transport) => transport.probe(timeout).await,
        }
    }

    pub async fn close(&self) {
        match self {
            ActiveTransport::Rpc(pool) => pool.shutdown().await,
            ActiveTransport::EventStream(transport) => transport.close().await,
        }
    }

    pub fn is_usable(&self) -> Result<()> {
        match self {
            ActiveTransport::Rpc(pool) if pool.is_closed() => Err(TransportError::ShuttingDown),
            ActiveTransport::EventStream(transport) if transport.is_closed() => {
                Err(TransportError::ShuttingDown)
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ActiveTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveTransport::Rpc(pool) => f.debug_tuple("Rpc").field(pool).finish(),
            ActiveTransport::EventStream(transport) => {
                f.debug_tuple("EventStream").field(&transport.base_url().as_str()).finish()
            }
        }
    }
}
