//! Resilient client transport for a remote authorization decision service.
//!
//! Binary RPC over pooled TCP sessions with an event-stream fallback,
//! backpressured decision streams, health-driven failover and failback,
//! trace propagation and Prometheus metrics.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod negotiation;
pub mod observability;
pub mod resilience;
pub mod stream;
pub mod transport;

pub use client::AuthzClient;
pub use codec::{CheckRequest, CheckResponse, Effect, Principal, Resource};
pub use config::schema::ClientConfig;
pub use error::{Result, TransportError};
pub use lifecycle::Shutdown;
pub use negotiation::{Protocol, ProtocolEvent};
