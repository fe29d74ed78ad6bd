//! Protocol negotiation subsystem.
//!
//! # Data Flow
//! ```text
//! connect():
//!     rpc      → ConnectionPool::initialize → readiness check
//!     fallback → EventStreamTransport::connect
//!     auto     → rpc, on failure fallback (reason recorded, FellBack emitted)
//!
//! calls → ActiveTransport (pool lease or event stream)
//! failover/failback → switch_address → new pool, swap, old pool shut down
//! ```
//!
//! # Design Decisions
//! - The active transport lives in an `ArcSwapOption`; in-flight calls keep
//!   the transport they started on
//! - Connect, disconnect and address switches are serialized

pub mod negotiator;
pub mod protocol;

pub use negotiator::ProtocolNegotiator;
pub use protocol::{ActiveTransport, Protocol, ProtocolEvent};
