//! Bidirectional decision streams.
//!
//! # Data Flow
//! ```text
//! caller send()
//!     → manager.rs (direct write, or bounded FIFO queue)
//!     → StreamSink (transport buffer; Full → wait for drain)
//!
//! StreamSource
//!     → manager.rs read loop
//!     → latency.rs (match echoed request id)
//!     → StreamEvent::Response on the caller's channel
//! ```
//!
//! # Design Decisions
//! - One mutex per stream session; no lock is held across an await
//! - Notifications are typed events on an unbounded channel, in order
//! - Transport failures reconnect with the shared backoff; exhaustion is
//!   fatal for the stream only

pub mod latency;
pub mod manager;

pub use latency::LatencyTracker;
pub use manager::{SendOutcome, StreamEvent, StreamManager, StreamState, StreamStats};
