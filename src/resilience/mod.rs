//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Unary call:
//!     → timeouts.rs (per-attempt deadline)
//!     → On failure: retries.rs (retryable? linear delay, try again)
//!
//! Broken session or stream:
//!     → backoff.rs (exponential delay with jitter, bounded attempts)
//! ```
//!
//! # Design Decisions
//! - Every remote call has a deadline
//! - Reconnect loops share one backoff schedule
//! - Exhaustion is reported as a typed error, never a panic

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use backoff::Backoff;
pub use retries::RetryPolicy;
pub use timeouts::with_timeout;
