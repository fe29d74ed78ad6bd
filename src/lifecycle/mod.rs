//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     pool.shutdown() / monitor.stop() / client.disconnect()
//!     → trigger broadcast
//!     → tickers and reconnect loops observe it and exit
//! ```
//!
//! # Design Decisions
//! - One coordinator per owning component, not a process-wide signal
//! - Background tasks also hold `Weak` owners and exit when those drop

pub mod shutdown;

pub use shutdown::Shutdown;
