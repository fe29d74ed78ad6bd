//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Probe loop (monitor.rs):
//!     Periodic timer or check_now()
//!     → HealthProbe::probe (raced against the timeout)
//!     → Update state.rs
//!     → NOT_SERVING at the failover point → AddressSwitcher (next candidate)
//!     → SERVING away from the original → failback timer → AddressSwitcher
//!
//! State machine (state.rs):
//!     Unknown → Serving ←→ NotServing
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Per-connection probing lives in the pool; this monitor judges the
//!   client's active transport as a whole
//! - Address switches are serialized; a failed failover is reported, not retried
//! - Notifications are typed events on a broadcast channel

pub mod monitor;
pub mod state;

pub use monitor::{
    next_failover_index, AddressSwitcher, HealthEvent, HealthMonitor, HealthProbe,
    HealthSnapshot, HealthSubscription,
};
pub use state::{HealthRecord, HealthStatus, LinkState, ProbeResult};
