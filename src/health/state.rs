//! Server health state machine.
//!
//! # States
//! - Unknown: no verdict yet
//! - Serving: probes succeed
//! - NotServing: probes fail
//!
//! # State Transitions
//! ```text
//! Unknown | NotServing → Serving: consecutive successes >= healthy_threshold
//! Unknown | Serving → NotServing: consecutive failures >= unhealthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping; status is sticky between thresholds
//! - A success resets the failure streak and vice versa
//! - History keeps the most recent probes only

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Serving,
    NotServing,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Serving => "serving",
            HealthStatus::NotServing => "not_serving",
        }
    }
}

/// Where the client stands with respect to its current address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Connected,
    FailingOver,
    FailingBack,
    /// The last address switch failed.
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub checked_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: HealthStatus,
    pub to: HealthStatus,
}

#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub history: VecDeque<ProbeResult>,
    pub link: LinkState,
    pub current_index: usize,
    pub original_index: usize,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::new(0)
    }
}

impl HealthRecord {
    pub fn new(original_index: usize) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
            link: LinkState::Connected,
            current_index: original_index,
            original_index,
        }
    }

    /// Record a probe and apply the thresholds. Returns the transition, if any.
    pub fn apply(
        &mut self,
        result: ProbeResult,
        healthy_threshold: u32,
        unhealthy_threshold: u32,
    ) -> Option<StatusChange> {
        let success = result.success;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(result);

        let from = self.status;
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if from != HealthStatus::Serving && self.consecutive_successes >= healthy_threshold {
                self.status = HealthStatus::Serving;
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if from != HealthStatus::NotServing && self.consecutive_failures >= unhealthy_threshold {
                self.status = HealthStatus::NotServing;
            }
        }

        (self.status != from).then_some(StatusChange {
            from,
            to: self.status,
        })
    }

    pub fn on_original(&self) -> bool {
        self.current_index == self.original_index
    }

    pub fn last_probe(&self) -> Option<&ProbeResult> {
        self.history.back()
    }
}
