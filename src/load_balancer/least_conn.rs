//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{connection::PooledConnection, LoadBalancer};

/// Least connections selector.
/// Selects the connection with the fewest in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, candidates: &[Arc<PooledConnection>]) -> Option<Arc<PooledConnection>> {
        // min_by_key keeps the first minimum, so ties go to the earliest index
        candidates.iter().min_by_key(|c| c.in_flight()).cloned()
    }
}
