//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{connection::PooledConnection, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through connections.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, candidates: &[Arc<PooledConnection>]) -> Option<Arc<PooledConnection>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let c1 = Arc::new(PooledConnection::new("127.0.0.1:8080", 1, 100));
        let c2 = Arc::new(PooledConnection::new("127.0.0.1:8081", 1, 100));
        let candidates = vec![c1.clone(), c2.clone()];

        assert_eq!(lb.select(&candidates).unwrap().id(), c1.id());
        assert_eq!(lb.select(&candidates).unwrap().id(), c2.id());
        assert_eq!(lb.select(&candidates).unwrap().id(), c1.id());
    }

    #[test]
    fn test_each_connection_once_per_cycle() {
        let lb = RoundRobin::new();
        let candidates: Vec<_> = (0..5)
            .map(|i| Arc::new(PooledConnection::new(format!("10.0.0.{i}:3593"), 1, 100)))
            .collect();

        for _ in 0..3 {
            let mut seen = HashMap::new();
            for _ in 0..candidates.len() {
                *seen.entry(lb.select(&candidates).unwrap().id()).or_insert(0) += 1;
            }
            assert_eq!(seen.len(), candidates.len());
            assert!(seen.values().all(|n| *n == 1));
        }
    }
}
