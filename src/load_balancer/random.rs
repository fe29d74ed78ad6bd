//! Uniform random load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{connection::PooledConnection, LoadBalancer};

#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Random {
    fn select(&self, candidates: &[Arc<PooledConnection>]) -> Option<Arc<PooledConnection>> {
        if candidates.is_empty() {
            return None;
        }
        Some(Arc::clone(&candidates[fastrand::usize(..candidates.len())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_covers_all_candidates() {
        let lb = Random::new();
        let candidates: Vec<_> = (0..3)
            .map(|i| Arc::new(PooledConnection::new(format!("10.0.0.{i}:3593"), 1, 100)))
            .collect();

        let seen: HashSet<_> = (0..300)
            .map(|_| lb.select(&candidates).unwrap().id())
            .collect();
        assert_eq!(seen.len(), 3);
        assert!(lb.select(&[]).is_none());
    }
}
