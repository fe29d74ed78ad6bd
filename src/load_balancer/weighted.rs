//! Weighted random load balancing strategy.
//!
//! Each connection inherits its endpoint's weight; selection probability is
//! proportional to it.

use rand::distributions::{Distribution, WeightedIndex};
use std::sync::Arc;

use crate::load_balancer::{connection::PooledConnection, LoadBalancer};

#[derive(Debug, Default)]
pub struct Weighted;

impl Weighted {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Weighted {
    fn select(&self, candidates: &[Arc<PooledConnection>]) -> Option<Arc<PooledConnection>> {
        if candidates.is_empty() {
            return None;
        }
        match WeightedIndex::new(candidates.iter().map(|c| c.weight())) {
            Ok(dist) => {
                let index = dist.sample(&mut rand::thread_rng());
                Some(Arc::clone(&candidates[index]))
            }
            // all weights zero
            Err(_) => Some(Arc::clone(&candidates[0])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_shape_distribution() {
        let lb = Weighted::new();
        let heavy = Arc::new(PooledConnection::new("10.0.0.1:3593", 9, 100));
        let light = Arc::new(PooledConnection::new("10.0.0.2:3593", 1, 100));
        let candidates = vec![heavy.clone(), light.clone()];

        let heavy_hits = (0..2_000)
            .filter(|_| lb.select(&candidates).unwrap().id() == heavy.id())
            .count();
        assert!(heavy_hits > 1_500, "heavy picked {heavy_hits} times");
        assert!(heavy_hits < 2_000);
    }

    #[test]
    fn test_zero_weights_fall_back_to_first() {
        let lb = Weighted::new();
        let a = Arc::new(PooledConnection::new("10.0.0.1:3593", 0, 100));
        let b = Arc::new(PooledConnection::new("10.0.0.2:3593", 0, 100));
        assert_eq!(lb.select(&[a.clone(), b]).unwrap().id(), a.id());
    }
}
