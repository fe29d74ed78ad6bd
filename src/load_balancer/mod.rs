//! Connection pooling and load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Unary call
//!     → pool.rs acquire()
//!         → ready connections below their concurrency cap
//!         → apply strategy:
//!             - round_robin.rs (cyclic index)
//!             - least_conn.rs (fewest in-flight, earliest on ties)
//!             - random.rs (uniform)
//!             - weighted.rs (endpoint weight proportional)
//!         → none? create one if below max, else queue (FIFO, timeout)
//!     → ConnectionLease (in-flight +1; drop → -1 and hand off to oldest waiter)
//! ```
//!
//! # Design Decisions
//! - Strategies are stateless apart from their own counters; the pool owns
//!   every connection record
//! - Each connection record has its own lock; the pool map is a DashMap
//! - Broken connections reconnect in the background with bounded backoff

pub mod connection;
pub mod least_conn;
pub mod pool;
pub mod random;
pub mod round_robin;
pub mod weighted;

use std::sync::Arc;

use crate::config::schema::LoadBalanceStrategy;
use connection::PooledConnection;

pub use connection::{ConnectionId, ConnectionState};
pub use pool::{ConnectionLease, ConnectionPool, ConnectionSnapshot, PoolEvent, PoolStats};

/// Trait for load balancing algorithms.
///
/// `candidates` are already filtered to ready connections with spare
/// capacity, in stable id order.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn select(&self, candidates: &[Arc<PooledConnection>]) -> Option<Arc<PooledConnection>>;
}

/// Build the balancer for a configured strategy.
pub fn balancer_for(strategy: LoadBalanceStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        LoadBalanceStrategy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        LoadBalanceStrategy::LeastConnections => Box::new(least_conn::LeastConnections::new()),
        LoadBalanceStrategy::Random => Box::new(random::Random::new()),
        LoadBalanceStrategy::Weighted => Box::new(weighted::Weighted::new()),
    }
}
