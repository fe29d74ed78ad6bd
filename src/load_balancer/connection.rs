//! Pooled connection record.
//!
//! # Responsibilities
//! - Track one session's lifecycle state
//! - Count in-flight requests (for least-connections selection)
//! - Track health-check failures and reconnect attempts
//!
//! # State Transitions
//! ```text
//! Connecting → Ready | TransientFailure
//! Ready → TransientFailure
//! TransientFailure → Ready | Abandoned
//! any (except Abandoned) → Shutdown
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::transport::Session;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    TransientFailure,
    /// Removed after reconnect attempts ran out.
    Abandoned,
    Shutdown,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Ready)
                | (Connecting, TransientFailure)
                | (Ready, TransientFailure)
                | (TransientFailure, Ready)
                | (TransientFailure, Abandoned)
                | (Connecting, Shutdown)
                | (Ready, Shutdown)
                | (TransientFailure, Shutdown)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::TransientFailure => "transient_failure",
            ConnectionState::Abandoned => "abandoned",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

struct ConnectionInner {
    state: ConnectionState,
    session: Option<Arc<dyn Session>>,
    last_used: Instant,
    health_failures: u32,
    reconnect_attempts: u32,
    reconnecting: bool,
}

/// One session owned by the pool.
pub struct PooledConnection {
    id: ConnectionId,
    address: String,
    weight: u32,
    created_at: Instant,
    max_concurrent: usize,
    in_flight: AtomicUsize,
    inner: Mutex<ConnectionInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl PooledConnection {
    pub fn new(address: impl Into<String>, weight: u32, max_concurrent: usize) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            address: address.into(),
            weight,
            created_at: now,
            max_concurrent,
            in_flight: AtomicUsize::new(0),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Connecting,
                session: None,
                last_used: now,
                health_failures: 0,
                reconnect_attempts: 0,
                reconnecting: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Ready and below its concurrency cap.
    pub fn is_selectable(&self) -> bool {
        self.is_ready() && self.in_flight() < self.max_concurrent
    }

    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.lock().session.clone()
    }

    pub fn last_used(&self) -> Instant {
        self.lock().last_used
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub fn health_failures(&self) -> u32 {
        self.lock().health_failures
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    /// Claim an in-flight slot. Fails unless ready and under the cap.
    pub(crate) fn try_begin_request(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Ready {
            return false;
        }
        let claimed = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_concurrent).then_some(n + 1)
            })
            .is_ok();
        if claimed {
            inner.last_used = Instant::now();
        }
        claimed
    }

    pub(crate) fn end_request(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.lock().last_used = Instant::now();
    }

    /// Install a fresh session and move to `Ready`.
    pub(crate) fn set_ready(&self, session: Arc<dyn Session>) -> bool {
        let mut inner = self.lock();
        if !inner.state.can_transition_to(ConnectionState::Ready) {
            return false;
        }
        inner.state = ConnectionState::Ready;
        inner.session = Some(session);
        inner.health_failures = 0;
        inner.reconnect_attempts = 0;
        inner.reconnecting = false;
        inner.last_used = Instant::now();
        true
    }

    /// Move to `TransientFailure` and hand back the broken session.
    /// Returns `None` if a reconnect is already running or the state forbids it.
    pub(crate) fn begin_reconnect(&self) -> Option<Option<Arc<dyn Session>>> {
        let mut inner = self.lock();
        if inner.reconnecting
            || !inner.state.can_transition_to(ConnectionState::TransientFailure)
        {
            return None;
        }
        inner.state = ConnectionState::TransientFailure;
        inner.reconnecting = true;
        Some(inner.session.take())
    }

    pub(crate) fn record_probe_success(&self) {
        self.lock().health_failures = 0;
    }

    /// Count a failed probe. True once `threshold` consecutive failures are
    /// reached on a ready connection.
    pub(crate) fn record_probe_failure(&self, threshold: u32) -> bool {
        let mut inner = self.lock();
        inner.health_failures += 1;
        inner.state == ConnectionState::Ready && inner.health_failures >= threshold
    }

    pub(crate) fn record_reconnect_attempt(&self, attempt: u32) {
        self.lock().reconnect_attempts = attempt;
    }

    /// Retire an idle connection. Fails if a request is in flight.
    pub(crate) fn try_retire(&self) -> Option<Option<Arc<dyn Session>>> {
        let mut inner = self.lock();
        if self.in_flight() > 0 || !inner.state.can_transition_to(ConnectionState::Shutdown) {
            return None;
        }
        inner.state = ConnectionState::Shutdown;
        Some(inner.session.take())
    }

    pub(crate) fn mark_abandoned(&self) {
        let mut inner = self.lock();
        if inner.state.can_transition_to(ConnectionState::Abandoned) {
            inner.state = ConnectionState::Abandoned;
        }
        inner.reconnecting = false;
        inner.session = None;
    }

    /// Terminal shutdown, regardless of in-flight requests.
    pub(crate) fn shut_down(&self) -> Option<Arc<dyn Session>> {
        let mut inner = self.lock();
        if inner.state.can_transition_to(ConnectionState::Shutdown) {
            inner.state = ConnectionState::Shutdown;
        }
        inner.reconnecting = false;
        inner.session.take()
    }

    #[cfg(test)]
    pub(crate) fn force_ready(&self) {
        self.lock().state = ConnectionState::Ready;
    }
}
