//! Connection pool management.
//!
//! # Responsibilities
//! - Keep between `min_connections` and `max_connections` sessions open
//! - Select a connection per call with the configured strategy
//! - Queue callers when nothing is available and hand connections over FIFO
//! - Probe connections, reconnect broken ones with backoff, evict idle ones
//!
//! # Design Decisions
//! - Slots are reserved with a CAS before dialing, so concurrent creators
//!   never overshoot `max_connections`
//! - A failed dial leaves the record in `TransientFailure` with a reconnect
//!   loop running; initialization does not fail because of it
//! - Abandoned connections are removed; the health ticker tops the pool back
//!   up to `min_connections`
//! - Background loops hold `Weak` references and stop on shutdown

use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::schema::{EndpointConfig, PoolConfig, ReconnectConfig};
use crate::error::{Result, TransportError};
use crate::lifecycle::Shutdown;
use crate::load_balancer::connection::{ConnectionId, ConnectionState, PooledConnection};
use crate::load_balancer::{balancer_for, LoadBalancer};
use crate::resilience::{with_timeout, Backoff};
use crate::transport::{Connector, Session};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    ConnectionReady { id: ConnectionId, address: String },
    /// A ready connection broke and entered its reconnect loop.
    ConnectionFailed { id: ConnectionId, address: String, reason: String },
    ConnectionReconnected { id: ConnectionId, address: String, attempts: u32 },
    /// Reconnect attempts ran out; the connection was removed.
    ConnectionAbandoned { id: ConnectionId, address: String, attempts: u32 },
    /// Closed by idle eviction or scale-down.
    ConnectionClosed { id: ConnectionId, address: String },
    Shutdown,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub ready: usize,
    pub connecting: usize,
    pub transient_failure: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub address: String,
    pub state: ConnectionState,
    pub in_flight: usize,
    pub health_failures: u32,
}

/// Pool of sessions to the configured endpoints.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    endpoints: Vec<EndpointConfig>,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    backoff: Backoff,
    balancer: Box<dyn LoadBalancer>,
    connections: DashMap<ConnectionId, Arc<PooledConnection>>,
    slots: AtomicUsize,
    next_endpoint: AtomicUsize,
    waiters: Mutex<VecDeque<oneshot::Sender<ConnectionLease>>>,
    events: broadcast::Sender<PoolEvent>,
    last_error: Mutex<Option<String>>,
    shutdown: Shutdown,
    started: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy)]
enum Maintenance {
    HealthCheck,
    IdleSweep,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        endpoints: Vec<EndpointConfig>,
        reconnect: &ReconnectConfig,
        connect_timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let balancer = balancer_for(config.strategy);
        Self {
            inner: Arc::new(PoolInner {
                config,
                endpoints,
                connector,
                connect_timeout,
                backoff: Backoff::new(reconnect),
                balancer,
                connections: DashMap::new(),
                slots: AtomicUsize::new(0),
                next_endpoint: AtomicUsize::new(0),
                waiters: Mutex::new(VecDeque::new()),
                events,
                last_error: Mutex::new(None),
                shutdown: Shutdown::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open `min_connections` sessions (round-robin over endpoints) and start
    /// the health-check and idle-eviction timers.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ShuttingDown);
        }
        if inner.endpoints.is_empty() {
            return Err(TransportError::Connection("no endpoints configured".into()));
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let creations: Vec<_> = (0..inner.config.min_connections)
            .filter(|_| inner.try_reserve_slot())
            .map(|_| inner.create_connection())
            .collect();
        let results = join_all(creations).await;
        let ready = results.iter().filter(|r| r.is_ok()).count();

        tracing::info!(
            ready,
            requested = inner.config.min_connections,
            strategy = ?inner.config.strategy,
            endpoints = inner.endpoints.len(),
            "Connection pool initialized"
        );

        inner.spawn_maintenance();
        Ok(())
    }

    /// Borrow a ready connection. The lease releases it on drop.
    pub async fn acquire(&self) -> Result<ConnectionLease> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ShuttingDown);
        }

        if let Some(lease) = inner.try_select() {
            return Ok(lease);
        }

        if inner.try_reserve_slot() {
            match inner.create_connection().await {
                Ok(_) => {
                    if let Some(lease) = inner.try_select() {
                        return Ok(lease);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "On-demand connection failed"),
            }
        }

        let (tx, rx) = oneshot::channel();
        lock(&inner.waiters).push_back(tx);
        // a connection may have been released before we queued
        inner.serve_waiters();

        let timeout = inner.config.acquire_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(TransportError::ShuttingDown),
            Err(_) => {
                metrics::counter!("authz_pool_acquire_timeouts_total").increment(1);
                tracing::warn!(?timeout, "Timed out waiting for a pooled connection");
                Err(TransportError::AcquireTimeout(timeout))
            }
        }
    }

    /// Resize toward `target`, clamped to `[min, max]`. Scale-down closes the
    /// most idle connections first and never one with calls in flight.
    /// Returns the resulting connection count.
    pub async fn scale(&self, target: usize) -> usize {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return 0;
        }

        let target = target.max(inner.config.min_connections).min(inner.config.max_connections);
        let current = inner.slots.load(Ordering::SeqCst);

        if target > current {
            let creations: Vec<_> = (current..target)
                .filter(|_| inner.try_reserve_slot())
                .map(|_| inner.create_connection())
                .collect();
            join_all(creations).await;
        } else if target < current {
            let mut surplus = current - target;
            let mut idle: Vec<_> = inner
                .connections
                .iter()
                .filter(|e| e.value().in_flight() == 0)
                .map(|e| Arc::clone(e.value()))
                .collect();
            idle.sort_by_key(|c| c.last_used());

            for conn in idle {
                if surplus == 0 {
                    break;
                }
                if inner.retire(&conn).await {
                    surplus -= 1;
                }
            }
        }

        let count = inner.connections.len();
        tracing::info!(target, connections = count, "Connection pool scaled");
        count
    }

    /// Stop timers, reject queued callers and close every session.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.shutdown.trigger();

        // dropping the senders fails every waiter with ShuttingDown
        let rejected = std::mem::take(&mut *lock(&inner.waiters)).len();

        let connections: Vec<_> = inner.connections.iter().map(|e| Arc::clone(e.value())).collect();
        inner.connections.clear();
        inner.slots.store(0, Ordering::SeqCst);

        for conn in &connections {
            if let Some(session) = conn.shut_down() {
                session.close().await;
            }
        }

        inner.emit(PoolEvent::Shutdown);
        tracing::info!(closed = connections.len(), rejected, "Connection pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let mut stats = PoolStats {
            min: inner.config.min_connections,
            max: inner.config.max_connections,
            waiting: lock(&inner.waiters).iter().filter(|w| !w.is_closed()).count(),
            ..Default::default()
        };
        for entry in inner.connections.iter() {
            let conn = entry.value();
            stats.total += 1;
            stats.in_flight += conn.in_flight();
            match conn.state() {
                ConnectionState::Ready => stats.ready += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::TransientFailure => stats.transient_failure += 1,
                ConnectionState::Abandoned | ConnectionState::Shutdown => {}
            }
        }
        stats
    }

    /// Connection records in id order.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|e| {
                let conn = e.value();
                ConnectionSnapshot {
                    id: conn.id(),
                    address: conn.address().to_string(),
                    state: conn.state(),
                    in_flight: conn.in_flight(),
                    health_failures: conn.health_failures(),
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    pub fn ready_count(&self) -> usize {
        self.inner.ready_count()
    }

    /// Most recent dial or probe failure, for diagnostics.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.inner.endpoints
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Probe every ready connection once, outside the timer.
    pub async fn run_health_checks(&self) {
        self.inner.run_health_checks().await;
    }

    /// Close idle connections above the minimum, outside the timer.
    pub async fn evict_idle(&self) -> usize {
        self.inner.evict_idle().await
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}

impl PoolInner {
    fn ready_count(&self) -> usize {
        self.connections.iter().filter(|e| e.value().is_ready()).count()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
        metrics::gauge!("authz_pool_ready_connections").set(self.ready_count() as f64);
    }

    fn set_last_error(&self, error: &TransportError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    fn try_reserve_slot(&self) -> bool {
        let max = self.config.max_connections;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn remove_connection(&self, id: ConnectionId) -> bool {
        if self.connections.remove(&id).is_some() {
            self.release_slot();
            true
        } else {
            false
        }
    }

    fn next_endpoint(&self) -> EndpointConfig {
        let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints[index].clone()
    }

    /// Dial a new connection into a reserved slot.
    async fn create_connection(self: &Arc<Self>) -> Result<Arc<PooledConnection>> {
        let endpoint = self.next_endpoint();
        let conn = Arc::new(PooledConnection::new(
            endpoint.address.clone(),
            endpoint.weight,
            self.config.max_concurrent_per_connection,
        ));
        self.connections.insert(conn.id(), Arc::clone(&conn));

        match with_timeout(self.connect_timeout, self.connector.connect(&endpoint.address)).await {
            Ok(session) => {
                if self.closed.load(Ordering::SeqCst) || !conn.set_ready(Arc::clone(&session)) {
                    session.close().await;
                    self.remove_connection(conn.id());
                    return Err(TransportError::ShuttingDown);
                }
                tracing::debug!(id = %conn.id(), address = %endpoint.address, "Connection ready");
                self.emit(PoolEvent::ConnectionReady {
                    id: conn.id(),
                    address: endpoint.address,
                });
                self.serve_waiters();
                Ok(conn)
            }
            Err(e) => {
                tracing::warn!(
                    id = %conn.id(),
                    address = %endpoint.address,
                    error = %e,
                    "Connection attempt failed, scheduling reconnect"
                );
                self.set_last_error(&e);
                self.begin_reconnect(&conn, e.to_string());
                Err(e)
            }
        }
    }

    /// Pick a connection with the strategy and claim an in-flight slot on it.
    fn try_select(self: &Arc<Self>) -> Option<ConnectionLease> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let mut candidates: Vec<_> = self
            .connections
            .iter()
            .filter(|e| e.value().is_selectable())
            .map(|e| Arc::clone(e.value()))
            .collect();
        candidates.sort_by_key(|c| c.id());

        while !candidates.is_empty() {
            let chosen = self.balancer.select(&candidates)?;
            if chosen.try_begin_request() {
                return Some(ConnectionLease::new(chosen, Arc::downgrade(self)));
            }
            candidates.retain(|c| c.id() != chosen.id());
        }
        None
    }

    /// Hand available connections to queued callers, oldest first.
    fn serve_waiters(self: &Arc<Self>) {
        let mut waiters = lock(&self.waiters);
        loop {
            while waiters.front().is_some_and(|w| w.is_closed()) {
                waiters.pop_front();
            }
            if waiters.is_empty() {
                return;
            }
            let Some(lease) = self.try_select() else {
                return;
            };
            let Some(waiter) = waiters.pop_front() else {
                lease.disarm();
                return;
            };
            if let Err(lease) = waiter.send(lease) {
                // the caller timed out in the meantime
                lease.disarm();
            }
        }
    }

    fn begin_reconnect(self: &Arc<Self>, conn: &Arc<PooledConnection>, reason: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(old_session) = conn.begin_reconnect() else {
            return;
        };

        tracing::warn!(id = %conn.id(), address = %conn.address(), %reason, "Connection entered transient failure");
        self.emit(PoolEvent::ConnectionFailed {
            id: conn.id(),
            address: conn.address().to_string(),
            reason,
        });

        if let Some(session) = old_session {
            tokio::spawn(async move { session.close().await });
        }
        tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            Arc::clone(conn),
            self.shutdown.subscribe(),
        ));
    }

    fn abandon(&self, conn: &PooledConnection, attempts: u32) {
        conn.mark_abandoned();
        if self.remove_connection(conn.id()) {
            tracing::error!(id = %conn.id(), address = %conn.address(), attempts, "Connection abandoned");
            metrics::counter!("authz_pool_connections_abandoned_total").increment(1);
            self.emit(PoolEvent::ConnectionAbandoned {
                id: conn.id(),
                address: conn.address().to_string(),
                attempts,
            });
        }
    }

    /// Close an idle connection and drop its record.
    async fn retire(&self, conn: &Arc<PooledConnection>) -> bool {
        let Some(session) = conn.try_retire() else {
            return false;
        };
        if !self.remove_connection(conn.id()) {
            return false;
        }
        if let Some(session) = session {
            session.close().await;
        }
        self.emit(PoolEvent::ConnectionClosed {
            id: conn.id(),
            address: conn.address().to_string(),
        });
        true
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let health_interval = self.config.health_check_interval();
        if !health_interval.is_zero() {
            tokio::spawn(maintenance_loop(
                Arc::downgrade(self),
                health_interval,
                Maintenance::HealthCheck,
                self.shutdown.subscribe(),
            ));
        }

        let idle_timeout = self.config.idle_timeout();
        if !idle_timeout.is_zero() {
            let period = (idle_timeout / 2).max(Duration::from_millis(1));
            tokio::spawn(maintenance_loop(
                Arc::downgrade(self),
                period,
                Maintenance::IdleSweep,
                self.shutdown.subscribe(),
            ));
        }
    }

    async fn run_health_checks(self: &Arc<Self>) {
        let ready: Vec<_> = self
            .connections
            .iter()
            .filter(|e| e.value().is_ready())
            .map(|e| Arc::clone(e.value()))
            .collect();

        let timeout = self.connect_timeout;
        let probes = ready.iter().map(|conn| async move {
            let result = match conn.session() {
                Some(session) => with_timeout(timeout, session.probe(timeout)).await,
                None => Err(TransportError::NotConnected),
            };
            (conn, result)
        });

        let threshold = self.config.health_failure_threshold;
        for (conn, result) in join_all(probes).await {
            match result {
                Ok(()) => conn.record_probe_success(),
                Err(e) => {
                    self.set_last_error(&e);
                    let tripped = conn.record_probe_failure(threshold);
                    tracing::debug!(
                        id = %conn.id(),
                        failures = conn.health_failures(),
                        error = %e,
                        "Connection health check failed"
                    );
                    if tripped {
                        self.begin_reconnect(conn, format!("{threshold} consecutive health checks failed: {e}"));
                    }
                }
            }
        }
    }

    async fn ensure_minimum(self: &Arc<Self>) {
        let missing = self
            .config
            .min_connections
            .saturating_sub(self.slots.load(Ordering::SeqCst));
        if missing == 0 {
            return;
        }
        tracing::debug!(missing, "Replenishing connection pool");
        let creations: Vec<_> = (0..missing)
            .filter(|_| self.try_reserve_slot())
            .map(|_| self.create_connection())
            .collect();
        join_all(creations).await;
    }

    async fn evict_idle(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut idle: Vec<_> = self
            .connections
            .iter()
            .filter(|e| {
                let c = e.value();
                c.is_ready() && c.in_flight() == 0 && c.idle_for(now) >= idle_timeout
            })
            .map(|e| Arc::clone(e.value()))
            .collect();
        idle.sort_by_key(|c| c.last_used());

        let mut evicted = 0;
        for conn in idle {
            if self.connections.len() <= self.config.min_connections {
                break;
            }
            if self.retire(&conn).await {
                tracing::info!(id = %conn.id(), address = %conn.address(), "Evicted idle connection");
                evicted += 1;
            }
        }
        evicted
    }
}

async fn maintenance_loop(
    pool: Weak<PoolInner>,
    period: Duration,
    task: Maintenance,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = pool.upgrade() else { return };
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                match task {
                    Maintenance::HealthCheck => {
                        inner.run_health_checks().await;
                        inner.ensure_minimum().await;
                    }
                    Maintenance::IdleSweep => {
                        inner.evict_idle().await;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::debug!(?task, "Pool maintenance loop stopping");
                return;
            }
        }
    }
}

async fn reconnect_loop(
    pool: Weak<PoolInner>,
    conn: Arc<PooledConnection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut attempt = 0u32;
    loop {
        let (delay, connector, connect_timeout) = {
            let Some(inner) = pool.upgrade() else { return };
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            if inner.backoff.is_exhausted(attempt) {
                inner.abandon(&conn, attempt);
                return;
            }
            (
                inner.backoff.delay(attempt),
                Arc::clone(&inner.connector),
                inner.connect_timeout,
            )
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
        if conn.state() != ConnectionState::TransientFailure {
            return;
        }

        attempt += 1;
        conn.record_reconnect_attempt(attempt);
        match with_timeout(connect_timeout, connector.connect(conn.address())).await {
            Ok(session) => {
                let Some(inner) = pool.upgrade() else {
                    session.close().await;
                    return;
                };
                if inner.closed.load(Ordering::SeqCst) || !conn.set_ready(Arc::clone(&session)) {
                    session.close().await;
                    return;
                }
                tracing::info!(id = %conn.id(), address = %conn.address(), attempts = attempt, "Connection re-established");
                inner.emit(PoolEvent::ConnectionReconnected {
                    id: conn.id(),
                    address: conn.address().to_string(),
                    attempts: attempt,
                });
                inner.serve_waiters();
                return;
            }
            Err(e) => {
                tracing::warn!(
                    id = %conn.id(),
                    address = %conn.address(),
                    attempt,
                    error = %e,
                    "Reconnect attempt failed"
                );
                if let Some(inner) = pool.upgrade() {
                    inner.set_last_error(&e);
                }
            }
        }
    }
}

/// A claimed connection. Dropping it releases the in-flight slot and hands
/// the connection to the oldest waiting caller.
pub struct ConnectionLease {
    conn: Arc<PooledConnection>,
    pool: Weak<PoolInner>,
    armed: bool,
}

impl ConnectionLease {
    fn new(conn: Arc<PooledConnection>, pool: Weak<PoolInner>) -> Self {
        Self {
            conn,
            pool,
            armed: true,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn address(&self) -> &str {
        self.conn.address()
    }

    pub fn connection(&self) -> &Arc<PooledConnection> {
        &self.conn
    }

    pub fn session(&self) -> Result<Arc<dyn Session>> {
        self.conn
            .session()
            .ok_or_else(|| TransportError::Connection(format!("{} has no live session", self.conn.id())))
    }

    /// Report a call failure. Connection-level errors take the connection
    /// out of rotation and start its reconnect loop.
    pub fn report_failure(&self, error: &TransportError) {
        if !error.is_connection_level() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.begin_reconnect(&self.conn, error.to_string());
        }
    }

    pub fn release(self) {}

    /// Release the slot without serving waiters.
    fn disarm(mut self) {
        if self.armed {
            self.armed = false;
            self.conn.end_request();
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease").field("conn", &self.conn).finish()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        self.conn.end_request();
        if let Some(pool) = self.pool.upgrade() {
            pool.serve_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LoadBalanceStrategy;
    use crate::transport::mock::MockConnector;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn pool_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            max_connections: max,
            acquire_timeout_ms: 100,
            ..Default::default()
        }
    }

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter: false,
            max_attempts: 3,
        }
    }

    fn pool(config: PoolConfig, connector: Arc<MockConnector>) -> ConnectionPool {
        ConnectionPool::new(
            config,
            vec![EndpointConfig {
                address: "mock:3593".into(),
                weight: 1,
            }],
            &reconnect(),
            Duration::from_millis(50),
            connector,
        )
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<PoolEvent>,
        pred: impl Fn(&PoolEvent) -> bool,
    ) -> PoolEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
        .await
        .expect("event not observed")
    }

    #[tokio::test]
    async fn test_initialize_opens_minimum() {
        let connector = MockConnector::new();
        let pool = pool(pool_config(2, 4), connector.clone());
        pool.initialize().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.ready, 2);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_visits_each_connection_once_per_cycle() {
        let pool = pool(pool_config(3, 3), MockConnector::new());
        pool.initialize().await.unwrap();

        let mut seen = HashMap::new();
        for _ in 0..6 {
            let lease = pool.acquire().await.unwrap();
            *seen.entry(lease.id()).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.values().all(|n| *n == 2));
    }

    #[tokio::test]
    async fn test_least_connections_spreads_concurrent_calls() {
        let mut config = pool_config(2, 4);
        config.strategy = LoadBalanceStrategy::LeastConnections;
        let pool = pool(config, MockConnector::new());
        pool.initialize().await.unwrap();

        let leases: Vec<_> = join_all((0..3).map(|_| pool.acquire()))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let mut counts: Vec<usize> = pool.connections().iter().map(|c| c.in_flight).collect();
        counts.sort();
        assert_eq!(counts, vec![1, 2]);

        drop(leases);
        assert!(pool.connections().iter().all(|c| c.in_flight == 0));
    }

    #[tokio::test]
    async fn test_acquire_creates_connection_on_demand() {
        let connector = MockConnector::new();
        let pool = pool(pool_config(0, 2), connector.clone());
        pool.initialize().await.unwrap();
        assert_eq!(pool.stats().total, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(lease.connection().in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let mut config = pool_config(1, 1);
        config.max_concurrent_per_connection = 1;
        let pool = pool(config, MockConnector::new());
        pool.initialize().await.unwrap();

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, TransportError::AcquireTimeout(_)));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_hands_off_to_oldest_waiter() {
        let mut config = pool_config(1, 1);
        config.max_concurrent_per_connection = 1;
        config.acquire_timeout_ms = 10_000;
        let pool = Arc::new(pool(config, MockConnector::new()));
        pool.initialize().await.unwrap();
        let held = pool.acquire().await.unwrap();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for name in ["first", "second"] {
            let pool = Arc::clone(&pool);
            let tx = order_tx.clone();
            tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                tx.send(name).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(lease);
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(pool.stats().waiting, 2);

        drop(held);
        assert_eq!(order_rx.recv().await, Some("first"));
        assert_eq!(order_rx.recv().await, Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_waiters() {
        let mut config = pool_config(1, 1);
        config.max_concurrent_per_connection = 1;
        config.acquire_timeout_ms = 10_000;
        let connector = MockConnector::new();
        let pool = Arc::new(pool(config, connector.clone()));
        pool.initialize().await.unwrap();
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        pool.shutdown().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ShuttingDown));
        assert!(matches!(pool.acquire().await, Err(TransportError::ShuttingDown)));
        assert!(connector.sessions().iter().all(|s| s.is_closed()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_connection_abandoned_after_max_attempts() {
        let connector = MockConnector::new();
        connector.set_available(false);
        let pool = pool(pool_config(1, 2), connector.clone());
        let mut events = pool.subscribe();

        pool.initialize().await.unwrap();
        assert_eq!(pool.ready_count(), 0);
        assert_eq!(pool.stats().transient_failure, 1);

        let event = wait_for(&mut events, |e| matches!(e, PoolEvent::ConnectionAbandoned { .. })).await;
        assert!(matches!(event, PoolEvent::ConnectionAbandoned { attempts: 3, .. }));
        // initial dial plus three reconnect attempts
        assert_eq!(connector.connects(), 4);
        assert_eq!(pool.stats().total, 0);
        assert!(pool.last_error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_health_checks_trigger_reconnect() {
        let connector = MockConnector::new();
        let mut config = pool_config(1, 1);
        config.health_check_interval_ms = 100;
        let pool = pool(config, connector.clone());
        let mut events = pool.subscribe();
        pool.initialize().await.unwrap();

        let started = Instant::now();
        connector.set_healthy(false);
        wait_for(&mut events, |e| matches!(e, PoolEvent::ConnectionFailed { .. })).await;
        assert!(started.elapsed() >= Duration::from_millis(300));

        connector.set_healthy(true);
        wait_for(&mut events, |e| matches!(e, PoolEvent::ConnectionReconnected { .. })).await;
        assert_eq!(pool.ready_count(), 1);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_keeps_minimum() {
        let mut config = pool_config(1, 3);
        config.idle_timeout_ms = 1_000;
        let pool = pool(config, MockConnector::new());
        pool.initialize().await.unwrap();
        assert_eq!(pool.scale(3).await, 3);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(pool.stats().total, 1);
    }

    #[tokio::test]
    async fn test_scale_clamps_and_spares_busy_connections() {
        let pool = pool(pool_config(1, 3), MockConnector::new());
        pool.initialize().await.unwrap();
        assert_eq!(pool.scale(10).await, 3);

        let busy = pool.acquire().await.unwrap();
        assert_eq!(pool.scale(0).await, 1);
        assert_eq!(pool.connections()[0].id, busy.id());
    }

    #[tokio::test]
    async fn test_connection_error_takes_connection_out_of_rotation() {
        let pool = pool(pool_config(1, 1), MockConnector::new());
        pool.initialize().await.unwrap();

        let lease = pool.acquire().await.unwrap();
        lease.report_failure(&TransportError::Call {
            code: "denied".into(),
            message: "nope".into(),
        });
        assert_eq!(lease.connection().state(), ConnectionState::Ready);

        lease.report_failure(&TransportError::Connection("reset".into()));
        assert_eq!(lease.connection().state(), ConnectionState::TransientFailure);
    }
}
