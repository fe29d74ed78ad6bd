//! Health monitoring with failover and failback.
//!
//! # Responsibilities
//! - Periodically probe the active transport (each probe raced against a timeout)
//! - Maintain the hysteresis status in state.rs
//! - Fail over to the next candidate address on sustained failure
//! - Schedule failback to the original address once serving again

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::schema::{FailoverConfig, HealthCheckConfig};
use crate::error::Result;
use crate::health::state::{HealthRecord, HealthStatus, LinkState, ProbeResult};
use crate::lifecycle::Shutdown;
use crate::resilience::with_timeout;

const EVENT_CAPACITY: usize = 64;

/// Liveness check against whatever transport is active.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, timeout: Duration) -> Result<()>;
}

/// Re-targets the client at another address.
#[async_trait]
pub trait AddressSwitcher: Send + Sync {
    async fn switch_address(&self, address: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    StatusChanged { from: HealthStatus, to: HealthStatus },
    FailoverStarted { from: String, to: String },
    FailoverCompleted { address: String },
    FailoverFailed { address: String, reason: String },
    /// No other candidate address to move to.
    FailoverExhausted,
    FailbackScheduled { address: String, delay: Duration },
    FailbackCompleted { address: String },
    FailbackFailed { address: String, reason: String, retry_in: Duration },
}

/// Read-only view of the health record.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub history: Vec<ProbeResult>,
    pub link: LinkState,
    pub current_address: String,
    pub original_address: String,
}

/// Live feed of health events. Dropping it, or calling `unsubscribe`,
/// detaches from the monitor.
#[derive(Debug)]
pub struct HealthSubscription {
    rx: broadcast::Receiver<HealthEvent>,
}

impl HealthSubscription {
    /// Next event; `None` once the monitor is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<HealthEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Health subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<HealthEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

/// Next failover candidate, or `None` when the list is exhausted.
pub fn next_failover_index(current: usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let next = (current + 1) % len;
    (next != current).then_some(next)
}

enum FailbackOutcome {
    Done,
    NotNeeded,
    Failed(String),
}

pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    config: HealthCheckConfig,
    failover: FailoverConfig,
    addresses: Vec<String>,
    probe: Arc<dyn HealthProbe>,
    switcher: Arc<dyn AddressSwitcher>,
    record: Mutex<HealthRecord>,
    events: broadcast::Sender<HealthEvent>,
    running: Mutex<Option<Arc<Shutdown>>>,
    closed: Shutdown,
    failback_armed: AtomicBool,
    switching: tokio::sync::Mutex<()>,
}

impl HealthMonitor {
    /// `primary` is the original address; the failover candidates follow it
    /// in configured order, duplicates skipped.
    pub fn new(
        config: HealthCheckConfig,
        failover: FailoverConfig,
        primary: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        switcher: Arc<dyn AddressSwitcher>,
    ) -> Self {
        let mut addresses = vec![primary.into()];
        for address in &failover.fallback_addresses {
            if !addresses.contains(address) {
                addresses.push(address.clone());
            }
        }
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(MonitorInner {
                config,
                failover,
                addresses,
                probe,
                switcher,
                record: Mutex::new(HealthRecord::new(0)),
                events,
                running: Mutex::new(None),
                closed: Shutdown::new(),
                failback_armed: AtomicBool::new(false),
                switching: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Start the periodic probe loop. No-op when disabled or already running.
    pub fn start(&self) {
        let inner = &self.inner;
        if !inner.config.enabled {
            tracing::info!("Health checks disabled");
            return;
        }
        let mut running = lock(&inner.running);
        if running.is_some() {
            return;
        }
        let shutdown = Arc::new(Shutdown::new());
        let interval = inner.config.interval();
        tokio::spawn(probe_loop(Arc::downgrade(inner), interval, shutdown.subscribe()));
        *running = Some(shutdown);

        tracing::info!(
            ?interval,
            timeout = ?inner.config.timeout(),
            failover = inner.failover.enabled,
            "Health monitor started"
        );
    }

    /// Stop the probe loop and any pending failback timer.
    pub fn stop(&self) {
        if let Some(shutdown) = lock(&self.inner.running).take() {
            shutdown.trigger();
            self.inner.failback_armed.store(false, Ordering::SeqCst);
            tracing::info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Probe immediately and apply the result, including any failover it
    /// triggers, before returning the new snapshot.
    pub async fn check_now(&self) -> HealthSnapshot {
        self.inner.run_probe().await;
        self.get_health()
    }

    pub fn get_health(&self) -> HealthSnapshot {
        self.inner.snapshot()
    }

    pub fn subscribe(&self) -> HealthSubscription {
        HealthSubscription {
            rx: self.inner.events.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    pub fn addresses(&self) -> &[String] {
        &self.inner.addresses
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("addresses", &self.inner.addresses)
            .field("status", &self.inner.snapshot().status)
            .finish()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
        self.inner.closed.trigger();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MonitorInner {
    fn emit(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> HealthSnapshot {
        let record = lock(&self.record);
        HealthSnapshot {
            status: record.status,
            consecutive_successes: record.consecutive_successes,
            consecutive_failures: record.consecutive_failures,
            history: record.history.iter().cloned().collect(),
            link: record.link,
            current_address: self.addresses[record.current_index].clone(),
            original_address: self.addresses[record.original_index].clone(),
        }
    }

    /// Failures needed before a failover attempt.
    fn failover_point(&self) -> u32 {
        self.config
            .unhealthy_threshold
            .max(self.failover.failover_threshold)
            .max(1)
    }

    async fn run_probe(self: &Arc<Self>) {
        let timeout = self.config.timeout();
        let started = Instant::now();
        let result = with_timeout(timeout, self.probe.probe(timeout)).await;
        let probe = ProbeResult {
            success: result.is_ok(),
            latency: started.elapsed(),
            error: result.as_ref().err().map(|e| e.to_string()),
            checked_at: Instant::now(),
        };
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Health probe failed");
        }

        let (change, failover_due, failback_due) = {
            let mut record = lock(&self.record);
            let change = record.apply(
                probe,
                self.config.healthy_threshold,
                self.config.unhealthy_threshold,
            );
            let failover_due = self.failover.enabled
                && record.status == HealthStatus::NotServing
                && record.consecutive_failures == self.failover_point();
            let failback_due = self.failover.enabled
                && change.is_some_and(|c| c.to == HealthStatus::Serving)
                && !record.on_original();
            (change, failover_due, failback_due)
        };

        if let Some(change) = change {
            match change.to {
                HealthStatus::NotServing => {
                    tracing::warn!(from = change.from.as_str(), "Server marked NOT_SERVING")
                }
                _ => tracing::info!(
                    from = change.from.as_str(),
                    to = change.to.as_str(),
                    "Server health changed"
                ),
            }
            let serving = if change.to == HealthStatus::Serving { 1.0 } else { 0.0 };
            metrics::gauge!("authz_server_serving").set(serving);
            self.emit(HealthEvent::StatusChanged {
                from: change.from,
                to: change.to,
            });
        }

        if failover_due {
            self.failover().await;
        }
        if failback_due {
            self.arm_failback();
        }
    }

    async fn failover(self: &Arc<Self>) {
        let _switching = self.switching.lock().await;

        let current = lock(&self.record).current_index;
        let Some(next) = next_failover_index(current, self.addresses.len()) else {
            tracing::error!(address = %self.addresses[current], "Failover exhausted, no other address");
            self.emit(HealthEvent::FailoverExhausted);
            return;
        };
        let from = self.addresses[current].clone();
        let to = self.addresses[next].clone();

        lock(&self.record).link = LinkState::FailingOver;
        tracing::warn!(%from, %to, "Failing over");
        self.emit(HealthEvent::FailoverStarted {
            from: from.clone(),
            to: to.clone(),
        });

        match self.switcher.switch_address(&to).await {
            Ok(()) => {
                {
                    let mut record = lock(&self.record);
                    record.current_index = next;
                    record.consecutive_failures = 0;
                    record.link = LinkState::Connected;
                }
                metrics::counter!("authz_failovers_total").increment(1);
                tracing::info!(address = %to, "Failover completed");
                self.emit(HealthEvent::FailoverCompleted { address: to });
            }
            Err(e) => {
                lock(&self.record).link = LinkState::Disconnected;
                tracing::error!(address = %to, error = %e, "Failover failed");
                self.emit(HealthEvent::FailoverFailed {
                    address: to,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn arm_failback(self: &Arc<Self>) {
        if self.failback_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = self.failover.failback_delay();
        let address = self.addresses[lock(&self.record).original_index].clone();
        let shutdown = match lock(&self.running).as_ref() {
            Some(running) => running.subscribe(),
            None => self.closed.subscribe(),
        };

        tracing::info!(%address, ?delay, "Failback scheduled");
        self.emit(HealthEvent::FailbackScheduled { address, delay });
        tokio::spawn(failback_loop(Arc::downgrade(self), delay, shutdown));
    }

    async fn try_failback(&self) -> FailbackOutcome {
        let _switching = self.switching.lock().await;

        let (current, original) = {
            let record = lock(&self.record);
            (record.current_index, record.original_index)
        };
        if current == original {
            return FailbackOutcome::NotNeeded;
        }
        let address = self.addresses[original].clone();
        lock(&self.record).link = LinkState::FailingBack;

        match self.switcher.switch_address(&address).await {
            Ok(()) => {
                {
                    let mut record = lock(&self.record);
                    record.current_index = original;
                    record.link = LinkState::Connected;
                }
                tracing::info!(%address, "Failback completed");
                self.emit(HealthEvent::FailbackCompleted { address });
                FailbackOutcome::Done
            }
            Err(e) => {
                lock(&self.record).link = LinkState::Connected;
                FailbackOutcome::Failed(e.to_string())
            }
        }
    }
}

async fn probe_loop(
    monitor: Weak<MonitorInner>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = monitor.upgrade() else { return };
                inner.run_probe().await;
            }
            _ = shutdown.recv() => {
                tracing::debug!("Health probe loop exiting");
                return;
            }
        }
    }
}

async fn failback_loop(
    monitor: Weak<MonitorInner>,
    delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return,
        }
        let Some(inner) = monitor.upgrade() else { return };
        match inner.try_failback().await {
            FailbackOutcome::Done | FailbackOutcome::NotNeeded => {
                inner.failback_armed.store(false, Ordering::SeqCst);
                return;
            }
            FailbackOutcome::Failed(reason) => {
                let address = inner.addresses[lock(&inner.record).original_index].clone();
                tracing::warn!(%address, %reason, retry_in = ?delay, "Failback failed, rescheduling");
                inner.emit(HealthEvent::FailbackFailed {
                    address,
                    reason,
                    retry_in: delay,
                });
            }
        }
    }
}
