//! Duplex stream session with backpressure.
//!
//! # Responsibilities
//! - Write requests straight through while the transport keeps up
//! - Queue (bounded) while the transport is full, paused, or reconnecting
//! - Report writability with high/low watermark hysteresis
//! - Reconnect a broken transport with backoff, then flush the queue
//! - Correlate responses to sends for latency
//!
//! # Backpressure
//! ```text
//! send → queue empty, open, not blocked → try_write
//!            Full   → message queued, TransportBlocked { blocked: true }, wait for drain
//!            Closed → reconnect, message queued
//!      → otherwise queue (drop when at max_buffer_size)
//!
//! sink drains → TransportBlocked { blocked: false }, queue flushed in order
//!
//! depth reaches high_water_mark → Backpressure { active: true }, not writable
//! depth falls below low_water_mark → Backpressure { active: false }
//! ```
//!
//! The two signals are independent. `is_writable` is false while either is
//! raised.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::codec::{CheckRequest, CheckResponse};
use crate::config::schema::{BackpressureConfig, ReconnectConfig};
use crate::error::{Result, TransportError};
use crate::lifecycle::Shutdown;
use crate::resilience::Backoff;
use crate::stream::latency::LatencyTracker;
use crate::transport::{SinkError, StreamFactory, StreamParts, StreamSink, StreamSource};

/// Lifecycle notifications for one stream, delivered in order.
#[derive(Debug)]
pub enum StreamEvent {
    Response {
        response: CheckResponse,
        /// Time since the matching send, when it was tracked.
        latency: Option<Duration>,
    },
    /// Fatal for the stream; no further reconnects follow.
    Error(TransportError),
    End,
    /// Queue depth crossed a watermark.
    Backpressure { active: bool, queued: usize },
    /// The transport reported full, or drained after having done so.
    TransportBlocked { blocked: bool, queued: usize },
    Reconnected { attempt: u32 },
}

/// What `send` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Written,
    /// Accepted for later delivery.
    Queued,
    /// Queue at `max_buffer_size`; the message was discarded.
    Dropped,
    /// The stream has ended or failed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    Reconnecting,
    /// `end()` called; flushing and waiting for the server to finish.
    Ending,
    Ended,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Ended | StreamState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Opening => "opening",
            StreamState::Open => "open",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Ending => "ending",
            StreamState::Ended => "ended",
            StreamState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamStats {
    pub id: Uuid,
    pub state: StreamState,
    pub queued: usize,
    pub peak_buffer: usize,
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub pending_latency: usize,
    pub backpressured: bool,
    pub transport_blocked: bool,
    pub paused: bool,
    pub age: Duration,
}

struct SessionState {
    state: StreamState,
    sink: Option<Arc<dyn StreamSink>>,
    /// Bumped whenever the sink changes; stale reader and drain tasks compare it.
    generation: u64,
    queue: VecDeque<CheckRequest>,
    transport_blocked: bool,
    watermark_raised: bool,
    paused: bool,
    sent: u64,
    received: u64,
    dropped: u64,
    peak_buffer: usize,
}

/// One duplex request/response stream.
pub struct StreamManager {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: Uuid,
    factory: Arc<dyn StreamFactory>,
    config: BackpressureConfig,
    backoff: Backoff,
    session: Mutex<SessionState>,
    latency: LatencyTracker,
    events: mpsc::UnboundedSender<StreamEvent>,
    changed: Notify,
    shutdown: Shutdown,
    created_at: Instant,
}

impl StreamManager {
    /// Create an unopened stream. Events arrive on the returned receiver.
    pub fn new(
        factory: Arc<dyn StreamFactory>,
        config: BackpressureConfig,
        reconnect: &ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let latency = LatencyTracker::new(config.pending_ttl());
        let inner = Arc::new(StreamInner {
            id: Uuid::new_v4(),
            factory,
            config,
            backoff: Backoff::new(reconnect),
            session: Mutex::new(SessionState {
                state: StreamState::Opening,
                sink: None,
                generation: 0,
                queue: VecDeque::new(),
                transport_blocked: false,
                watermark_raised: false,
                paused: false,
                sent: 0,
                received: 0,
                dropped: 0,
                peak_buffer: 0,
            }),
            latency,
            events,
            changed: Notify::new(),
            shutdown: Shutdown::new(),
            created_at: Instant::now(),
        });
        (Self { inner }, rx)
    }

    /// Open the underlying transport. Messages sent before this are queued
    /// and flushed once it is up.
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let s = inner.lock();
            if s.state != StreamState::Opening {
                return Err(TransportError::Stream(format!(
                    "stream {} is already {}",
                    inner.id,
                    s.state.as_str()
                )));
            }
        }

        match inner.factory.open().await {
            Ok(parts) => {
                inner.install(parts, None);
                inner.spawn_janitor();
                tracing::info!(stream_id = %inner.id, "Stream opened");
                metrics::gauge!("authz_active_streams").increment(1.0);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(stream_id = %inner.id, error = %e, "Failed to open stream");
                let mut s = inner.lock();
                s.state = StreamState::Failed;
                s.dropped += s.queue.len() as u64;
                s.queue.clear();
                drop(s);
                inner.shutdown.trigger();
                Err(e)
            }
        }
    }

    pub fn send(&self, request: CheckRequest) -> SendOutcome {
        let inner = &self.inner;
        let mut events = Vec::new();
        let outcome = {
            let mut s = inner.lock();
            inner.send_locked(&mut s, request, &mut events)
        };
        inner.emit_all(events);
        outcome
    }

    /// Open, not paused, transport not full, and below the high watermark
    /// (with hysteresis).
    pub fn is_writable(&self) -> bool {
        let s = self.inner.lock();
        s.state == StreamState::Open && !s.paused && !s.transport_blocked && !s.watermark_raised
    }

    /// Hold further writes in the queue.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        tracing::debug!(stream_id = %self.inner.id, "Stream paused");
    }

    /// Release held writes, flushing the queue in order.
    pub fn resume(&self) {
        let inner = &self.inner;
        let mut events = Vec::new();
        {
            let mut s = inner.lock();
            s.paused = false;
            inner.flush_locked(&mut s, &mut events);
        }
        inner.emit_all(events);
        tracing::debug!(stream_id = %inner.id, "Stream resumed");
    }

    /// Flush queued messages (bounded by `end_flush_timeout`), half-close,
    /// and wait for the server to finish. Whatever is still queued at the
    /// deadline is counted as dropped.
    pub async fn end(&self) -> Result<()> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.end_flush_timeout();
        {
            let mut s = inner.lock();
            match s.state {
                StreamState::Ending | StreamState::Ended | StreamState::Failed => return Ok(()),
                _ => {
                    s.state = StreamState::Ending;
                    s.paused = false;
                }
            }
        }

        let _ = tokio::time::timeout_at(deadline, inner.wait_flushed()).await;

        let (sink, undelivered) = {
            let mut s = inner.lock();
            let undelivered = s.queue.len();
            s.dropped += undelivered as u64;
            s.queue.clear();
            (s.sink.clone(), undelivered)
        };
        if undelivered > 0 {
            tracing::warn!(stream_id = %inner.id, undelivered, "Stream ended with undelivered messages");
        }

        if let Some(sink) = sink {
            sink.close().await;
            if tokio::time::timeout_at(deadline, inner.wait_terminal()).await.is_err() {
                tracing::debug!(stream_id = %inner.id, "Server did not finish the stream in time");
            }
        }
        inner.finish();
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> StreamStats {
        let inner = &self.inner;
        let s = inner.lock();
        StreamStats {
            id: inner.id,
            state: s.state,
            queued: s.queue.len(),
            peak_buffer: s.peak_buffer,
            sent: s.sent,
            received: s.received,
            dropped: s.dropped,
            pending_latency: inner.latency.len(),
            backpressured: s.watermark_raised,
            transport_blocked: s.transport_blocked,
            paused: s.paused,
            age: inner.created_at.elapsed(),
        }
    }

    /// Evict latency entries older than the TTL, outside the timer.
    pub fn purge_stale(&self) -> usize {
        self.inner.latency.purge_stale()
    }
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager").field("stats", &self.stats()).finish()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.inner.shutdown.trigger();
    }
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_all(&self, events: Vec<StreamEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    fn send_locked(
        self: &Arc<Self>,
        s: &mut SessionState,
        request: CheckRequest,
        events: &mut Vec<StreamEvent>,
    ) -> SendOutcome {
        if matches!(
            s.state,
            StreamState::Ending | StreamState::Ended | StreamState::Failed
        ) {
            return SendOutcome::Closed;
        }

        let direct = s.state == StreamState::Open
            && !s.paused
            && !s.transport_blocked
            && s.queue.is_empty();
        if !direct {
            return self.enqueue_locked(s, request, events);
        }
        let Some(sink) = s.sink.clone() else {
            return self.enqueue_locked(s, request, events);
        };

        let request_id = request.request_id.clone();
        self.latency.record_sent(&request_id);
        match sink.try_write(request) {
            Ok(()) => {
                s.sent += 1;
                SendOutcome::Written
            }
            Err(SinkError::Full(request)) => {
                self.latency.complete(&request_id);
                let outcome = self.enqueue_locked(s, request, events);
                self.block_locked(s, sink, events);
                outcome
            }
            Err(SinkError::Closed(request)) => {
                self.latency.complete(&request_id);
                self.begin_reconnect_locked(
                    s,
                    &TransportError::Stream("transport closed during write".into()),
                );
                self.enqueue_locked(s, request, events)
            }
        }
    }

    fn enqueue_locked(
        &self,
        s: &mut SessionState,
        request: CheckRequest,
        events: &mut Vec<StreamEvent>,
    ) -> SendOutcome {
        if s.queue.len() >= self.config.max_buffer_size {
            s.dropped += 1;
            metrics::counter!("authz_stream_messages_dropped_total").increment(1);
            tracing::debug!(stream_id = %self.id, request_id = %request.request_id, "Stream queue full, message dropped");
            return SendOutcome::Dropped;
        }
        s.queue.push_back(request);
        s.peak_buffer = s.peak_buffer.max(s.queue.len());
        self.update_watermark(s, events);
        SendOutcome::Queued
    }

    fn update_watermark(&self, s: &mut SessionState, events: &mut Vec<StreamEvent>) {
        let depth = s.queue.len();
        if !s.watermark_raised && depth >= self.config.high_water_mark {
            s.watermark_raised = true;
            tracing::debug!(stream_id = %self.id, queued = depth, "Stream backpressure raised");
            events.push(StreamEvent::Backpressure {
                active: true,
                queued: depth,
            });
        } else if s.watermark_raised && depth < self.config.low_water_mark.max(1) {
            s.watermark_raised = false;
            tracing::debug!(stream_id = %self.id, queued = depth, "Stream backpressure cleared");
            events.push(StreamEvent::Backpressure {
                active: false,
                queued: depth,
            });
        }
    }

    /// Write queued messages in order until the transport pushes back.
    fn flush_locked(self: &Arc<Self>, s: &mut SessionState, events: &mut Vec<StreamEvent>) {
        if s.paused
            || s.transport_blocked
            || !matches!(s.state, StreamState::Open | StreamState::Ending)
        {
            return;
        }
        let Some(sink) = s.sink.clone() else {
            return;
        };

        while let Some(request) = s.queue.pop_front() {
            let request_id = request.request_id.clone();
            self.latency.record_sent(&request_id);
            match sink.try_write(request) {
                Ok(()) => s.sent += 1,
                Err(SinkError::Full(request)) => {
                    self.latency.complete(&request_id);
                    s.queue.push_front(request);
                    self.block_locked(s, sink, events);
                    break;
                }
                Err(SinkError::Closed(request)) => {
                    self.latency.complete(&request_id);
                    s.queue.push_front(request);
                    self.begin_reconnect_locked(
                        s,
                        &TransportError::Stream("transport closed during flush".into()),
                    );
                    break;
                }
            }
        }
        self.update_watermark(s, events);
    }

    fn block_locked(
        self: &Arc<Self>,
        s: &mut SessionState,
        sink: Arc<dyn StreamSink>,
        events: &mut Vec<StreamEvent>,
    ) {
        if s.transport_blocked {
            return;
        }
        s.transport_blocked = true;
        tracing::debug!(stream_id = %self.id, queued = s.queue.len(), "Stream transport full");
        events.push(StreamEvent::TransportBlocked {
            blocked: true,
            queued: s.queue.len(),
        });
        tokio::spawn(drain_wait(
            Arc::downgrade(self),
            sink,
            s.generation,
            self.shutdown.subscribe(),
        ));
    }

    fn on_drained(self: &Arc<Self>, generation: u64) {
        let mut events = Vec::new();
        {
            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            self.unblock_locked(&mut s, &mut events);
            self.flush_locked(&mut s, &mut events);
        }
        self.emit_all(events);
        self.changed.notify_waiters();
    }

    fn unblock_locked(&self, s: &mut SessionState, events: &mut Vec<StreamEvent>) {
        if !s.transport_blocked {
            return;
        }
        s.transport_blocked = false;
        tracing::debug!(stream_id = %self.id, queued = s.queue.len(), "Stream transport drained");
        events.push(StreamEvent::TransportBlocked {
            blocked: false,
            queued: s.queue.len(),
        });
    }

    /// Install a freshly opened transport and start reading from it.
    fn install(self: &Arc<Self>, parts: StreamParts, attempt: Option<u32>) {
        let StreamParts { sink, source } = parts;
        let mut events = Vec::new();
        if let Some(attempt) = attempt {
            events.push(StreamEvent::Reconnected { attempt });
        }

        let generation = {
            let mut s = self.lock();
            if !matches!(s.state, StreamState::Opening | StreamState::Reconnecting) {
                drop(s);
                tokio::spawn(async move { sink.close().await });
                return;
            }
            s.generation += 1;
            s.sink = Some(sink);
            s.state = StreamState::Open;
            self.unblock_locked(&mut s, &mut events);
            self.flush_locked(&mut s, &mut events);
            s.generation
        };

        self.emit_all(events);
        self.changed.notify_waiters();
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            source,
            generation,
            self.shutdown.subscribe(),
        ));
    }

    fn begin_reconnect_locked(self: &Arc<Self>, s: &mut SessionState, error: &TransportError) {
        if s.state != StreamState::Open {
            return;
        }
        tracing::warn!(stream_id = %self.id, error = %error, queued = s.queue.len(), "Stream transport failed, reconnecting");
        s.state = StreamState::Reconnecting;
        s.sink = None;
        s.generation += 1;
        tokio::spawn(reconnect_loop(Arc::downgrade(self), self.shutdown.subscribe()));
    }

    fn on_response(&self, response: CheckResponse) {
        self.lock().received += 1;
        let latency = self.latency.complete(&response.request_id);
        if let Some(latency) = latency {
            metrics::histogram!("authz_stream_response_latency_seconds").record(latency.as_secs_f64());
        }
        let _ = self.events.send(StreamEvent::Response { response, latency });
    }

    fn on_transport_error(self: &Arc<Self>, generation: u64, error: TransportError) {
        let ending = {
            let mut s = self.lock();
            if s.generation != generation {
                return;
            }
            match s.state {
                StreamState::Open => {
                    self.begin_reconnect_locked(&mut s, &error);
                    false
                }
                StreamState::Ending => true,
                _ => false,
            }
        };
        if ending {
            self.finish();
        }
    }

    fn on_remote_end(&self, generation: u64) {
        if self.lock().generation != generation {
            return;
        }
        tracing::debug!(stream_id = %self.id, "Server finished the stream");
        self.finish();
    }

    /// Terminal `Ended` transition. Emits `End` once.
    fn finish(&self) {
        {
            let mut s = self.lock();
            if s.state.is_terminal() {
                return;
            }
            s.state = StreamState::Ended;
            s.sink = None;
            s.generation += 1;
            s.dropped += s.queue.len() as u64;
            s.queue.clear();
        }
        metrics::gauge!("authz_active_streams").decrement(1.0);
        tracing::info!(stream_id = %self.id, "Stream ended");
        let _ = self.events.send(StreamEvent::End);
        self.shutdown.trigger();
        self.changed.notify_waiters();
    }

    /// Terminal `Failed` transition after reconnects ran out.
    fn fail(&self, attempts: u32) {
        {
            let mut s = self.lock();
            if s.state.is_terminal() {
                return;
            }
            s.state = StreamState::Failed;
            s.sink = None;
            s.generation += 1;
            s.dropped += s.queue.len() as u64;
            s.queue.clear();
        }
        metrics::gauge!("authz_active_streams").decrement(1.0);
        tracing::error!(stream_id = %self.id, attempts, "Stream reconnect abandoned");
        let _ = self
            .events
            .send(StreamEvent::Error(TransportError::ReconnectExhausted { attempts }));
        self.shutdown.trigger();
        self.changed.notify_waiters();
    }

    async fn wait_flushed(self: &Arc<Self>) {
        loop {
            let notified = self.changed.notified();
            let mut events = Vec::new();
            let done = {
                let mut s = self.lock();
                self.flush_locked(&mut s, &mut events);
                s.queue.is_empty() || s.sink.is_none() || s.state.is_terminal()
            };
            self.emit_all(events);
            if done {
                return;
            }
            notified.await;
        }
    }

    async fn wait_terminal(&self) {
        loop {
            let notified = self.changed.notified();
            if self.lock().state.is_terminal() {
                return;
            }
            notified.await;
        }
    }

    fn spawn_janitor(self: &Arc<Self>) {
        let ttl = self.latency.ttl();
        if ttl.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { return };
                        let evicted = inner.latency.purge_stale();
                        if evicted > 0 {
                            tracing::debug!(stream_id = %inner.id, evicted, "Evicted stale latency entries");
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        });
    }
}

async fn drain_wait(
    stream: Weak<StreamInner>,
    sink: Arc<dyn StreamSink>,
    generation: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = sink.drained() => {}
        _ = shutdown.recv() => return,
    }
    if let Some(inner) = stream.upgrade() {
        inner.on_drained(generation);
    }
}

async fn read_loop(
    stream: Weak<StreamInner>,
    mut source: Box<dyn StreamSource>,
    generation: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            next = source.next() => next,
            _ = shutdown.recv() => return,
        };
        let Some(inner) = stream.upgrade() else { return };
        match next {
            Some(Ok(response)) => inner.on_response(response),
            Some(Err(e)) => {
                inner.on_transport_error(generation, e);
                return;
            }
            None => {
                inner.on_remote_end(generation);
                return;
            }
        }
    }
}

async fn reconnect_loop(stream: Weak<StreamInner>, mut shutdown: broadcast::Receiver<()>) {
    let mut attempt = 0u32;
    loop {
        let (delay, factory, id) = {
            let Some(inner) = stream.upgrade() else { return };
            if inner.lock().state != StreamState::Reconnecting {
                return;
            }
            if inner.backoff.is_exhausted(attempt) {
                inner.fail(attempt);
                return;
            }
            (inner.backoff.delay(attempt), Arc::clone(&inner.factory), inner.id)
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => return,
        }

        attempt += 1;
        match factory.open().await {
            Ok(parts) => {
                let Some(inner) = stream.upgrade() else { return };
                tracing::info!(stream_id = %id, attempt, "Stream reconnected");
                inner.install(parts, Some(attempt));
                return;
            }
            Err(e) => {
                tracing::warn!(stream_id = %id, attempt, error = %e, "Stream reconnect attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Principal, Resource};
    use crate::transport::mock::{allow_all, MockStreamFactory};

    fn backpressure(high: usize, low: usize, max: usize) -> BackpressureConfig {
        BackpressureConfig {
            high_water_mark: high,
            low_water_mark: low,
            max_buffer_size: max,
            ..Default::default()
        }
    }

    fn reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 10,
            max_delay_ms: 100,
            multiplier: 2.0,
            jitter: false,
            max_attempts,
        }
    }

    fn request(n: usize) -> CheckRequest {
        let mut request = CheckRequest::new(
            Principal::new("alice", "user"),
            Resource::new("document", "doc-1"),
            ["read"],
        );
        request.request_id = format!("req-{n}");
        request
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("no event in time")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_full_transport_queues_then_drops_past_max() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(0);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        stream.open().await.unwrap();

        let mut outcomes = Vec::new();
        for n in 1..=12 {
            outcomes.push(stream.send(request(n)));
            if n == 1 {
                assert!(matches!(
                    events.try_recv(),
                    Ok(StreamEvent::TransportBlocked { blocked: true, queued: 1 })
                ));
            }
            if n == 4 {
                assert!(events.try_recv().is_err());
                assert!(!stream.is_writable());
                assert!(!stream.stats().backpressured);
            }
            if n == 5 {
                assert!(matches!(
                    events.try_recv(),
                    Ok(StreamEvent::Backpressure { active: true, queued: 5 })
                ));
                assert!(!stream.is_writable());
            }
        }

        assert!(outcomes[..10].iter().all(|o| *o == SendOutcome::Queued));
        assert_eq!(&outcomes[10..], &[SendOutcome::Dropped, SendOutcome::Dropped]);
        let stats = stream.stats();
        assert_eq!(stats.queued, 10);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.peak_buffer, 10);
        assert_eq!(stats.sent, 0);
        assert!(handle.sink.written().is_empty());
    }

    #[tokio::test]
    async fn test_drain_flushes_in_order_and_clears_backpressure() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(0);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        stream.open().await.unwrap();
        for n in 1..=6 {
            stream.send(request(n));
        }
        assert!(matches!(next_event(&mut events).await, StreamEvent::TransportBlocked { blocked: true, .. }));
        assert!(matches!(next_event(&mut events).await, StreamEvent::Backpressure { active: true, .. }));

        handle.sink.drain(100);
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::TransportBlocked { blocked: false, queued: 6 }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::Backpressure { active: false, queued: 0 }
        ));

        let written: Vec<_> = handle.sink.written().into_iter().map(|r| r.request_id).collect();
        let expected: Vec<_> = (1..=6).map(|n| format!("req-{n}")).collect();
        assert_eq!(written, expected);
        assert!(stream.is_writable());
        assert_eq!(stream.send(request(7)), SendOutcome::Written);
    }

    #[tokio::test]
    async fn test_full_transport_signals_below_high_watermark() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(1);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(100, 50, 200), &reconnect(3));
        stream.open().await.unwrap();

        let outcomes: Vec<_> = (1..=3).map(|n| stream.send(request(n))).collect();
        assert_eq!(outcomes, [SendOutcome::Written, SendOutcome::Queued, SendOutcome::Queued]);
        assert!(matches!(
            events.try_recv(),
            Ok(StreamEvent::TransportBlocked { blocked: true, queued: 1 })
        ));
        assert!(!stream.is_writable());
        assert!(stream.stats().transport_blocked);
        assert_eq!(stream.stats().queued, 2);

        handle.sink.drain(100);
        assert!(matches!(
            next_event(&mut events).await,
            StreamEvent::TransportBlocked { blocked: false, queued: 2 }
        ));
        assert_eq!(handle.sink.written().len(), 3);
        assert_eq!(stream.stats().sent, 3);
        assert!(stream.is_writable());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_response_latency_correlated_by_request_id() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(usize::MAX);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        stream.open().await.unwrap();

        let req = request(1);
        assert_eq!(stream.send(req.clone()), SendOutcome::Written);
        handle.responses.send(Ok(allow_all(&req))).unwrap();

        match next_event(&mut events).await {
            StreamEvent::Response { response, latency } => {
                assert_eq!(response.request_id, "req-1");
                assert!(latency.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let stats = stream.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.pending_latency, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_reconnects_and_flushes_queue() {
        let factory = MockStreamFactory::new();
        let first = factory.push(usize::MAX);
        let second = factory.push(usize::MAX);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        stream.open().await.unwrap();

        first.responses.send(Err(TransportError::Stream("reset".into()))).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(stream.state(), StreamState::Reconnecting);
        assert_eq!(stream.send(request(1)), SendOutcome::Queued);

        assert!(matches!(next_event(&mut events).await, StreamEvent::Reconnected { attempt: 1 }));
        assert_eq!(stream.state(), StreamState::Open);
        assert_eq!(second.sink.written()[0].request_id, "req-1");
        assert_eq!(factory.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_fatal() {
        let factory = MockStreamFactory::new();
        let first = factory.push(usize::MAX);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(2));
        stream.open().await.unwrap();

        first.responses.send(Err(TransportError::Stream("reset".into()))).unwrap();
        match next_event(&mut events).await {
            StreamEvent::Error(TransportError::ReconnectExhausted { attempts }) => assert_eq!(attempts, 2),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(stream.state(), StreamState::Failed);
        assert_eq!(stream.send(request(1)), SendOutcome::Closed);
        assert_eq!(factory.opens(), 3);
    }

    #[tokio::test]
    async fn test_pause_holds_writes_until_resume() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(usize::MAX);
        let (stream, _events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        stream.open().await.unwrap();

        stream.pause();
        assert!(!stream.is_writable());
        assert_eq!(stream.send(request(1)), SendOutcome::Queued);
        assert!(handle.sink.written().is_empty());

        stream.resume();
        assert_eq!(handle.sink.written().len(), 1);
        assert_eq!(stream.send(request(2)), SendOutcome::Written);
    }

    #[tokio::test]
    async fn test_sends_before_open_are_flushed_on_open() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(usize::MAX);
        let (stream, _events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));

        assert_eq!(stream.send(request(1)), SendOutcome::Queued);
        stream.open().await.unwrap();
        assert_eq!(handle.sink.written().len(), 1);
        assert_eq!(stream.stats().sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_flushes_then_closes() {
        let factory = MockStreamFactory::new();
        let handle = factory.push(usize::MAX);
        let (stream, mut events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        stream.open().await.unwrap();

        stream.pause();
        for n in 1..=3 {
            stream.send(request(n));
        }
        stream.end().await.unwrap();

        assert_eq!(handle.sink.written().len(), 3);
        assert!(handle.sink.is_closed());
        assert_eq!(stream.state(), StreamState::Ended);
        assert!(matches!(next_event(&mut events).await, StreamEvent::End));
        assert_eq!(stream.send(request(4)), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let factory = MockStreamFactory::new();
        let (stream, _events) = StreamManager::new(factory.clone(), backpressure(5, 2, 10), &reconnect(3));
        assert!(stream.open().await.is_err());
        assert_eq!(stream.state(), StreamState::Failed);
        assert!(stream.open().await.is_err());
    }
}
