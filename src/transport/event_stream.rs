//! Event-stream fallback transport.
//!
//! # Responsibilities
//! - Keep one `text/event-stream` subscription open against the service
//! - Submit checks and batches as out-of-band HTTP requests
//! - Correlate typed stream events back to waiting callers
//! - Resume with `Last-Event-ID` after the subscription drops
//!
//! # Design Decisions
//! - Callers register before submitting, so an early event is never lost
//! - Reconnects share the pool's backoff schedule; exhaustion fails all
//!   pending calls
//! - Duplex streaming is not offered on this transport

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

use crate::codec::{CheckRequest, CheckResponse};
use crate::config::schema::ReconnectConfig;
use crate::error::{Result, TransportError};
use crate::lifecycle::Shutdown;
use crate::resilience::Backoff;
use crate::transport::sse::{SseEvent, SseParser};
use crate::transport::{Metadata, Session};

pub const EVENTS_PATH: &str = "v1/events";
pub const CHECK_PATH: &str = "v1/check";
pub const BATCH_PATH: &str = "v1/check/batch";
pub const HEALTH_PATH: &str = "v1/health";

const LAST_EVENT_ID: &str = "Last-Event-ID";

#[derive(Debug)]
enum Reply {
    Single(CheckResponse),
    Batch(Vec<CheckResponse>),
}

/// `batch_response` event payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchEvent {
    pub batch_id: String,
    pub responses: Vec<CheckResponse>,
}

/// `error` event payload, correlated by request or batch id when present.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub code: String,
    pub message: String,
}

/// `health` event payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthEvent {
    pub status: String,
}

/// Body of `POST /v1/check/batch`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub batch_id: String,
    pub requests: Vec<CheckRequest>,
}

/// HTTP + server-sent-events transport used when binary RPC is unavailable.
pub struct EventStreamTransport {
    inner: Arc<Inner>,
}

struct Inner {
    base: Url,
    http: reqwest::Client,
    pending: DashMap<String, oneshot::Sender<Result<Reply>>>,
    last_event_id: Mutex<Option<String>>,
    server_status: Mutex<Option<String>>,
    connected: AtomicBool,
    closed: AtomicBool,
    backoff: Backoff,
    shutdown: Shutdown,
}

impl EventStreamTransport {
    /// Build the transport without touching the network.
    pub fn new(base_url: &str, connect_timeout: Duration, reconnect: &ReconnectConfig) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| TransportError::Connection(format!("invalid fallback url {base_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                base,
                http,
                pending: DashMap::new(),
                last_event_id: Mutex::new(None),
                server_status: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                backoff: Backoff::new(reconnect),
                shutdown: Shutdown::new(),
            }),
        })
    }

    /// Open the event subscription and start the reader task.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ShuttingDown);
        }
        let response = self.inner.open_events().await?;
        self.inner.connected.store(true, Ordering::SeqCst);
        tracing::info!(url = %self.inner.base, "Event stream connected");

        tokio::spawn(run_events(Arc::downgrade(&self.inner), response));
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base
    }

    /// Last resumption id seen on the subscription.
    pub fn last_event_id(&self) -> Option<String> {
        lock(&self.inner.last_event_id).clone()
    }

    /// Status reported by the most recent `health` event.
    pub fn server_status(&self) -> Option<String> {
        lock(&self.inner.server_status).clone()
    }

    async fn submit<T: Serialize>(
        &self,
        path: &str,
        key: String,
        body: &T,
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<Reply> {
        if self.is_closed() {
            return Err(TransportError::ShuttingDown);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let endpoint = self.inner.endpoint(path)?;
        let (tx, rx) = oneshot::channel();
        match self.inner.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(TransportError::Protocol(format!(
                    "request id {key} is already in flight"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let mut request = self.inner.http.post(endpoint).json(body).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let sent = request.send().await.and_then(|r| r.error_for_status());
        if let Err(e) = sent {
            self.inner.pending.remove(&key);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TransportError::Stream("event stream closed".into())),
            Err(_) => {
                self.inner.pending.remove(&key);
                Err(TransportError::Timeout(timeout))
            }
        }
    }
}

#[async_trait]
impl Session for EventStreamTransport {
    async fn check(
        &self,
        request: &CheckRequest,
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<CheckResponse> {
        let key = request.request_id.clone();
        match self.submit(CHECK_PATH, key, request, headers, timeout).await? {
            Reply::Single(response) => Ok(response),
            Reply::Batch(_) => Err(TransportError::Protocol("batch reply to a single check".into())),
        }
    }

    async fn check_batch(
        &self,
        requests: &[CheckRequest],
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<Vec<CheckResponse>> {
        let submission = BatchSubmission {
            batch_id: uuid::Uuid::new_v4().to_string(),
            requests: requests.to_vec(),
        };
        let key = submission.batch_id.clone();
        match self.submit(BATCH_PATH, key, &submission, headers, timeout).await? {
            Reply::Batch(responses) => Ok(responses),
            Reply::Single(_) => Err(TransportError::Protocol("single reply to a batch".into())),
        }
    }

    async fn probe(&self, timeout: Duration) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner
            .http
            .get(self.inner.endpoint(HEALTH_PATH)?)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.shutdown.trigger();
        self.inner.fail_pending(|| TransportError::ShuttingDown);
        tracing::info!(url = %self.inner.base, "Event stream closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for EventStreamTransport {
    fn drop(&mut self) {
        self.inner.shutdown.trigger();
    }
}

impl Inner {
    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| TransportError::Connection(format!("invalid endpoint {path}: {e}")))
    }

    async fn open_events(&self) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .get(self.endpoint(EVENTS_PATH)?)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(id) = lock(&self.last_event_id).clone() {
            request = request.header(LAST_EVENT_ID, id);
        }
        Ok(request.send().await?.error_for_status()?)
    }

    fn complete(&self, key: &str, reply: Result<Reply>) {
        match self.pending.remove(key) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => tracing::debug!(key, "Event for unknown or expired call"),
        }
    }

    fn fail_pending(&self, err: impl Fn() -> TransportError) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(err()));
            }
        }
    }

    fn handle_event(&self, event: SseEvent) {
        if let Some(id) = &event.id {
            *lock(&self.last_event_id) = Some(id.clone());
        }

        match event.event.as_str() {
            "check_response" => match serde_json::from_str::<CheckResponse>(&event.data) {
                Ok(response) => {
                    let key = response.request_id.clone();
                    self.complete(&key, Ok(Reply::Single(response)));
                }
                Err(e) => tracing::warn!(error = %e, "Malformed check_response event"),
            },
            "batch_response" => match serde_json::from_str::<BatchEvent>(&event.data) {
                Ok(batch) => self.complete(&batch.batch_id, Ok(Reply::Batch(batch.responses))),
                Err(e) => tracing::warn!(error = %e, "Malformed batch_response event"),
            },
            "error" => match serde_json::from_str::<ErrorEvent>(&event.data) {
                Ok(err) => match err.request_id.or(err.batch_id) {
                    Some(key) => self.complete(
                        &key,
                        Err(TransportError::Call {
                            code: err.code,
                            message: err.message,
                        }),
                    ),
                    None => tracing::warn!(code = %err.code, message = %err.message, "Server error event"),
                },
                Err(e) => tracing::warn!(error = %e, "Malformed error event"),
            },
            "health" => match serde_json::from_str::<HealthEvent>(&event.data) {
                Ok(health) => *lock(&self.server_status) = Some(health.status),
                Err(e) => tracing::warn!(error = %e, "Malformed health event"),
            },
            "heartbeat" => tracing::trace!("Event stream heartbeat"),
            other => tracing::trace!(event = other, "Ignoring unknown event type"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read the subscription until it ends, then reconnect with backoff.
async fn run_events(inner: Weak<Inner>, mut response: reqwest::Response) {
    let Some(mut shutdown_rx) = inner.upgrade().map(|i| i.shutdown.subscribe()) else {
        return;
    };

    loop {
        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();

        loop {
            tokio::select! {
                chunk = body.next() => {
                    let Some(inner) = inner.upgrade() else { return };
                    match chunk {
                        Some(Ok(bytes)) => match parser.feed(&bytes) {
                            Ok(events) => {
                                for event in events {
                                    inner.handle_event(event);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Event stream framing error");
                                break;
                            }
                        },
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Event stream read failed");
                            break;
                        }
                        None => {
                            tracing::warn!("Event stream ended by server");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => return,
            }
        }
        drop(body);

        let Some(strong) = inner.upgrade() else { return };
        if strong.shutdown.is_triggered() {
            return;
        }
        strong.connected.store(false, Ordering::SeqCst);
        let backoff = strong.backoff.clone();
        drop(strong);

        let mut attempt = 0;
        response = loop {
            if backoff.is_exhausted(attempt) {
                tracing::error!(attempts = attempt, "Event stream reconnect abandoned");
                if let Some(inner) = inner.upgrade() {
                    inner.fail_pending(|| TransportError::ReconnectExhausted { attempts: attempt });
                }
                return;
            }

            let delay = backoff.delay(attempt);
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return,
            }

            let Some(inner) = inner.upgrade() else { return };
            match inner.open_events().await {
                Ok(resp) => {
                    inner.connected.store(true, Ordering::SeqCst);
                    tracing::info!(attempt, "Event stream resumed");
                    break resp;
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Event stream reconnect failed"),
            }
        };
    }
}
