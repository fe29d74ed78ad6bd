//! Scriptable in-memory transport for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use crate::codec::{ActionResult, CheckRequest, CheckResponse, Effect};
use crate::error::{Result, TransportError};
use crate::transport::{
    Connector, Metadata, Session, SinkError, StreamFactory, StreamParts, StreamSink, StreamSource,
};

/// Connector whose sessions answer every action with `Allow`.
#[derive(Default)]
pub struct MockConnector {
    unavailable: AtomicBool,
    probes_fail: Arc<AtomicBool>,
    calls_fail: Arc<AtomicBool>,
    connects: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// When false, every dial fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// When false, every session probe fails.
    pub fn set_healthy(&self, healthy: bool) {
        self.probes_fail.store(!healthy, Ordering::SeqCst);
    }

    /// When true, every unary call fails with a connection error.
    pub fn set_calls_fail(&self, fail: bool) {
        self.calls_fail.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Session>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!("{address}: refused")));
        }
        let session = Arc::new(MockSession {
            address: address.to_string(),
            closed: AtomicBool::new(false),
            probes_fail: Arc::clone(&self.probes_fail),
            calls_fail: Arc::clone(&self.calls_fail),
            calls: AtomicUsize::new(0),
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }

    async fn open_stream(&self, address: &str, _headers: &Metadata) -> Result<StreamParts> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Connection(format!("{address}: refused")));
        }
        Ok(mock_stream(usize::MAX).0)
    }
}

pub struct MockSession {
    pub address: String,
    closed: AtomicBool,
    probes_fail: Arc<AtomicBool>,
    calls_fail: Arc<AtomicBool>,
    calls: AtomicUsize,
}

impl MockSession {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn allow_all(request: &CheckRequest) -> CheckResponse {
    CheckResponse {
        request_id: request.request_id.clone(),
        results: request
            .actions
            .iter()
            .map(|a| {
                (
                    a.clone(),
                    ActionResult {
                        effect: Effect::Allow,
                        matched: true,
                        ..Default::default()
                    },
                )
            })
            .collect(),
        ..Default::default()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn check(
        &self,
        request: &CheckRequest,
        _headers: &Metadata,
        _timeout: Duration,
    ) -> Result<CheckResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.calls_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("reset by peer".into()));
        }
        Ok(allow_all(request))
    }

    async fn check_batch(
        &self,
        requests: &[CheckRequest],
        _headers: &Metadata,
        _timeout: Duration,
    ) -> Result<Vec<CheckResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(requests.iter().map(allow_all).collect())
    }

    async fn probe(&self, _timeout: Duration) -> Result<()> {
        if self.is_closed() || self.probes_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("probe failed".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SinkState {
    written: Vec<CheckRequest>,
    in_buffer: usize,
    capacity: usize,
    closed: bool,
}

/// Sink with a fixed buffer; tests drain it explicitly.
pub struct MockSink {
    state: Mutex<SinkState>,
    notify: Notify,
}

impl MockSink {
    pub fn written(&self) -> Vec<CheckRequest> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Empty the buffer and raise its capacity.
    pub fn drain(&self, capacity: usize) {
        {
            let mut state = self.state.lock().unwrap();
            state.in_buffer = 0;
            state.capacity = capacity;
        }
        self.notify.notify_waiters();
    }

    /// Simulate the transport dropping.
    pub fn break_stream(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl StreamSink for MockSink {
    fn try_write(&self, request: CheckRequest) -> std::result::Result<(), SinkError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SinkError::Closed(request));
        }
        if state.in_buffer >= state.capacity {
            return Err(SinkError::Full(request));
        }
        state.in_buffer += 1;
        state.written.push(request);
        Ok(())
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if state.closed || state.in_buffer < state.capacity {
                    return;
                }
            }
            notified.await;
        }
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

pub struct MockSource {
    rx: mpsc::UnboundedReceiver<Result<CheckResponse>>,
}

#[async_trait]
impl StreamSource for MockSource {
    async fn next(&mut self) -> Option<Result<CheckResponse>> {
        self.rx.recv().await
    }
}

/// Test-side handle on one mock stream.
#[derive(Clone)]
pub struct MockStreamHandle {
    pub sink: Arc<MockSink>,
    pub responses: mpsc::UnboundedSender<Result<CheckResponse>>,
}

pub fn mock_stream(capacity: usize) -> (StreamParts, MockStreamHandle) {
    let sink = Arc::new(MockSink {
        state: Mutex::new(SinkState {
            capacity,
            ..Default::default()
        }),
        notify: Notify::new(),
    });
    let (tx, rx) = mpsc::unbounded_channel();
    let parts = StreamParts {
        sink: sink.clone(),
        source: Box::new(MockSource { rx }),
    };
    (parts, MockStreamHandle { sink, responses: tx })
}

/// Factory that hands out prepared streams in order, then fails.
#[derive(Default)]
pub struct MockStreamFactory {
    script: Mutex<VecDeque<StreamParts>>,
    opens: AtomicUsize,
}

impl MockStreamFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a stream with the given sink capacity and return its handle.
    pub fn push(&self, capacity: usize) -> MockStreamHandle {
        let (parts, handle) = mock_stream(capacity);
        self.script.lock().unwrap().push_back(parts);
        handle
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamFactory for MockStreamFactory {
    async fn open(&self) -> Result<StreamParts> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Connection("no stream available".into()))
    }
}
