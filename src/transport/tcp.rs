//! Binary RPC over TCP.
//!
//! # Responsibilities
//! - Dial endpoints with a connect timeout
//! - Multiplex unary calls over one socket by call id
//! - Open dedicated duplex sockets for streaming checks
//!
//! # Design Decisions
//! - A writer task owns the write half; callers enqueue frames on a channel
//! - A reader task owns the read half and completes pending calls by id
//! - When the socket dies every pending call fails at once

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::frame::{read_frame, write_frame, Frame, FrameBody, Metadata};
use crate::codec::wire::{WireBatchRequest, WireCheckRequest};
use crate::codec::{CheckRequest, CheckResponse};
use crate::error::{Result, TransportError};
use crate::transport::{Connector, Session, SinkError, StreamParts, StreamSink, StreamSource};

/// Call id used for every frame on a dedicated stream socket.
const STREAM_CALL_ID: u64 = 1;

type PendingCalls = DashMap<u64, oneshot::Sender<Result<FrameBody>>>;

/// Dials binary RPC sessions and streams over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    stream_buffer: usize,
}

impl TcpConnector {
    /// `stream_buffer` bounds the frames queued on a stream socket before the
    /// sink reports full.
    pub fn new(connect_timeout: Duration, stream_buffer: usize) -> Self {
        Self {
            connect_timeout,
            stream_buffer: stream_buffer.max(1),
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::Connection(format!("{address}: {e}"))),
            Err(_) => Err(TransportError::Connection(format!(
                "{address}: connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Session>> {
        let stream = self.dial(address).await?;
        tracing::debug!(address, "Session established");
        Ok(Arc::new(TcpSession::start(address, stream)))
    }

    async fn open_stream(&self, address: &str, headers: &Metadata) -> Result<StreamParts> {
        let stream = self.dial(address).await?;
        let (read_half, mut write_half) = stream.into_split();

        let open = Frame::new(STREAM_CALL_ID, FrameBody::StreamOpen).with_headers(headers.clone());
        write_frame(&mut write_half, &open).await?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(stream_writer(write_half, rx));
        tracing::debug!(address, "Stream opened");

        Ok(StreamParts {
            sink: Arc::new(TcpStreamSink { tx }),
            source: Box::new(TcpStreamSource {
                read_half,
                finished: false,
            }),
        })
    }
}

/// One multiplexed RPC socket.
pub struct TcpSession {
    address: String,
    next_call_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpSession {
    fn start(address: &str, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(session_writer(
            write_half,
            rx,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));
        let reader = tokio::spawn(session_reader(
            read_half,
            address.to_string(),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            address: address.to_string(),
            next_call_id: AtomicU64::new(1),
            outbound,
            pending,
            closed,
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    async fn call(&self, body: FrameBody, headers: &Metadata, timeout: Duration) -> Result<FrameBody> {
        if self.is_closed() {
            return Err(TransportError::Connection(format!("{}: session closed", self.address)));
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        let frame = Frame::new(call_id, body).with_headers(headers.clone());
        if self.outbound.send(frame).is_err() {
            self.pending.remove(&call_id);
            return Err(TransportError::Connection(format!("{}: session closed", self.address)));
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => {
                return Err(TransportError::Connection(format!(
                    "{}: session closed awaiting response",
                    self.address
                )))
            }
            Err(_) => {
                self.pending.remove(&call_id);
                return Err(TransportError::Timeout(timeout));
            }
        };

        match reply {
            FrameBody::Error { code, message } => Err(TransportError::Call { code, message }),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn check(
        &self,
        request: &CheckRequest,
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<CheckResponse> {
        let body = FrameBody::Check(WireCheckRequest::from(request));
        match self.call(body, headers, timeout).await? {
            FrameBody::CheckResult(wire) => Ok(wire.into()),
            other => Err(unexpected("check_result", &other)),
        }
    }

    async fn check_batch(
        &self,
        requests: &[CheckRequest],
        headers: &Metadata,
        timeout: Duration,
    ) -> Result<Vec<CheckResponse>> {
        let body = FrameBody::CheckBatch(WireBatchRequest {
            requests: requests.iter().map(WireCheckRequest::from).collect(),
        });
        match self.call(body, headers, timeout).await? {
            FrameBody::BatchResult(wire) => {
                Ok(wire.responses.into_iter().map(Into::into).collect())
            }
            other => Err(unexpected("batch_result", &other)),
        }
    }

    async fn probe(&self, timeout: Duration) -> Result<()> {
        match self.call(FrameBody::Ping, &Metadata::new(), timeout).await? {
            FrameBody::Pong => Ok(()),
            other => Err(unexpected("pong", &other)),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        fail_pending(&self.pending, &self.address);
        tracing::debug!(address = %self.address, "Session closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn unexpected(expected: &str, got: &FrameBody) -> TransportError {
    TransportError::Protocol(format!("expected {expected}, got {got:?}"))
}

fn fail_pending(pending: &PendingCalls, address: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(TransportError::Connection(format!(
                "{address}: connection lost"
            ))));
        }
    }
}

async fn session_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            tracing::debug!(error = %e, "Session write failed");
            closed.store(true, Ordering::SeqCst);
            if let Some((_, tx)) = pending.remove(&frame.call_id) {
                let _ = tx.send(Err(e));
            }
            break;
        }
    }
}

async fn session_reader(
    mut read_half: OwnedReadHalf,
    address: String,
    pending: Arc<PendingCalls>,
    closed: Arc<AtomicBool>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => match pending.remove(&frame.call_id) {
                Some((_, tx)) => {
                    let _ = tx.send(Ok(frame.body));
                }
                None => tracing::trace!(call_id = frame.call_id, "Dropping reply for unknown call"),
            },
            Ok(None) => {
                tracing::debug!(address = %address, "Server closed session");
                break;
            }
            Err(e) => {
                tracing::debug!(address = %address, error = %e, "Session read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending, &address);
}

async fn stream_writer(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let is_end = matches!(frame.body, FrameBody::StreamEnd);
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            tracing::debug!(error = %e, "Stream write failed");
            return;
        }
        if is_end {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

struct TcpStreamSink {
    tx: mpsc::Sender<Frame>,
}

#[async_trait]
impl StreamSink for TcpStreamSink {
    fn try_write(&self, request: CheckRequest) -> std::result::Result<(), SinkError> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                permit.send(Frame::new(
                    STREAM_CALL_ID,
                    FrameBody::StreamMessage(WireCheckRequest::from(&request)),
                ));
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(SinkError::Full(request)),
            Err(mpsc::error::TrySendError::Closed(())) => Err(SinkError::Closed(request)),
        }
    }

    async fn drained(&self) {
        // The permit is released on drop, so this only waits for capacity.
        let _ = self.tx.reserve().await;
    }

    async fn close(&self) {
        let _ = self.tx.send(Frame::new(STREAM_CALL_ID, FrameBody::StreamEnd)).await;
    }
}

struct TcpStreamSource {
    read_half: OwnedReadHalf,
    finished: bool,
}

#[async_trait]
impl StreamSource for TcpStreamSource {
    async fn next(&mut self) -> Option<Result<CheckResponse>> {
        while !self.finished {
            match read_frame(&mut self.read_half).await {
                Ok(Some(frame)) => match frame.body {
                    FrameBody::StreamResponse(wire) => return Some(Ok(wire.into())),
                    FrameBody::StreamEnd => {
                        self.finished = true;
                        return None;
                    }
                    FrameBody::Error { code, message } => {
                        self.finished = true;
                        return Some(Err(TransportError::Call { code, message }));
                    }
                    other => tracing::trace!(frame = ?other, "Ignoring frame on stream"),
                },
                Ok(None) => {
                    self.finished = true;
                    return Some(Err(TransportError::Stream("connection closed by server".into())));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(TransportError::Stream(e.to_string())));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::wire::WireCheckResponse;
    use crate::codec::{Principal, Resource};
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    while let Ok(Some(frame)) = read_frame(&mut socket).await {
                        let body = match frame.body {
                            FrameBody::Ping => FrameBody::Pong,
                            FrameBody::Check(req) => FrameBody::CheckResult(WireCheckResponse {
                                request_id: req.request_id,
                                ..Default::default()
                            }),
                            _ => FrameBody::Error {
                                code: "unimplemented".into(),
                                message: "no".into(),
                            },
                        };
                        if write_frame(&mut socket, &Frame::new(frame.call_id, body)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_unary_call_and_probe() {
        let addr = echo_server().await;
        let connector = TcpConnector::new(Duration::from_secs(1), 8);
        let session = connector.connect(&addr).await.unwrap();

        let req = CheckRequest::new(Principal::new("u1", "user"), Resource::new("doc", "d1"), ["read"]);
        let resp = session
            .check(&req, &Metadata::new(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.request_id, req.request_id);
        session.probe(Duration::from_secs(1)).await.unwrap();

        let err = session
            .check_batch(&[req], &Metadata::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Call { ref code, .. } if code == "unimplemented"));

        session.close().await;
        assert!(session.is_closed());
        assert!(session.probe(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_failure_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(1), 8);
        let err = connector.connect(&addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
    }
}
