//! Shared utilities for integration tests.
//!
//! `MockRpcServer` speaks the binary frame protocol on a real TCP listener;
//! `MockEventServer` is an axum app serving the event-stream endpoints.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use authz_transport::codec::wire::{WireBatchResponse, WireCheckResponse};
use authz_transport::codec::{
    read_frame, write_frame, ActionResult, CheckRequest, CheckResponse, Effect, Frame, FrameBody,
    Principal, Resource, ResponseMetadata,
};
use authz_transport::config::{ClientConfig, ProtocolMode};
use authz_transport::transport::event_stream::{BatchEvent, BatchSubmission};

pub fn request(actions: &[&str]) -> CheckRequest {
    CheckRequest::new(
        Principal::new("alice", "user").with_roles(["editor"]),
        Resource::new("document", "doc-1"),
        actions.iter().copied(),
    )
}

/// Allow everything except the actions in `denied`.
pub fn decide(request: &CheckRequest, denied: &HashSet<String>) -> CheckResponse {
    CheckResponse {
        request_id: request.request_id.clone(),
        results: request
            .actions
            .iter()
            .map(|action| {
                let effect = if denied.contains(action) {
                    Effect::Deny
                } else {
                    Effect::Allow
                };
                (
                    action.clone(),
                    ActionResult {
                        effect,
                        matched: true,
                        ..Default::default()
                    },
                )
            })
            .collect(),
        metadata: Some(ResponseMetadata {
            evaluation_duration_us: 42,
            policies_evaluated: 1,
            cache_hit: false,
        }),
        ..Default::default()
    }
}

/// Client config for tests: small pool, fast retries, no background probing.
pub fn client_config(address: &str) -> ClientConfig {
    let mut config = ClientConfig {
        address: address.to_string(),
        protocol: ProtocolMode::Rpc,
        timeout_ms: 2_000,
        connect_timeout_ms: 500,
        max_retries: 1,
        retry_delay_ms: 10,
        ..Default::default()
    };
    config.connection_pool.min_connections = 1;
    config.connection_pool.max_connections = 4;
    config.connection_pool.acquire_timeout_ms = 200;
    config.health_check.enabled = false;
    config.reconnect.initial_delay_ms = 20;
    config.reconnect.max_delay_ms = 200;
    config.reconnect.max_attempts = 3;
    config
}

/// An address nothing listens on.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[derive(Default)]
struct RpcState {
    denied: Mutex<HashSet<String>>,
    unhealthy: AtomicBool,
    connections: AtomicUsize,
    checks: AtomicUsize,
    stream_messages: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Binary RPC server built on the crate's own frame codec.
pub struct MockRpcServer {
    addr: SocketAddr,
    state: Arc<RpcState>,
}

impl MockRpcServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RpcState::default());

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let conn = tokio::spawn(serve_rpc(socket, Arc::clone(&accept_state)));
                accept_state.tasks.lock().unwrap().push(conn);
            }
        });
        state.tasks.lock().unwrap().push(accept);

        Self { addr, state }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn deny(&self, action: &str) {
        self.state.denied.lock().unwrap().insert(action.to_string());
    }

    /// Answer pings with an error instead of a pong.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> usize {
        self.state.checks.load(Ordering::SeqCst)
    }

    pub fn stream_messages(&self) -> usize {
        self.state.stream_messages.load(Ordering::SeqCst)
    }

    /// Stop accepting and drop every open socket.
    pub fn stop(&self) {
        for task in self.state.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockRpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_rpc(socket: TcpStream, state: Arc<RpcState>) {
    let (mut reader, mut writer) = socket.into_split();
    while let Ok(Some(frame)) = read_frame(&mut reader).await {
        let denied = state.denied.lock().unwrap().clone();
        let body = match frame.body {
            FrameBody::Check(wire) => {
                state.checks.fetch_add(1, Ordering::SeqCst);
                let response = decide(&CheckRequest::from(wire), &denied);
                FrameBody::CheckResult(WireCheckResponse::from(&response))
            }
            FrameBody::CheckBatch(batch) => {
                state.checks.fetch_add(batch.requests.len(), Ordering::SeqCst);
                let responses = batch
                    .requests
                    .into_iter()
                    .map(|wire| WireCheckResponse::from(&decide(&CheckRequest::from(wire), &denied)))
                    .collect();
                FrameBody::BatchResult(WireBatchResponse { responses })
            }
            FrameBody::Ping if state.unhealthy.load(Ordering::SeqCst) => FrameBody::Error {
                code: "unavailable".into(),
                message: "not serving".into(),
            },
            FrameBody::Ping => FrameBody::Pong,
            FrameBody::StreamOpen => continue,
            FrameBody::StreamMessage(wire) => {
                state.stream_messages.fetch_add(1, Ordering::SeqCst);
                FrameBody::StreamResponse(WireCheckResponse::from(&decide(&CheckRequest::from(wire), &denied)))
            }
            FrameBody::StreamEnd => {
                let _ = write_frame(&mut writer, &Frame::new(frame.call_id, FrameBody::StreamEnd)).await;
                break;
            }
            other => FrameBody::Error {
                code: "invalid_argument".into(),
                message: format!("unexpected frame {other:?}"),
            },
        };
        if write_frame(&mut writer, &Frame::new(frame.call_id, body)).await.is_err() {
            break;
        }
    }
}

#[derive(Clone)]
struct EventState {
    events: broadcast::Sender<(u64, &'static str, String)>,
    next_id: Arc<AtomicU64>,
    subscriptions: Arc<AtomicUsize>,
    last_event_ids: Arc<Mutex<Vec<Option<String>>>>,
    denied: Arc<Mutex<HashSet<String>>>,
}

impl EventState {
    fn publish(&self, event: &'static str, data: String) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send((id, event, data));
    }
}

/// Event-stream server: `GET /v1/events`, `POST /v1/check`,
/// `POST /v1/check/batch`, `GET /v1/health`.
pub struct MockEventServer {
    addr: SocketAddr,
    state: EventState,
    task: JoinHandle<()>,
}

impl MockEventServer {
    pub async fn start() -> Self {
        let (events, _) = broadcast::channel(64);
        let state = EventState {
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            subscriptions: Arc::new(AtomicUsize::new(0)),
            last_event_ids: Arc::new(Mutex::new(Vec::new())),
            denied: Arc::new(Mutex::new(HashSet::new())),
        };

        let app = Router::new()
            .route("/v1/events", get(events_handler))
            .route("/v1/check", post(check_handler))
            .route("/v1/check/batch", post(batch_handler))
            .route("/v1/health", get(|| async { StatusCode::OK }))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn deny(&self, action: &str) {
        self.state.denied.lock().unwrap().insert(action.to_string());
    }

    pub fn subscriptions(&self) -> usize {
        self.state.subscriptions.load(Ordering::SeqCst)
    }

    pub fn publish_health(&self, status: &str) {
        self.state
            .publish("health", format!(r#"{{"status":"{status}"}}"#));
    }
}

impl Drop for MockEventServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn events_handler(
    State(state): State<EventState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    state.subscriptions.fetch_add(1, Ordering::SeqCst);
    let last_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.last_event_ids.lock().unwrap().push(last_id);

    let rx = state.events.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok((id, name, data)) => {
                    let event = Event::default().id(id.to_string()).event(name).data(data);
                    return Some((Ok(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(1)))
}

async fn check_handler(State(state): State<EventState>, Json(request): Json<CheckRequest>) -> StatusCode {
    let denied = state.denied.lock().unwrap().clone();
    let response = decide(&request, &denied);
    state.publish("check_response", serde_json::to_string(&response).unwrap());
    StatusCode::ACCEPTED
}

async fn batch_handler(
    State(state): State<EventState>,
    Json(submission): Json<BatchSubmission>,
) -> StatusCode {
    let denied = state.denied.lock().unwrap().clone();
    let batch = BatchEvent {
        batch_id: submission.batch_id,
        responses: submission.requests.iter().map(|r| decide(r, &denied)).collect(),
    };
    state.publish("batch_response", serde_json::to_string(&batch).unwrap());
    StatusCode::ACCEPTED
}
