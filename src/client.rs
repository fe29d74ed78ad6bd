//! Client façade.
//!
//! # Responsibilities
//! - Own the negotiator, health monitor, tracer and metrics collector
//! - Run unary calls with retries, per-attempt timeouts, spans and metrics
//! - Open bidirectional decision streams over binary RPC
//!
//! # Design Decisions
//! - One span per logical call, not per attempt; retries show up as log events
//! - Requests are counted whether they succeed or fail

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::Instrument;

use crate::codec::{CheckRequest, CheckResponse, Metadata};
use crate::config::{load_config, validate_config, ClientConfig, ConfigError};
use crate::error::{Result, TransportError};
use crate::health::{HealthMonitor, HealthSnapshot, HealthSubscription};
use crate::load_balancer::PoolStats;
use crate::negotiation::{ActiveTransport, Protocol, ProtocolEvent, ProtocolNegotiator};
use crate::observability::{
    init_metrics, LogExporter, MetricsCollector, MetricsSnapshot, SpanExporter, TraceContext, Tracer,
};
use crate::resilience::{with_timeout, RetryPolicy};
use crate::stream::{StreamEvent, StreamManager};
use crate::transport::{Connector, ConnectorStreamFactory, TcpConnector};

/// Resilient client for the authorization decision service.
pub struct AuthzClient {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    negotiator: Arc<ProtocolNegotiator>,
    monitor: HealthMonitor,
    tracer: Tracer,
    metrics: Arc<MetricsCollector>,
    retry: RetryPolicy,
    exporter_installed: AtomicBool,
}

impl AuthzClient {
    /// Build a client that dials binary RPC over TCP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(
            config.connect_timeout(),
            config.backpressure.max_buffer_size,
        ));
        Self::with_connector(config, connector)
    }

    /// Load, validate and build from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::new(load_config(path)?)
    }

    /// Build a client over a caller-supplied connector.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let negotiator = Arc::new(ProtocolNegotiator::new(config.clone(), Arc::clone(&connector)));
        let monitor = HealthMonitor::new(
            config.health_check.clone(),
            config.failover.clone(),
            config.address.clone(),
            negotiator.clone(),
            negotiator.clone(),
        );

        Ok(Self {
            tracer: Tracer::new(&config.otel, Arc::new(LogExporter)),
            metrics: Arc::new(MetricsCollector::new(&config.otel)),
            retry: RetryPolicy::new(config.max_retries, config.retry_delay()),
            config,
            connector,
            negotiator,
            monitor,
            exporter_installed: AtomicBool::new(false),
        })
    }

    /// Replace the span exporter.
    pub fn with_span_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.tracer = Tracer::new(&self.config.otel, exporter);
        self
    }

    /// Negotiate a transport and start health monitoring.
    pub async fn connect(&self) -> Result<Protocol> {
        self.install_exporter();
        let protocol = self.negotiator.connect().await?;
        if self.config.health_check.enabled {
            self.monitor.start();
        }
        self.refresh_connection_gauge();
        tracing::info!(%protocol, address = %self.config.address, "Authorization client connected");
        Ok(protocol)
    }

    fn install_exporter(&self) {
        if !self.config.otel.metrics_enabled {
            return;
        }
        let Some(address) = self.config.otel.metrics_address.as_deref() else {
            return;
        };
        if self.exporter_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        match address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr, &self.config.otel.histogram_buckets) {
                    tracing::warn!(error = %e, %addr, "Failed to install Prometheus exporter");
                }
            }
            Err(e) => tracing::warn!(error = %e, address, "Invalid metrics address"),
        }
    }

    /// Stop health monitoring and close the active transport.
    pub async fn disconnect(&self) {
        self.monitor.stop();
        self.negotiator.disconnect().await;
        self.metrics.set_active_connections(0);
        tracing::info!("Authorization client disconnected");
    }

    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse> {
        self.check_with(request, None).await
    }

    /// Single decision, continuing the trace of `parent` when given.
    pub async fn check_with(
        &self,
        request: CheckRequest,
        parent: Option<&TraceContext>,
    ) -> Result<CheckResponse> {
        let mut span = self.tracer.start_span("authz.check", parent);
        span.record_request(&request);
        let mut headers = Metadata::new();
        span.inject(self.tracer.format(), &mut headers);

        let log_span = tracing::info_span!(
            "authz.check",
            request_id = %request.request_id,
            trace_id = %span.context().trace_id()
        );
        let started = Instant::now();
        let call = &request;
        let result = self
            .with_retries(
                move |active, headers, timeout| async move { active.check(call, headers, timeout).await },
                &headers,
            )
            .instrument(log_span)
            .await;

        self.metrics.record_request(started.elapsed());
        match &result {
            Ok(response) => {
                span.record_response(response);
                if let Some(metadata) = &response.metadata {
                    self.metrics.record_cache(metadata.cache_hit);
                }
            }
            Err(e) => {
                span.record_error(e);
                self.metrics.record_error(e.kind());
            }
        }
        span.finish();
        self.refresh_connection_gauge();
        result
    }

    /// Several decisions in one round trip. Responses keep request order.
    pub async fn check_batch(&self, requests: &[CheckRequest]) -> Result<Vec<CheckResponse>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut span = self.tracer.start_span("authz.check_batch", None);
        span.record_batch(requests);
        let mut headers = Metadata::new();
        span.inject(self.tracer.format(), &mut headers);

        let log_span = tracing::info_span!(
            "authz.check_batch",
            size = requests.len(),
            trace_id = %span.context().trace_id()
        );
        let started = Instant::now();
        let result = self
            .with_retries(
                move |active, headers, timeout| async move {
                    active.check_batch(requests, headers, timeout).await
                },
                &headers,
            )
            .instrument(log_span)
            .await;

        self.metrics.record_request(started.elapsed());
        match &result {
            Ok(responses) => {
                for metadata in responses.iter().filter_map(|r| r.metadata.as_ref()) {
                    self.metrics.record_cache(metadata.cache_hit);
                }
                span.set_attribute("authz.batch.responses", responses.len());
            }
            Err(e) => {
                span.record_error(e);
                self.metrics.record_error(e.kind());
            }
        }
        span.finish();
        self.refresh_connection_gauge();
        result
    }

    async fn with_retries<'a, F, Fut, T>(&'a self, call: F, headers: &'a Metadata) -> Result<T>
    where
        F: Fn(Arc<ActiveTransport>, &'a Metadata, Duration) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.timeout();
        self.retry
            .run(|attempt| {
                if attempt > 0 {
                    tracing::debug!(attempt, "Retrying decision call");
                }
                let active = self.negotiator.active();
                let call = &call;
                async move {
                    match active {
                        Ok(active) => with_timeout(timeout, call(active, headers, timeout)).await,
                        Err(e) => Err(e),
                    }
                }
            })
            .await
    }

    /// Open a bidirectional decision stream. Binary RPC only.
    pub async fn check_stream(&self) -> Result<(StreamManager, mpsc::UnboundedReceiver<StreamEvent>)> {
        match self.negotiator.protocol() {
            Some(Protocol::Rpc) => {}
            Some(Protocol::EventStream) => {
                return Err(TransportError::Unsupported("decision streams on the event-stream transport"))
            }
            None => return Err(TransportError::NotConnected),
        }

        let span = self.tracer.start_span("authz.check_stream", None);
        let mut headers = Metadata::new();
        span.inject(self.tracer.format(), &mut headers);

        let factory = ConnectorStreamFactory::new(
            Arc::clone(&self.connector),
            self.negotiator.current_address(),
            headers,
        );
        let (stream, events) = StreamManager::new(
            Arc::new(factory),
            self.config.backpressure.clone(),
            &self.config.reconnect,
        );
        let opened = stream.open().await;
        span.finish();
        opened?;
        tracing::debug!(stream_id = %stream.id(), "Decision stream opened");
        Ok((stream, events))
    }

    fn refresh_connection_gauge(&self) {
        let count = match self.negotiator.active() {
            Ok(active) => match active.as_ref() {
                ActiveTransport::Rpc(pool) => pool.ready_count(),
                ActiveTransport::EventStream(transport) => usize::from(transport.is_connected()),
            },
            Err(_) => 0,
        };
        self.metrics.set_active_connections(count);
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.negotiator.protocol()
    }

    pub fn fallback_reason(&self) -> Option<String> {
        self.negotiator.fallback_reason()
    }

    /// Address binary RPC is currently pointed at.
    pub fn current_address(&self) -> String {
        self.negotiator.current_address()
    }

    /// Pool numbers; `None` unless binary RPC is active.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        let active = self.negotiator.active().ok()?;
        active.pool().map(|pool| pool.stats())
    }

    pub fn health(&self) -> HealthSnapshot {
        self.monitor.get_health()
    }

    /// Probe immediately instead of waiting for the next tick.
    pub async fn check_health(&self) -> HealthSnapshot {
        self.monitor.check_now().await
    }

    pub fn subscribe_health(&self) -> HealthSubscription {
        self.monitor.subscribe()
    }

    pub fn subscribe_protocol(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.negotiator.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Prometheus text exposition of the client's metrics.
    pub fn render_metrics(&self) -> String {
        self.metrics.render_prometheus()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for AuthzClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzClient")
            .field("negotiator", &self.negotiator)
            .field("monitor", &self.monitor)
            .finish()
    }
}
