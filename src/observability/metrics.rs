//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Count decision requests and errors by type
//! - Track call latency in a bucketed histogram
//! - Track active connections and the cache-hit ratio
//! - Render the Prometheus text format on demand
//!
//! # Metrics
//! - `{prefix}_requests_total` (counter)
//! - `{prefix}_errors_total{error_type}` (counter)
//! - `{prefix}_active_connections` (gauge)
//! - `{prefix}_request_latency_seconds` (histogram)
//! - `{prefix}_cache_hit_ratio` (gauge)
//!
//! # Design Decisions
//! - Each collector owns a `PrometheusRecorder`; `render_prometheus()` is
//!   its handle's render
//! - Every record also goes to the global `metrics` facade, so an installed
//!   exporter sees the same numbers
//! - `snapshot()` keeps plain counters for values callers read back

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::schema::OtelConfig;

/// Install the Prometheus scrape endpoint for the `metrics` facade.
pub fn init_metrics(addr: SocketAddr, buckets: &[f64]) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(buckets)?
        .install()?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Read-only copy of the collector's numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub errors: BTreeMap<String, u64>,
    pub active_connections: usize,
    pub cache_hit_ratio: f64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    enabled: bool,
    prefix: String,
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    requests: AtomicU64,
    errors: Mutex<BTreeMap<String, u64>>,
    active_connections: AtomicUsize,
    cache_hits: AtomicU64,
    cache_lookups: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn build_recorder(buckets: &[f64]) -> PrometheusRecorder {
    let mut buckets: Vec<f64> = buckets.iter().copied().filter(|b| b.is_finite()).collect();
    buckets.sort_by(f64::total_cmp);
    buckets.dedup();

    match PrometheusBuilder::new().set_buckets(&buckets) {
        Ok(builder) => builder.build_recorder(),
        Err(e) => {
            tracing::warn!(error = %e, "No usable histogram buckets, latency rendered as a summary");
            PrometheusBuilder::new().build_recorder()
        }
    }
}

impl MetricsCollector {
    pub fn new(config: &OtelConfig) -> Self {
        let recorder = build_recorder(&config.histogram_buckets);
        let handle = recorder.handle();
        let collector = Self {
            enabled: config.metrics_enabled,
            prefix: config.metrics_prefix.clone(),
            recorder,
            handle,
            requests: AtomicU64::new(0),
            errors: Mutex::new(BTreeMap::new()),
            active_connections: AtomicUsize::new(0),
            cache_hits: AtomicU64::new(0),
            cache_lookups: AtomicU64::new(0),
        };
        collector.describe();
        collector
    }

    fn name(&self, metric: &str) -> String {
        format!("{}_{}", self.prefix, metric)
    }

    /// Run `record` against this collector's recorder, then the global one.
    fn emit(&self, record: impl Fn()) {
        metrics::with_local_recorder(&self.recorder, &record);
        record();
    }

    fn describe(&self) {
        self.emit(|| {
            metrics::describe_counter!(self.name("requests_total"), "Total decision requests.");
            metrics::describe_counter!(self.name("errors_total"), "Failed decision requests by error type.");
            metrics::describe_gauge!(self.name("active_connections"), "Ready pooled connections.");
            metrics::describe_histogram!(self.name("request_latency_seconds"), "Decision request latency.");
            metrics::describe_gauge!(
                self.name("cache_hit_ratio"),
                "Fraction of responses served from the decision cache."
            );
        });
    }

    /// Count one completed call and its latency.
    pub fn record_request(&self, latency: Duration) {
        if !self.enabled {
            return;
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        let seconds = latency.as_secs_f64();
        self.emit(|| {
            metrics::counter!(self.name("requests_total")).increment(1);
            metrics::histogram!(self.name("request_latency_seconds")).record(seconds);
        });
    }

    pub fn record_error(&self, error_type: &str) {
        if !self.enabled {
            return;
        }
        *lock(&self.errors).entry(error_type.to_string()).or_insert(0) += 1;
        self.emit(|| {
            metrics::counter!(self.name("errors_total"), "error_type" => error_type.to_string()).increment(1);
        });
    }

    pub fn record_cache(&self, hit: bool) {
        if !self.enabled {
            return;
        }
        self.cache_lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        let ratio = self.cache_hit_ratio();
        self.emit(|| metrics::gauge!(self.name("cache_hit_ratio")).set(ratio));
    }

    pub fn set_active_connections(&self, count: usize) {
        if !self.enabled {
            return;
        }
        self.active_connections.store(count, Ordering::Relaxed);
        self.emit(|| metrics::gauge!(self.name("active_connections")).set(count as f64));
    }

    pub fn cache_hit_ratio(&self) -> f64 {
        let lookups = self.cache_lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits.load(Ordering::Relaxed) as f64 / lookups as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests.load(Ordering::Relaxed),
            errors: lock(&self.errors).clone(),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            cache_hit_ratio: self.cache_hit_ratio(),
        }
    }

    /// Prometheus text exposition of this collector's metrics.
    pub fn render_prometheus(&self) -> String {
        self.handle.render()
    }
}
