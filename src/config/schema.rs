//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::observability::tracing::PropagationFormat;

/// Root configuration for the decision client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Primary server address (e.g., "127.0.0.1:3593").
    pub address: String,

    /// Additional weighted endpoints. When empty, only `address` is used.
    pub endpoints: Vec<EndpointConfig>,

    /// Transport selection.
    pub protocol: ProtocolMode,

    /// Base URL of the event-stream fallback service.
    pub fallback_url: Option<String>,

    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,

    /// Dial timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Unary call retries after the first attempt.
    pub max_retries: u32,

    /// Base delay between unary retries in milliseconds (linear).
    pub retry_delay_ms: u64,

    pub connection_pool: PoolConfig,

    pub backpressure: BackpressureConfig,

    pub reconnect: ReconnectConfig,

    pub health_check: HealthCheckConfig,

    pub failover: FailoverConfig,

    pub otel: OtelConfig,

    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3593".to_string(),
            endpoints: Vec::new(),
            protocol: ProtocolMode::Auto,
            fallback_url: None,
            timeout_ms: 5_000,
            connect_timeout_ms: 3_000,
            max_retries: 3,
            retry_delay_ms: 100,
            connection_pool: PoolConfig::default(),
            backpressure: BackpressureConfig::default(),
            reconnect: ReconnectConfig::default(),
            health_check: HealthCheckConfig::default(),
            failover: FailoverConfig::default(),
            otel: OtelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Endpoints the pool spreads connections over.
    pub fn endpoint_list(&self) -> Vec<EndpointConfig> {
        if self.endpoints.is_empty() {
            vec![EndpointConfig {
                address: self.address.clone(),
                weight: default_weight(),
            }]
        } else {
            self.endpoints.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Which transport the negotiator may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMode {
    /// Binary RPC only; failures propagate.
    Rpc,
    /// Event-stream transport only.
    Fallback,
    /// Binary RPC first, event-stream on failure.
    #[default]
    Auto,
}

/// A single server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EndpointConfig {
    /// Endpoint address (e.g., "10.0.0.5:3593").
    pub address: String,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Load balancing strategy across pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    Weighted,
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open while the pool runs.
    pub min_connections: usize,

    /// Hard ceiling on pooled connections.
    pub max_connections: usize,

    /// Idle connections above the minimum are closed after this long.
    pub idle_timeout_ms: u64,

    /// Selection strategy.
    pub strategy: LoadBalanceStrategy,

    /// Interval between per-connection health probes.
    pub health_check_interval_ms: u64,

    /// How long `acquire` may wait for a connection.
    pub acquire_timeout_ms: u64,

    /// Consecutive probe failures before a ready connection is marked failed.
    pub health_failure_threshold: u32,

    /// In-flight calls a single connection accepts before it is skipped.
    pub max_concurrent_per_connection: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            idle_timeout_ms: 60_000,
            strategy: LoadBalanceStrategy::RoundRobin,
            health_check_interval_ms: 30_000,
            acquire_timeout_ms: 5_000,
            health_failure_threshold: 3,
            max_concurrent_per_connection: 100,
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Outbound stream buffering limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Queue depth at which the stream stops reporting writable.
    pub high_water_mark: usize,

    /// Queue depth below which writability is restored.
    pub low_water_mark: usize,

    /// Hard queue bound; excess messages are dropped.
    pub max_buffer_size: usize,

    /// Unanswered latency entries older than this are evicted.
    pub pending_ttl_ms: u64,

    /// Upper bound on the best-effort flush performed by `end()`.
    pub end_flush_timeout_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 100,
            low_water_mark: 50,
            max_buffer_size: 1_000,
            pending_ttl_ms: 60_000,
            end_flush_timeout_ms: 5_000,
        }
    }
}

impl BackpressureConfig {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }

    pub fn end_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.end_flush_timeout_ms)
    }
}

/// Exponential backoff for reconnecting sessions and streams.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,

    pub max_delay_ms: u64,

    pub multiplier: f64,

    /// Widen each delay by up to 30%.
    pub jitter: bool,

    /// Attempts before the session is abandoned.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            max_attempts: 10,
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable the periodic probe loop.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Number of consecutive successes before marking serving.
    pub healthy_threshold: u32,

    /// Number of consecutive failures before marking not serving.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 5_000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Address failover configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub enabled: bool,

    /// Candidate addresses, tried in order with wrap-around.
    pub fallback_addresses: Vec<String>,

    /// Consecutive probe failures (while not serving) before switching.
    pub failover_threshold: u32,

    /// Delay before trying to move back to the original address.
    pub failback_delay_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fallback_addresses: Vec::new(),
            failover_threshold: 3,
            failback_delay_ms: 60_000,
        }
    }
}

impl FailoverConfig {
    pub fn failback_delay(&self) -> Duration {
        Duration::from_millis(self.failback_delay_ms)
    }
}

/// Tracing and metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OtelConfig {
    pub tracing_enabled: bool,

    pub metrics_enabled: bool,

    /// Fraction of root spans exported (0.0 - 1.0).
    pub sample_rate: f64,

    /// Header format for trace context propagation.
    pub propagation_format: PropagationFormat,

    /// Reported as the `service.name` span attribute.
    pub service_name: String,

    /// Prefix for exported metric names.
    pub metrics_prefix: String,

    /// Latency histogram bucket upper bounds, in seconds.
    pub histogram_buckets: Vec<f64>,

    /// Bind address for the Prometheus scrape endpoint.
    pub metrics_address: Option<String>,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            tracing_enabled: true,
            metrics_enabled: true,
            sample_rate: 1.0,
            propagation_format: PropagationFormat::W3c,
            service_name: "authz-client".to_string(),
            metrics_prefix: "authz".to_string(),
            histogram_buckets: vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            metrics_address: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.protocol, ProtocolMode::Auto);
        assert_eq!(config.connection_pool.min_connections, 2);
        assert_eq!(config.health_check.unhealthy_threshold, 3);
        assert_eq!(config.endpoint_list().len(), 1);
        assert_eq!(config.endpoint_list()[0].address, config.address);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            address = "10.0.0.1:3593"
            protocol = "rpc"

            [connection_pool]
            strategy = "least_connections"
            max_connections = 4

            [otel]
            propagation_format = "b3"
            "#,
        )
        .unwrap();

        assert_eq!(config.protocol, ProtocolMode::Rpc);
        assert_eq!(config.connection_pool.strategy, LoadBalanceStrategy::LeastConnections);
        assert_eq!(config.connection_pool.max_connections, 4);
        assert_eq!(config.connection_pool.min_connections, 2);
        assert_eq!(config.otel.propagation_format, PropagationFormat::B3);
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    #[test]
    fn test_weighted_endpoints() {
        let config: ClientConfig = toml::from_str(
            r#"
            [[endpoints]]
            address = "a:1"
            weight = 3

            [[endpoints]]
            address = "b:1"
            "#,
        )
        .unwrap();

        let endpoints = config.endpoint_list();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].weight, 3);
        assert_eq!(endpoints[1].weight, 1);
    }
}
