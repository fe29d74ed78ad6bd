//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (watermarks ordered, thresholds > 0)
//! - Check cross-section requirements (fallback protocol needs a URL)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ClientConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the client

use std::fmt;

use crate::config::schema::{ClientConfig, ProtocolMode};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every violation.
pub fn validate_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for endpoint in config.endpoint_list() {
        if endpoint.address.trim().is_empty() {
            errors.push(ValidationError::new("endpoints.address", "must not be empty"));
        }
    }

    if config.timeout_ms == 0 {
        errors.push(ValidationError::new("timeout_ms", "must be greater than 0"));
    }

    match (&config.protocol, &config.fallback_url) {
        (ProtocolMode::Fallback, None) => {
            errors.push(ValidationError::new(
                "fallback_url",
                "required when protocol = \"fallback\"",
            ));
        }
        (_, Some(raw)) => {
            if let Err(e) = url::Url::parse(raw) {
                errors.push(ValidationError::new("fallback_url", format!("invalid URL: {e}")));
            }
        }
        _ => {}
    }

    let pool = &config.connection_pool;
    if pool.max_connections == 0 {
        errors.push(ValidationError::new("connection_pool.max_connections", "must be at least 1"));
    }
    if pool.min_connections > pool.max_connections {
        errors.push(ValidationError::new(
            "connection_pool.min_connections",
            "must not exceed max_connections",
        ));
    }
    if pool.acquire_timeout_ms == 0 {
        errors.push(ValidationError::new("connection_pool.acquire_timeout_ms", "must be greater than 0"));
    }
    if pool.health_failure_threshold == 0 {
        errors.push(ValidationError::new("connection_pool.health_failure_threshold", "must be at least 1"));
    }
    if pool.max_concurrent_per_connection == 0 {
        errors.push(ValidationError::new(
            "connection_pool.max_concurrent_per_connection",
            "must be at least 1",
        ));
    }

    let bp = &config.backpressure;
    if bp.low_water_mark >= bp.high_water_mark {
        errors.push(ValidationError::new(
            "backpressure.low_water_mark",
            "must be lower than high_water_mark",
        ));
    }
    if bp.high_water_mark > bp.max_buffer_size {
        errors.push(ValidationError::new(
            "backpressure.high_water_mark",
            "must not exceed max_buffer_size",
        ));
    }

    let rc = &config.reconnect;
    if rc.multiplier < 1.0 {
        errors.push(ValidationError::new("reconnect.multiplier", "must be at least 1.0"));
    }
    if rc.max_attempts == 0 {
        errors.push(ValidationError::new("reconnect.max_attempts", "must be at least 1"));
    }
    if rc.initial_delay_ms > rc.max_delay_ms {
        errors.push(ValidationError::new(
            "reconnect.initial_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }

    let hc = &config.health_check;
    if hc.healthy_threshold == 0 {
        errors.push(ValidationError::new("health_check.healthy_threshold", "must be at least 1"));
    }
    if hc.unhealthy_threshold == 0 {
        errors.push(ValidationError::new("health_check.unhealthy_threshold", "must be at least 1"));
    }
    if hc.enabled && hc.interval_ms == 0 {
        errors.push(ValidationError::new("health_check.interval_ms", "must be greater than 0"));
    }

    let fo = &config.failover;
    if fo.enabled && fo.fallback_addresses.is_empty() {
        errors.push(ValidationError::new(
            "failover.fallback_addresses",
            "required when failover is enabled",
        ));
    }
    if fo.failover_threshold == 0 {
        errors.push(ValidationError::new("failover.failover_threshold", "must be at least 1"));
    }

    let otel = &config.otel;
    if !(0.0..=1.0).contains(&otel.sample_rate) {
        errors.push(ValidationError::new("otel.sample_rate", "must be within 0.0..=1.0"));
    }
    if otel.histogram_buckets.is_empty() {
        errors.push(ValidationError::new("otel.histogram_buckets", "must not be empty"));
    } else if otel.histogram_buckets.windows(2).any(|w| w[0] >= w[1]) {
        errors.push(ValidationError::new("otel.histogram_buckets", "must be strictly increasing"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
