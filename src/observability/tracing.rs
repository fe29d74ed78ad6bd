//! Distributed tracing support.
//!
//! # Responsibilities
//! - Create a span per call, inheriting the trace id from a parent context
//! - Propagate trace context into outbound call metadata
//! - Extract trace context from inbound metadata
//! - Export sampled spans on completion
//!
//! # Wire Formats
//! ```text
//! w3c:    traceparent: 00-{trace_id}-{span_id}-{01|00}  (+ tracestate)
//! b3:     X-B3-TraceId, X-B3-SpanId, X-B3-ParentSpanId, X-B3-Sampled
//! jaeger: uber-trace-id: {trace_id}:{span_id}:{parent_span_id|0}:{flags}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

use crate::codec::frame::Metadata;
use crate::codec::{CheckRequest, CheckResponse};
use crate::config::schema::OtelConfig;
use crate::error::TransportError;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";
pub const B3_TRACE_ID: &str = "X-B3-TraceId";
pub const B3_SPAN_ID: &str = "X-B3-SpanId";
pub const B3_PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";
pub const B3_SAMPLED: &str = "X-B3-Sampled";
pub const UBER_TRACE_ID: &str = "uber-trace-id";

/// Header format used to carry trace context on outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropagationFormat {
    #[default]
    W3c,
    B3,
    Jaeger,
}

/// Identity of one span within a trace. Immutable; derive children with
/// [`TraceContext::child`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    sampled: bool,
    trace_state: Option<String>,
}

fn random_hex(bytes: usize) -> String {
    loop {
        let value = match bytes {
            16 => format!("{:032x}", rand::random::<u128>()),
            _ => format!("{:016x}", rand::random::<u64>()),
        };
        // all-zero ids are invalid in every supported format
        if value.bytes().any(|b| b != b'0') {
            return value;
        }
    }
}

fn is_hex_id(value: &str, len: usize) -> bool {
    value.len() == len
        && value.bytes().all(|b| b.is_ascii_hexdigit())
        && value.bytes().any(|b| b != b'0')
}

/// Left-pad a shorter hex id (jaeger and b3 allow 64-bit trace ids).
fn normalize_id(value: &str, len: usize) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() || value.len() > len {
        return None;
    }
    let padded = format!("{value:0>len$}");
    is_hex_id(&padded, len).then_some(padded)
}

fn header<'a>(headers: &'a Metadata, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

impl TraceContext {
    /// Fresh root context with random ids.
    pub fn new_root(sampled: bool) -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            parent_span_id: None,
            sampled,
            trace_state: None,
        }
    }

    /// Build from known ids. Returns `None` if they are malformed.
    pub fn from_parts(trace_id: &str, span_id: &str, sampled: bool) -> Option<Self> {
        Some(Self {
            trace_id: normalize_id(trace_id, 32)?,
            span_id: normalize_id(span_id, 16)?,
            parent_span_id: None,
            sampled,
            trace_state: None,
        })
    }

    pub fn with_trace_state(mut self, trace_state: impl Into<String>) -> Self {
        self.trace_state = Some(trace_state.into());
        self
    }

    /// Same trace, new span id, parented on this span.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
            trace_state: self.trace_state.clone(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn trace_state(&self) -> Option<&str> {
        self.trace_state.as_deref()
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{}",
            self.trace_id,
            self.span_id,
            if self.sampled { "01" } else { "00" }
        )
    }

    /// Write this context into `headers` in the given format.
    pub fn inject(&self, format: PropagationFormat, headers: &mut Metadata) {
        match format {
            PropagationFormat::W3c => {
                headers.insert(TRACEPARENT.to_string(), self.to_traceparent());
                if let Some(state) = &self.trace_state {
                    headers.insert(TRACESTATE.to_string(), state.clone());
                }
            }
            PropagationFormat::B3 => {
                headers.insert(B3_TRACE_ID.to_string(), self.trace_id.clone());
                headers.insert(B3_SPAN_ID.to_string(), self.span_id.clone());
                if let Some(parent) = &self.parent_span_id {
                    headers.insert(B3_PARENT_SPAN_ID.to_string(), parent.clone());
                }
                headers.insert(
                    B3_SAMPLED.to_string(),
                    if self.sampled { "1" } else { "0" }.to_string(),
                );
            }
            PropagationFormat::Jaeger => {
                let value = format!(
                    "{}:{}:{}:{}",
                    self.trace_id,
                    self.span_id,
                    self.parent_span_id.as_deref().unwrap_or("0"),
                    u8::from(self.sampled)
                );
                headers.insert(UBER_TRACE_ID.to_string(), value);
            }
        }
    }

    /// Read a context from `headers` in the given format. Header names
    /// match case-insensitively.
    pub fn extract(format: PropagationFormat, headers: &Metadata) -> Option<Self> {
        match format {
            PropagationFormat::W3c => {
                let mut ctx = Self::parse_traceparent(header(headers, TRACEPARENT)?)?;
                ctx.trace_state = header(headers, TRACESTATE)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                Some(ctx)
            }
            PropagationFormat::B3 => {
                let trace_id = normalize_id(header(headers, B3_TRACE_ID)?, 32)?;
                let span_id = normalize_id(header(headers, B3_SPAN_ID)?, 16)?;
                let parent_span_id = header(headers, B3_PARENT_SPAN_ID).and_then(|p| normalize_id(p, 16));
                let sampled = matches!(header(headers, B3_SAMPLED), Some("1") | Some("true") | Some("d"));
                Some(Self {
                    trace_id,
                    span_id,
                    parent_span_id,
                    sampled,
                    trace_state: None,
                })
            }
            PropagationFormat::Jaeger => {
                let value = header(headers, UBER_TRACE_ID)?;
                let mut parts = value.split(':');
                let trace_id = normalize_id(parts.next()?, 32)?;
                let span_id = normalize_id(parts.next()?, 16)?;
                let parent = parts.next()?;
                let flags = u8::from_str_radix(parts.next()?.trim(), 16).ok()?;
                if parts.next().is_some() {
                    return None;
                }
                Some(Self {
                    trace_id,
                    span_id,
                    parent_span_id: normalize_id(parent, 16),
                    sampled: flags & 0x01 == 0x01,
                    trace_state: None,
                })
            }
        }
    }

    /// Try every format, W3C first.
    pub fn extract_any(headers: &Metadata) -> Option<Self> {
        [PropagationFormat::W3c, PropagationFormat::B3, PropagationFormat::Jaeger]
            .into_iter()
            .find_map(|format| Self::extract(format, headers))
    }

    fn parse_traceparent(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        // version 00 has exactly four segments; future versions may append more
        if parts.len() < 4 || parts[0].len() != 2 || parts[0] == "ff" {
            return None;
        }
        if parts[0] == "00" && parts.len() != 4 {
            return None;
        }
        let trace_id = parts[1].to_ascii_lowercase();
        let span_id = parts[2].to_ascii_lowercase();
        if !is_hex_id(&trace_id, 32) || !is_hex_id(&span_id, 16) {
            return None;
        }
        let flags = u8::from_str_radix(parts[3], 16).ok()?;
        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled: flags & 0x01 == 0x01,
            trace_state: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SpanEvent {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

/// A completed span as handed to exporters.
#[derive(Debug, Clone)]
pub struct FinishedSpan {
    pub name: String,
    pub service: String,
    pub context: TraceContext,
    pub attributes: BTreeMap<String, String>,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
    pub start_time: SystemTime,
    pub duration: Duration,
}

/// Receives sampled spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, span: &FinishedSpan);
}

/// Emits each span as a structured log line.
#[derive(Debug, Default)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    fn export(&self, span: &FinishedSpan) {
        tracing::info!(
            target: "authz_transport::spans",
            span = %span.name,
            service = %span.service,
            trace_id = %span.context.trace_id(),
            span_id = %span.context.span_id(),
            parent_span_id = span.context.parent_span_id().unwrap_or(""),
            duration_us = span.duration.as_micros() as u64,
            status = ?span.status,
            attributes = ?span.attributes,
            "span finished"
        );
    }
}

/// Keeps spans in memory.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, span: &FinishedSpan) {
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(span.clone());
    }
}

/// Span factory configured from `[otel]`.
#[derive(Clone)]
pub struct Tracer {
    enabled: bool,
    sample_rate: f64,
    format: PropagationFormat,
    service_name: String,
    exporter: Arc<dyn SpanExporter>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.enabled)
            .field("sample_rate", &self.sample_rate)
            .field("format", &self.format)
            .finish()
    }
}

impl Tracer {
    pub fn new(config: &OtelConfig, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            enabled: config.tracing_enabled,
            sample_rate: config.sample_rate.clamp(0.0, 1.0),
            format: config.propagation_format,
            service_name: config.service_name.clone(),
            exporter,
        }
    }

    pub fn format(&self) -> PropagationFormat {
        self.format
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn sample(&self) -> bool {
        self.enabled && (self.sample_rate >= 1.0 || rand::random::<f64>() < self.sample_rate)
    }

    /// Start a span. With a parent the trace id is inherited and a sampled
    /// parent keeps the child sampled; an unsampled parent, like a missing
    /// one, is drawn against the sample rate.
    pub fn start_span(&self, name: &str, parent: Option<&TraceContext>) -> CallSpan {
        let context = match parent {
            Some(parent) => {
                let mut child = parent.child();
                child.sampled = parent.is_sampled() || self.sample();
                child
            }
            None => TraceContext::new_root(self.sample()),
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("service.name".to_string(), self.service_name.clone());
        CallSpan {
            name: name.to_string(),
            service: self.service_name.clone(),
            context,
            attributes,
            events: Vec::new(),
            status: SpanStatus::Unset,
            start_time: SystemTime::now(),
            started: Instant::now(),
            export: self.enabled,
            exporter: Arc::clone(&self.exporter),
        }
    }
}

/// An in-progress span for one call.
pub struct CallSpan {
    name: String,
    service: String,
    context: TraceContext,
    attributes: BTreeMap<String, String>,
    events: Vec<SpanEvent>,
    status: SpanStatus,
    start_time: SystemTime,
    started: Instant,
    export: bool,
    exporter: Arc<dyn SpanExporter>,
}

impl fmt::Debug for CallSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSpan")
            .field("name", &self.name)
            .field("context", &self.context)
            .finish()
    }
}

impl CallSpan {
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl ToString) {
        self.attributes.insert(key.into(), value.to_string());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn record_request(&mut self, request: &CheckRequest) {
        self.set_attribute("authz.request_id", &request.request_id);
        self.set_attribute("authz.principal.id", &request.principal.id);
        self.set_attribute("authz.principal.type", &request.principal.kind);
        self.set_attribute("authz.resource.kind", &request.resource.kind);
        self.set_attribute("authz.resource.id", &request.resource.id);
        self.set_attribute("authz.actions", request.actions.join(","));
    }

    pub fn record_batch(&mut self, requests: &[CheckRequest]) {
        self.set_attribute("authz.batch.size", requests.len());
    }

    pub fn record_response(&mut self, response: &CheckResponse) {
        self.set_attribute("authz.effect", response.overall_effect().as_str());
        if let Some(metadata) = &response.metadata {
            self.set_attribute("authz.cache_hit", metadata.cache_hit);
            self.set_attribute("authz.evaluation_duration_us", metadata.evaluation_duration_us);
            self.set_attribute("authz.policies_evaluated", metadata.policies_evaluated);
        }
        self.status = SpanStatus::Ok;
    }

    pub fn record_error(&mut self, error: &TransportError) {
        let mut attributes = BTreeMap::new();
        attributes.insert("error.type".to_string(), error.kind().to_string());
        attributes.insert("error.message".to_string(), error.to_string());
        self.events.push(SpanEvent {
            name: "exception".to_string(),
            attributes,
        });
        self.status = SpanStatus::Error(error.to_string());
    }

    pub fn inject(&self, format: PropagationFormat, headers: &mut Metadata) {
        self.context.inject(format, headers);
    }

    /// Close the span and export it if sampled.
    pub fn finish(self) -> FinishedSpan {
        let finished = FinishedSpan {
            name: self.name,
            service: self.service,
            context: self.context,
            attributes: self.attributes,
            events: self.events,
            status: self.status,
            start_time: self.start_time,
            duration: self.started.elapsed(),
        };
        if self.export && finished.context.is_sampled() {
            self.exporter.export(&finished);
        }
        finished
    }
}
