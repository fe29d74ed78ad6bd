//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every call:
//!     → tracing.rs (span, trace context injected into call metadata)
//!     → metrics.rs (request count, latency, errors, cache hits)
//!
//! All subsystems:
//!     → logging.rs (structured log events)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON)
//!     → Prometheus scrape (exporter or render_prometheus)
//!     → Span exporters (log lines, in-memory)
//! ```
//!
//! # Design Decisions
//! - Trace context is immutable and propagated by value
//! - A sampled parent keeps its children sampled; unsampled or missing
//!   parents are drawn against the sample rate
//! - Metrics are cheap (atomic increments, short critical sections)

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::logging::init_logging;
pub use self::metrics::{init_metrics, MetricsCollector, MetricsSnapshot};
pub use self::tracing::{
    CallSpan, FinishedSpan, InMemoryExporter, LogExporter, PropagationFormat, SpanExporter,
    SpanStatus, TraceContext, Tracer,
};
