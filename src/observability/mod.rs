//! Observability for the telemetry client
//!
//! Structured logging setup and process-wide counters.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{LogFormat, LogSettings, init_default_logging, init_logging};
pub use metrics::{MetricsSnapshot, TelemetryMetrics, metrics};

// Span macros for structured logging
pub use logging::{connection_span, ingest_span};
