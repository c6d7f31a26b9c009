//! Observability for session engines
//!
//! Structured logging with session and request spans, and per-engine metrics
//! collection.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, redact_secrets, LogFormat};
pub use metrics::{MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{lifecycle_span, request_span, session_span};
