//! Telemetry module.
//!
//! Provides structured logging, batch tracing spans, and metrics recording.
//! Nothing here opens network connections or installs exporters.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    record_allocation, record_batch_failure, record_batch_finalized, record_copy,
    record_stream_sync,
};
pub use spans::{BatchSpan, SpanExt};
