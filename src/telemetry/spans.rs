//! Span utilities and extension traits for batch tracing.
//!
//! Provides standardized span creation and result recording.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for creating standardized batch spans.
pub struct BatchSpan;

impl BatchSpan {
    /// Create a new batch span with standard fields.
    ///
    /// Fields included:
    /// - `batch_id`: Unique identifier for the batch
    /// - `request_count`: Number of requests coalesced into the batch
    /// - `stream`: Execution stream the batch runs on
    /// - `status`: To be filled in by `SpanExt::record_result`
    /// - `error.message`: To be filled in on error
    /// - `synchronized`: Whether finalize had to wait on the stream
    pub fn new(batch_id: &str, request_count: usize, stream: u64) -> Span {
        info_span!(
            "batch",
            batch_id = %batch_id,
            request_count = request_count,
            stream = stream,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            synchronized = tracing::field::Empty,
        )
    }
}
