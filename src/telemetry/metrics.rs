//! Metrics recording through the `metrics` facade.
//!
//! No exporter is installed by this crate; the host process decides where
//! these values go. Without a recorder every call is a no-op.

use crate::memory::{CopyKind, MemoryLocation};

fn location_label(location: MemoryLocation) -> &'static str {
    match location {
        MemoryLocation::Host => "host",
        MemoryLocation::Device => "device",
    }
}

/// Record one storage allocation.
pub fn record_allocation(location: MemoryLocation, bytes: usize) {
    let label = location_label(location);
    metrics::counter!("gg_batch_allocations_total", "location" => label).increment(1);
    metrics::counter!("gg_batch_allocated_bytes_total", "location" => label)
        .increment(bytes as u64);
}

/// Record one raw copy.
pub fn record_copy(kind: CopyKind, bytes: usize) {
    metrics::counter!("gg_batch_copies_total", "kind" => kind.as_str()).increment(1);
    metrics::counter!("gg_batch_copied_bytes_total", "kind" => kind.as_str())
        .increment(bytes as u64);
}

/// Record one blocking stream synchronization.
pub fn record_stream_sync() {
    metrics::counter!("gg_batch_stream_syncs_total").increment(1);
}

/// Record a finalized batch.
pub fn record_batch_finalized(request_count: usize, synchronized: bool) {
    let label = if synchronized { "true" } else { "false" };
    metrics::counter!("gg_batch_finalized_total", "async" => label).increment(1);
    metrics::histogram!("gg_batch_requests").record(request_count as f64);
}

/// Record a batch whose finalize step failed.
pub fn record_batch_failure() {
    metrics::counter!("gg_batch_failures_total").increment(1);
}
