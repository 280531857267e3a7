//! Interfaces to the surrounding runtime.
//!
//! The batch core never owns request handles and never decides how inputs
//! are gathered or how outputs are split per request. Those jobs belong to
//! the implementations of these traits.

use std::sync::Arc;

use crate::error::BackendError;
use crate::memory::{DeviceId, MemoryLocation, MemoryPlatform, Stream};

/// One in-flight inference request, owned by the host runtime.
pub trait Request: Send + Sync {
    /// Response handle paired positionally with this request.
    type Response: Send;

    /// Shape of the named input as submitted by this request.
    fn input_shape(&self, name: &str) -> Result<Vec<usize>, BackendError>;

    /// Create the response handle for this request.
    fn create_response(&self) -> Result<Self::Response, BackendError>;
}

/// What the input assembler asks the collector for.
///
/// No destination buffer is supplied: the collector should return a view of
/// existing storage when the data already sits in the requested location.
#[derive(Debug, Clone, Copy)]
pub struct InputQuery<'a> {
    pub name: &'a str,
    /// Bytes implied by the combined shape and element type.
    pub byte_size: usize,
    pub location: MemoryLocation,
    pub device_id: DeviceId,
    pub stream: Stream,
}

/// What the collector actually delivered.
///
/// Location and device may differ from the query when the collector could
/// not honor it; the assembler rejects that.
#[derive(Debug, Clone, Copy)]
pub struct CollectedInput {
    pub data: *const u8,
    pub byte_size: usize,
    pub location: MemoryLocation,
    pub device_id: DeviceId,
}

/// Input-collection collaborator.
///
/// Returned memory must stay valid, and must not be written, for as long as
/// the collector itself is alive.
pub trait InputCollector<R: Request> {
    fn collect(&self, requests: &[R], query: &InputQuery<'_>) -> Result<CollectedInput, BackendError>;
}

/// Type-erased view of one combined output tensor.
#[derive(Debug, Clone, Copy)]
pub struct OutputView<'a> {
    pub name: &'a str,
    pub shape: &'a [usize],
    pub dtype: &'static str,
    pub element_size: usize,
    pub data: *const u8,
    pub byte_size: usize,
    pub location: MemoryLocation,
    pub device_id: DeviceId,
    pub stream: Stream,
}

/// Output-scatter collaborator.
pub trait OutputResponder<R: Request> {
    /// Schedule copies of each request's slice of `output` into its response.
    ///
    /// `output` stays valid until the batch has synchronized after
    /// [`finalize`](Self::finalize).
    fn process_tensor(
        &mut self,
        requests: &[R],
        responses: &mut [R::Response],
        output: &OutputView<'_>,
    ) -> Result<(), BackendError>;

    /// Flush all scheduled work. Returns true if any of it is asynchronous
    /// and the batch stream must be synchronized before results are read.
    fn finalize(&mut self, requests: &[R], responses: &mut [R::Response]) -> Result<bool, BackendError>;
}

/// Settings handed to the input collector when a batch is built.
#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    pub use_pinned: bool,
    pub stream: Stream,
}

/// Settings handed to the output responder when a batch is built.
#[derive(Debug, Clone, Copy)]
pub struct ResponderSettings {
    pub use_pinned: bool,
    /// Zero means the model does not batch: outputs go whole to one request.
    pub max_batch_size: usize,
    pub stream: Stream,
}

/// Factory for everything a [`Batch`](super::Batch) needs from the runtime.
pub trait BatchRuntime {
    type Request: Request;
    type Collector: InputCollector<Self::Request>;
    type Responder: OutputResponder<Self::Request>;

    /// Memory manager used for output allocation and stream synchronization.
    fn memory_platform(&self) -> Arc<dyn MemoryPlatform>;

    fn input_collector(&self, settings: &CollectorSettings) -> Result<Self::Collector, BackendError>;

    fn output_responder(&self, settings: &ResponderSettings) -> Result<Self::Responder, BackendError>;
}
