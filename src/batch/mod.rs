//! Batch assembly module.
//!
//! A [`Batch`] wraps the requests of one execution pass. It produces
//! combined input tensors, collects combined output tensors, and on
//! [`Batch::finalize`] scatters the outputs back into per-request responses.

mod collaborators;
mod input;
pub mod local;
mod output;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Span;
use uuid::Uuid;

use crate::error::BackendError;
use crate::memory::{DeviceId, Element, MemoryLocation, MemoryPlatform, Stream};
use crate::telemetry::{self, BatchSpan, SpanExt};
use crate::tensor::Tensor;

pub use collaborators::{
    BatchRuntime, CollectedInput, CollectorSettings, InputCollector, InputQuery, OutputResponder,
    OutputView, Request, ResponderSettings,
};
pub use input::{combine_shapes, BatchInputAssembler, InputTensor};
pub use output::BatchOutputAssembler;

/// Per-batch settings supplied by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Stage gathered inputs in pinned host memory.
    pub use_pinned_input: bool,
    /// Stage scattered outputs in pinned host memory.
    pub use_pinned_output: bool,
    /// Largest request count per batch; zero for models that do not batch.
    pub max_batch_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            use_pinned_input: false,
            use_pinned_output: false,
            max_batch_size: 8,
        }
    }
}

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting input and output requests.
    Open,
    /// Outputs flushed; terminal.
    Finalized,
}

type ResponseOf<B> = <<B as BatchRuntime>::Request as Request>::Response;

/// The requests processed together in one execution pass.
pub struct Batch<'r, B: BatchRuntime> {
    id: Uuid,
    requests: &'r [B::Request],
    responses: Vec<ResponseOf<B>>,
    inputs: BatchInputAssembler<'r, B::Request, B::Collector>,
    outputs: BatchOutputAssembler<B::Request, B::Responder>,
    platform: Arc<dyn MemoryPlatform>,
    stream: Stream,
    state: BatchState,
    span: Span,
}

impl<'r, B: BatchRuntime> Batch<'r, B> {
    /// Build a batch over `requests`, creating one response per request.
    pub fn new(
        runtime: &B,
        requests: &'r [B::Request],
        settings: &BatchSettings,
        stream: Stream,
    ) -> Result<Self, BackendError> {
        if requests.is_empty() {
            return Err(BackendError::EmptyBatch);
        }
        let max = settings.max_batch_size.max(1);
        if requests.len() > max {
            return Err(BackendError::BatchTooLarge {
                count: requests.len(),
                max,
            });
        }

        let responses = requests
            .iter()
            .map(|request| request.create_response())
            .collect::<Result<Vec<_>, _>>()?;

        let platform = runtime.memory_platform();
        let collector = runtime.input_collector(&CollectorSettings {
            use_pinned: settings.use_pinned_input,
            stream,
        })?;
        let responder = runtime.output_responder(&ResponderSettings {
            use_pinned: settings.use_pinned_output,
            max_batch_size: settings.max_batch_size,
            stream,
        })?;

        let id = Uuid::new_v4();
        let span = BatchSpan::new(&id.to_string(), requests.len(), stream.as_raw());
        tracing::debug!(parent: &span, platform = platform.name(), "batch opened");

        Ok(Self {
            id,
            requests,
            responses,
            inputs: BatchInputAssembler::new(requests, collector, Arc::clone(&platform), stream),
            outputs: BatchOutputAssembler::new(responder, Arc::clone(&platform), stream),
            platform,
            stream,
            state: BatchState::Open,
            span,
        })
    }

    /// Combined input tensor for `name` in `location`.
    pub fn get_input<T: Element>(
        &self,
        name: &str,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<InputTensor<'_, T>, BackendError> {
        self.inputs()?.get_input(name, location, device_id)
    }

    /// Allocate and record the combined output `name`.
    pub fn get_output<T: Element>(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<&mut Tensor<T>, BackendError> {
        let (_, outputs) = self.split_mut()?;
        outputs.get_output(name, shape, location, device_id)
    }

    pub fn inputs(&self) -> Result<&BatchInputAssembler<'r, B::Request, B::Collector>, BackendError> {
        self.ensure_open()?;
        Ok(&self.inputs)
    }

    /// Borrow both assemblers at once, so input tensors can stay alive while
    /// outputs are requested and written.
    #[allow(clippy::type_complexity)]
    pub fn split_mut(
        &mut self,
    ) -> Result<
        (
            &BatchInputAssembler<'r, B::Request, B::Collector>,
            &mut BatchOutputAssembler<B::Request, B::Responder>,
        ),
        BackendError,
    > {
        self.ensure_open()?;
        Ok((&self.inputs, &mut self.outputs))
    }

    /// Scatter all recorded outputs into the responses.
    ///
    /// May be called once. If the responder scheduled asynchronous copies,
    /// the batch stream is synchronized before returning, so response data
    /// is readable as soon as this returns. A failed scatter also waits for
    /// the batch stream before reporting the error.
    pub fn finalize(&mut self) -> Result<(), BackendError> {
        if self.state == BatchState::Finalized {
            return Err(BackendError::DoubleFinalize);
        }
        self.state = BatchState::Finalized;

        let span = self.span.clone();
        let _enter = span.enter();
        let result = self.flush();
        span.record_result(&result);
        match &result {
            Ok(synchronized) => {
                span.record("synchronized", *synchronized);
                telemetry::record_batch_finalized(self.requests.len(), *synchronized);
                tracing::info!(
                    outputs = self.outputs.len(),
                    synchronized = *synchronized,
                    "batch finalized"
                );
            }
            Err(e) => {
                telemetry::record_batch_failure();
                tracing::warn!(error = %e, "batch finalize failed");
            }
        }
        result.map(|_| ())
    }

    fn flush(&mut self) -> Result<bool, BackendError> {
        let scheduled = match self.outputs.flush(self.requests, &mut self.responses) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                // Copies queued for earlier outputs still read from the
                // batch's output tensors; drain them before those are freed.
                if let Err(sync) = self.platform.synchronize(self.stream) {
                    tracing::warn!(error = %sync, "stream sync after failed flush");
                }
                return Err(e);
            }
        };
        if scheduled {
            self.platform.synchronize(self.stream)?;
        }
        Ok(scheduled)
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        match self.state {
            BatchState::Open => Ok(()),
            BatchState::Finalized => Err(BackendError::BatchFinalized),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn requests(&self) -> &'r [B::Request] {
        self.requests
    }

    /// Responses in request order.
    pub fn responses(&self) -> &[ResponseOf<B>] {
        &self.responses
    }

    /// Hand the responses back to the runtime.
    pub fn into_responses(self) -> Vec<ResponseOf<B>> {
        self.responses
    }
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
