//! Output side of a batch: combined output tensors awaiting scatter.

use std::any::Any;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use super::collaborators::{OutputResponder, OutputView, Request};
use crate::error::BackendError;
use crate::memory::{DeviceId, Element, MemoryLocation, MemoryPlatform, Stream};
use crate::tensor::Tensor;

trait RecordedOutput: Send {
    fn name(&self) -> &str;
    fn view(&self) -> OutputView<'_>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct NamedOutput<T: Element> {
    name: String,
    tensor: Tensor<T>,
}

impl<T: Element> RecordedOutput for NamedOutput<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn view(&self) -> OutputView<'_> {
        OutputView {
            name: &self.name,
            shape: self.tensor.shape(),
            dtype: T::NAME,
            element_size: mem::size_of::<T>(),
            data: self.tensor.data().cast(),
            byte_size: self.tensor.buffer().byte_size(),
            location: self.tensor.location(),
            device_id: self.tensor.device_id(),
            stream: self.tensor.stream(),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Holds one combined output tensor per name until the batch is finalized.
///
/// Every output is freshly allocated for the batch in the location the
/// caller asks for; the responder decides how it is split per request.
pub struct BatchOutputAssembler<R, O> {
    responder: O,
    outputs: Vec<Box<dyn RecordedOutput>>,
    platform: Arc<dyn MemoryPlatform>,
    stream: Stream,
    _requests: PhantomData<fn(&R)>,
}

impl<R, O> BatchOutputAssembler<R, O>
where
    R: Request,
    O: OutputResponder<R>,
{
    pub(crate) fn new(responder: O, platform: Arc<dyn MemoryPlatform>, stream: Stream) -> Self {
        Self {
            responder,
            outputs: Vec::new(),
            platform,
            stream,
            _requests: PhantomData,
        }
    }

    /// Allocate the combined output `name` and record it for scatter.
    ///
    /// Each name may be requested once per batch.
    pub fn get_output<T: Element>(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<&mut Tensor<T>, BackendError> {
        if self.outputs.iter().any(|o| o.name() == name) {
            return Err(BackendError::DuplicateOutput(name.to_string()));
        }
        let tensor: Tensor<T> = Tensor::allocate(&self.platform, shape, location, device_id, self.stream)?;
        tracing::debug!(
            output = name,
            shape = ?tensor.shape(),
            location = %location,
            "allocated batch output"
        );
        self.outputs.push(Box::new(NamedOutput {
            name: name.to_string(),
            tensor,
        }));
        self.outputs
            .last_mut()
            .and_then(|o| o.as_any_mut().downcast_mut::<NamedOutput<T>>())
            .map(|o| &mut o.tensor)
            .ok_or_else(|| BackendError::InternalConsistency(format!("output {} lost after recording", name)))
    }

    /// Previously requested output, if it exists with element type `T`.
    pub fn output_mut<T: Element>(&mut self, name: &str) -> Option<&mut Tensor<T>> {
        self.outputs
            .iter_mut()
            .find(|o| o.name() == name)
            .and_then(|o| o.as_any_mut().downcast_mut::<NamedOutput<T>>())
            .map(|o| &mut o.tensor)
    }

    /// Names of recorded outputs in recording order.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.name())
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Hand every recorded output to the responder and flush it.
    ///
    /// Returns whether asynchronous work was scheduled.
    pub(crate) fn flush(&mut self, requests: &[R], responses: &mut [R::Response]) -> Result<bool, BackendError> {
        for output in &self.outputs {
            self.responder.process_tensor(requests, responses, &output.view())?;
        }
        self.responder.finalize(requests, responses)
    }
}
