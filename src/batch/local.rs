//! In-process runtime: requests, responses and collaborators held in memory.
//!
//! Used for embedding the batch core without a host server and as the
//! reference behavior in tests. Inputs are gathered along the leading
//! dimension in request order; outputs are split back by each request's
//! leading input dimension.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::collaborators::{
    BatchRuntime, CollectedInput, CollectorSettings, InputCollector, InputQuery, OutputResponder,
    OutputView, Request, ResponderSettings,
};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::memory::{
    as_bytes, copy, copy_at, from_bytes, Buffer, CopyKind, DeviceId, Element, MemoryLocation,
    MemoryPlatform, Stream,
};
use crate::tensor::shape_product;

struct LocalInput {
    shape: Vec<usize>,
    data: Buffer<u8>,
}

/// A request whose inputs live in buffers owned by the request.
pub struct LocalRequest {
    id: u64,
    inputs: Vec<(String, LocalInput)>,
    outputs: Vec<(String, MemoryLocation, DeviceId)>,
}

impl LocalRequest {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Attach input `name`, copied from `data` into `location`.
    pub fn with_input<T: Element>(
        mut self,
        platform: &Arc<dyn MemoryPlatform>,
        name: &str,
        shape: Vec<usize>,
        data: &[T],
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<Self, BackendError> {
        if shape_product(&shape) != Some(data.len()) {
            return Err(BackendError::ShapeMismatch(format!(
                "input {} has shape {:?} but {} elements",
                name,
                shape,
                data.len()
            )));
        }
        let buffer = Buffer::from_host_slice(platform, as_bytes(data), location, device_id, Stream::DEFAULT)?;
        // Inputs must be in place before any batch stream reads them.
        platform.synchronize(buffer.stream())?;
        self.inputs.push((name.to_string(), LocalInput { shape, data: buffer }));
        Ok(self)
    }

    /// Ask for output `name` in `location`.
    ///
    /// A request that names no outputs receives every output in host memory.
    pub fn with_output(mut self, name: &str, location: MemoryLocation, device_id: DeviceId) -> Self {
        self.outputs.push((name.to_string(), location, device_id));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Leading dimension of the first input; 1 for requests without inputs.
    pub fn batch_size(&self) -> usize {
        self.inputs
            .first()
            .and_then(|(_, input)| input.shape.first().copied())
            .unwrap_or(1)
    }

    pub fn requested_output(&self, name: &str) -> Option<(MemoryLocation, DeviceId)> {
        if self.outputs.is_empty() {
            return Some((MemoryLocation::Host, 0));
        }
        self.outputs
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, location, device_id)| (*location, *device_id))
    }

    fn input(&self, name: &str) -> Result<&LocalInput, BackendError> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, input)| input)
            .ok_or_else(|| BackendError::MissingInput(format!("{} (request {})", name, self.id)))
    }
}

impl Request for LocalRequest {
    type Response = LocalResponse;

    fn input_shape(&self, name: &str) -> Result<Vec<usize>, BackendError> {
        Ok(self.input(name)?.shape.clone())
    }

    fn create_response(&self) -> Result<LocalResponse, BackendError> {
        Ok(LocalResponse {
            request_id: self.id,
            outputs: Vec::new(),
        })
    }
}

/// One request's slice of a combined output.
pub struct LocalOutput {
    shape: Vec<usize>,
    dtype: &'static str,
    data: Buffer<u8>,
}

impl LocalOutput {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> &'static str {
        self.dtype
    }

    pub fn location(&self) -> MemoryLocation {
        self.data.location()
    }

    pub fn device_id(&self) -> DeviceId {
        self.data.device_id()
    }

    /// Read the output back into host memory as elements of `T`.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, BackendError> {
        if T::NAME != self.dtype {
            return Err(BackendError::InternalConsistency(format!(
                "output holds {} elements, read as {}",
                self.dtype,
                T::NAME
            )));
        }
        Ok(from_bytes(&self.data.to_vec()?))
    }
}

/// Response accumulated for one [`LocalRequest`].
pub struct LocalResponse {
    request_id: u64,
    outputs: Vec<(String, LocalOutput)>,
}

impl LocalResponse {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn output(&self, name: &str) -> Option<&LocalOutput> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(n, _)| n.as_str())
    }
}

/// Gathers one named input across requests.
///
/// Single-request inputs already in the requested location are returned
/// without copying. Everything else is gathered on the batch stream into
/// staging buffers owned by the collector until the batch is dropped. Device
/// requests on a platform without device memory are served from host memory.
pub struct LocalCollector {
    platform: Arc<dyn MemoryPlatform>,
    settings: CollectorSettings,
    staging: Mutex<Vec<Buffer<u8>>>,
}

impl LocalCollector {
    pub fn new(platform: Arc<dyn MemoryPlatform>, settings: CollectorSettings) -> Self {
        Self {
            platform,
            settings,
            staging: Mutex::new(Vec::new()),
        }
    }

    /// Number of gather copies made so far.
    pub fn staged_inputs(&self) -> usize {
        self.staging.lock().len()
    }
}

impl Drop for LocalCollector {
    fn drop(&mut self) {
        if self.staging.get_mut().is_empty() {
            return;
        }
        // Gather copies may still be writing into the staging buffers.
        if let Err(e) = self.platform.synchronize(self.settings.stream) {
            tracing::warn!(error = %e, "failed to drain gather copies");
        }
    }
}

impl InputCollector<LocalRequest> for LocalCollector {
    fn collect(
        &self,
        requests: &[LocalRequest],
        query: &InputQuery<'_>,
    ) -> Result<CollectedInput, BackendError> {
        let parts = requests
            .iter()
            .map(|request| request.input(query.name))
            .collect::<Result<Vec<_>, _>>()?;

        let (location, device_id) =
            if query.location.is_device() && !self.platform.capabilities().device_memory {
                tracing::debug!(input = query.name, "no device memory, collecting on host");
                (MemoryLocation::Host, 0)
            } else {
                (query.location, query.device_id)
            };

        if let [single] = parts.as_slice() {
            let here = single.data.location() == location
                && (location.is_host() || single.data.device_id() == device_id);
            if here {
                tracing::debug!(input = query.name, "zero-copy input");
                return Ok(CollectedInput {
                    data: single.data.data(),
                    byte_size: single.data.byte_size(),
                    location,
                    device_id,
                });
            }
        }

        let total: usize = parts.iter().map(|part| part.data.byte_size()).sum();
        let mut staging = Buffer::<u8>::allocate(&self.platform, total, location, device_id, query.stream)?;
        let mut offset = 0;
        for part in &parts {
            let ptr = NonNull::new(part.data.data() as *mut u8).ok_or_else(|| {
                BackendError::InternalConsistency(format!("input {} has a null data pointer", query.name))
            })?;
            // Read the part through a view on the batch stream so every
            // gather copy is queued there without rebinding the staging buffer.
            // SAFETY: the requests outlive the batch, and the collector
            // synchronizes the batch stream before its staging is released.
            let view = unsafe {
                Buffer::wrap(
                    &self.platform,
                    ptr,
                    part.data.size(),
                    part.data.location(),
                    part.data.device_id(),
                    query.stream,
                )
            };
            copy_at(&mut staging, &view, offset)?;
            offset += part.data.size();
        }
        tracing::debug!(
            input = query.name,
            parts = parts.len(),
            bytes = total,
            pinned = self.settings.use_pinned,
            "gathered input"
        );

        let data = staging.data();
        self.staging.lock().push(staging);
        Ok(CollectedInput {
            data,
            byte_size: total,
            location,
            device_id,
        })
    }
}

/// Splits combined outputs into per-request response buffers.
pub struct LocalResponder {
    platform: Arc<dyn MemoryPlatform>,
    settings: ResponderSettings,
    scheduled_async: bool,
}

impl LocalResponder {
    pub fn new(platform: Arc<dyn MemoryPlatform>, settings: ResponderSettings) -> Self {
        Self {
            platform,
            settings,
            scheduled_async: false,
        }
    }

    /// Byte range and shape of each request's slice of `output`.
    fn slices(
        &self,
        requests: &[LocalRequest],
        output: &OutputView<'_>,
    ) -> Result<Vec<(usize, usize, Vec<usize>)>, BackendError> {
        if self.settings.max_batch_size == 0 {
            return Ok(vec![(0, output.byte_size, output.shape.to_vec())]);
        }
        let (&leading, trailing) = output.shape.split_first().ok_or_else(|| {
            BackendError::ShapeMismatch(format!("output {} is a scalar and cannot be split", output.name))
        })?;
        let total_rows: usize = requests.iter().map(LocalRequest::batch_size).sum();
        if total_rows != leading {
            return Err(BackendError::ShapeMismatch(format!(
                "output {} has {} rows but the batch holds {}",
                output.name, leading, total_rows
            )));
        }
        let row_bytes = shape_product(trailing).unwrap_or(0) * output.element_size;

        let mut start = 0;
        Ok(requests
            .iter()
            .map(|request| {
                let rows = request.batch_size();
                let mut shape = output.shape.to_vec();
                shape[0] = rows;
                let slice = (start, rows * row_bytes, shape);
                start += rows * row_bytes;
                slice
            })
            .collect())
    }
}

impl OutputResponder<LocalRequest> for LocalResponder {
    fn process_tensor(
        &mut self,
        requests: &[LocalRequest],
        responses: &mut [LocalResponse],
        output: &OutputView<'_>,
    ) -> Result<(), BackendError> {
        let ptr = NonNull::new(output.data as *mut u8).ok_or_else(|| {
            BackendError::InternalConsistency(format!("output {} has a null data pointer", output.name))
        })?;
        // SAFETY: the output assembler keeps the tensor alive until the batch
        // has synchronized after finalize.
        let src = unsafe {
            Buffer::wrap(&self.platform, ptr, output.byte_size, output.location, output.device_id, output.stream)
        };

        let slices = self.slices(requests, output)?;
        for ((request, response), (start, len, shape)) in requests.iter().zip(responses.iter_mut()).zip(slices) {
            let Some((location, device_id)) = request.requested_output(output.name) else {
                continue;
            };
            let mut dst = Buffer::<u8>::allocate(&self.platform, len, location, device_id, output.stream)?;
            copy(&mut dst, &src, 0, start, start + len)?;
            if len > 0 && self.platform.copy_is_async(CopyKind::between(location, output.location)) {
                self.scheduled_async = true;
            }
            response.outputs.push((
                output.name.to_string(),
                LocalOutput {
                    shape,
                    dtype: output.dtype,
                    data: dst,
                },
            ));
        }
        tracing::trace!(
            output = output.name,
            requests = requests.len(),
            pinned = self.settings.use_pinned,
            "scattered output"
        );
        Ok(())
    }

    fn finalize(&mut self, _requests: &[LocalRequest], _responses: &mut [LocalResponse]) -> Result<bool, BackendError> {
        Ok(std::mem::take(&mut self.scheduled_async))
    }
}

/// [`BatchRuntime`] backed by [`LocalRequest`]s.
#[derive(Clone)]
pub struct LocalRuntime {
    platform: Arc<dyn MemoryPlatform>,
    device_id: DeviceId,
}

impl LocalRuntime {
    pub fn new(platform: Arc<dyn MemoryPlatform>) -> Self {
        Self { platform, device_id: 0 }
    }

    /// Runtime over the platform `config` describes, placing device tensors
    /// on `config.device_id`.
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        Ok(Self::new(config.build_platform()?).with_device(config.device_id))
    }

    pub fn with_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn platform(&self) -> &Arc<dyn MemoryPlatform> {
        &self.platform
    }

    /// Device that model inputs and outputs should be placed on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }
}

impl BatchRuntime for LocalRuntime {
    type Request = LocalRequest;
    type Collector = LocalCollector;
    type Responder = LocalResponder;

    fn memory_platform(&self) -> Arc<dyn MemoryPlatform> {
        Arc::clone(&self.platform)
    }

    fn input_collector(&self, settings: &CollectorSettings) -> Result<LocalCollector, BackendError> {
        Ok(LocalCollector::new(Arc::clone(&self.platform), *settings))
    }

    fn output_responder(&self, settings: &ResponderSettings) -> Result<LocalResponder, BackendError> {
        Ok(LocalResponder::new(Arc::clone(&self.platform), *settings))
    }
}
