//! Tensors: a buffer paired with a shape.

use std::fmt;
use std::sync::Arc;

use crate::error::BackendError;
use crate::memory::{Buffer, DeviceId, Element, MemoryLocation, MemoryPlatform, Stream};

/// Product of all dimensions; 1 for a rank-0 shape. `None` on overflow.
pub fn shape_product(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// A shaped view over one [`Buffer`]. The memory location is the buffer's.
pub struct Tensor<T: Element> {
    shape: Vec<usize>,
    buffer: Buffer<T>,
}

impl<T: Element> Tensor<T> {
    /// Fails with [`BackendError::ShapeMismatch`] if the shape's element
    /// count differs from the buffer size.
    pub fn new(shape: Vec<usize>, buffer: Buffer<T>) -> Result<Self, BackendError> {
        match shape_product(&shape) {
            Some(count) if count == buffer.size() => Ok(Self { shape, buffer }),
            Some(count) => Err(BackendError::ShapeMismatch(format!(
                "shape {:?} holds {} elements but buffer holds {}",
                shape,
                count,
                buffer.size()
            ))),
            None => Err(BackendError::ShapeMismatch(format!(
                "shape {:?} overflows element count",
                shape
            ))),
        }
    }

    /// Allocate an owned, zero-initialized (on host) tensor for `shape`.
    pub fn allocate(
        platform: &Arc<dyn MemoryPlatform>,
        shape: Vec<usize>,
        location: MemoryLocation,
        device_id: DeviceId,
        stream: Stream,
    ) -> Result<Self, BackendError> {
        let count = shape_product(&shape).ok_or_else(|| {
            BackendError::ShapeMismatch(format!("shape {:?} overflows element count", shape))
        })?;
        let buffer = Buffer::allocate(platform, count, location, device_id, stream)?;
        Self::new(shape, buffer)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> *const T {
        self.buffer.data()
    }

    pub fn data_mut(&mut self) -> *mut T {
        self.buffer.data_mut()
    }

    /// Element count; equal to the product of the shape.
    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    pub fn location(&self) -> MemoryLocation {
        self.buffer.location()
    }

    pub fn device_id(&self) -> DeviceId {
        self.buffer.device_id()
    }

    pub fn stream(&self) -> Stream {
        self.buffer.stream()
    }

    pub fn buffer(&self) -> &Buffer<T> {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer<T> {
        &mut self.buffer
    }

    pub fn into_buffer(self) -> Buffer<T> {
        self.buffer
    }
}

impl<T: Element> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("buffer", &self.buffer)
            .finish()
    }
}
