//! Input side of a batch: combined shapes and zero-copy input tensors.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use super::collaborators::{InputCollector, InputQuery, Request};
use crate::error::BackendError;
use crate::memory::{Buffer, DeviceId, Element, MemoryLocation, MemoryPlatform, Stream};
use crate::tensor::{shape_product, Tensor};

/// Concatenate per-request shapes along the leading dimension.
///
/// Trailing dimensions must agree across requests; scalar shapes cannot be
/// concatenated.
pub fn combine_shapes<I>(name: &str, shapes: I) -> Result<Vec<usize>, BackendError>
where
    I: IntoIterator<Item = Vec<usize>>,
{
    let mut combined: Option<Vec<usize>> = None;
    for (index, shape) in shapes.into_iter().enumerate() {
        if shape.is_empty() {
            return Err(BackendError::ShapeMismatch(format!(
                "input {} of request {} is a scalar and cannot be batched",
                name, index
            )));
        }
        match combined.as_mut() {
            None => combined = Some(shape),
            Some(acc) => {
                if acc[1..] != shape[1..] {
                    return Err(BackendError::ShapeMismatch(format!(
                        "input {} of request {} has shape {:?}, incompatible with {:?}",
                        name, index, shape, acc
                    )));
                }
                acc[0] = acc[0].checked_add(shape[0]).ok_or_else(|| {
                    BackendError::ShapeMismatch(format!("input {} overflows the batch dimension", name))
                })?;
            }
        }
    }
    combined.ok_or(BackendError::EmptyBatch)
}

/// A tensor over memory owned by the batch's input collector.
///
/// Borrows the assembler, so it cannot outlive the batch that keeps the
/// backing memory alive.
pub struct InputTensor<'a, T: Element> {
    tensor: Tensor<T>,
    _collector: PhantomData<&'a ()>,
}

impl<'a, T: Element> InputTensor<'a, T> {
    pub fn tensor(&self) -> &Tensor<T> {
        &self.tensor
    }
}

impl<'a, T: Element> fmt::Debug for InputTensor<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InputTensor").field(&self.tensor).finish()
    }
}

impl<'a, T: Element> Deref for InputTensor<'a, T> {
    type Target = Tensor<T>;

    fn deref(&self) -> &Tensor<T> {
        &self.tensor
    }
}

/// Produces per-name input tensors for one batch.
pub struct BatchInputAssembler<'r, R, C> {
    requests: &'r [R],
    collector: C,
    platform: Arc<dyn MemoryPlatform>,
    stream: Stream,
}

impl<'r, R, C> BatchInputAssembler<'r, R, C>
where
    R: Request,
    C: InputCollector<R>,
{
    pub(crate) fn new(
        requests: &'r [R],
        collector: C,
        platform: Arc<dyn MemoryPlatform>,
        stream: Stream,
    ) -> Self {
        Self {
            requests,
            collector,
            platform,
            stream,
        }
    }

    /// Combined shape of `name` across every request in the batch.
    pub fn combined_shape(&self, name: &str) -> Result<Vec<usize>, BackendError> {
        let shapes = self
            .requests
            .iter()
            .map(|request| request.input_shape(name))
            .collect::<Result<Vec<_>, _>>()?;
        combine_shapes(name, shapes)
    }

    /// Obtain the named input as one contiguous tensor in `location`.
    ///
    /// Fails with [`BackendError::InternalConsistency`] if the collector
    /// delivers the data anywhere other than the requested location/device.
    ///
    /// A gathered tensor may still be filling on the batch stream. Kernels
    /// queued on that stream see complete data; host reads must synchronize
    /// `tensor.stream()` first.
    pub fn get_input<T: Element>(
        &self,
        name: &str,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<InputTensor<'_, T>, BackendError> {
        let shape = self.combined_shape(name)?;
        let elements = shape_product(&shape)
            .ok_or_else(|| BackendError::ShapeMismatch(format!("input {} overflows element count", name)))?;
        let byte_size = elements
            .checked_mul(mem::size_of::<T>())
            .ok_or_else(|| BackendError::ShapeMismatch(format!("input {} overflows byte size", name)))?;

        let collected = self.collector.collect(
            self.requests,
            &InputQuery {
                name,
                byte_size,
                location,
                device_id,
                stream: self.stream,
            },
        )?;

        let wrong_device = location.is_device() && collected.device_id != device_id;
        if collected.location != location || wrong_device {
            return Err(BackendError::InternalConsistency(format!(
                "input {} collected in {} memory on device {}, requested {} memory on device {}",
                name, collected.location, collected.device_id, location, device_id
            )));
        }

        let size = collected.byte_size / mem::size_of::<T>();
        let ptr = if collected.byte_size == 0 {
            NonNull::<T>::dangling()
        } else {
            let ptr = NonNull::new(collected.data as *mut T).ok_or_else(|| {
                BackendError::InternalConsistency(format!("input {} collected as a null pointer", name))
            })?;
            if ptr.as_ptr() as usize % mem::align_of::<T>() != 0 {
                return Err(BackendError::InternalConsistency(format!(
                    "input {} collected at an address misaligned for {}",
                    name,
                    T::NAME
                )));
            }
            ptr
        };
        if collected.byte_size % mem::size_of::<T>() != 0 {
            return Err(BackendError::ShapeMismatch(format!(
                "input {} collected {} bytes, not a whole number of {} elements",
                name,
                collected.byte_size,
                T::NAME
            )));
        }

        tracing::debug!(
            input = name,
            shape = ?shape,
            bytes = collected.byte_size,
            location = %location,
            "collected batch input"
        );

        // SAFETY: the collector keeps this memory valid while it is alive, and
        // the returned tensor borrows `self`, which owns the collector.
        let buffer = unsafe {
            Buffer::wrap(&self.platform, ptr, size, collected.location, collected.device_id, self.stream)
        };
        Ok(InputTensor {
            tensor: Tensor::new(shape, buffer)?,
            _collector: PhantomData,
        })
    }

    pub fn requests(&self) -> &'r [R] {
        self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_sums_leading_dimension() {
        let shape = combine_shapes("x", vec![vec![2, 5], vec![3, 5], vec![1, 5]]).unwrap();
        assert_eq!(shape, vec![6, 5]);
    }

    #[test]
    fn combine_single_request_is_identity() {
        let shape = combine_shapes("x", vec![vec![4, 2, 3]]).unwrap();
        assert_eq!(shape, vec![4, 2, 3]);
    }

    #[test]
    fn combine_rejects_trailing_mismatch() {
        let result = combine_shapes("x", vec![vec![2, 5], vec![3, 4]]);
        assert!(matches!(result, Err(BackendError::ShapeMismatch(_))));
    }

    #[test]
    fn combine_rejects_rank_mismatch() {
        let result = combine_shapes("x", vec![vec![2, 5], vec![3, 5, 1]]);
        assert!(matches!(result, Err(BackendError::ShapeMismatch(_))));
    }

    #[test]
    fn combine_rejects_scalars() {
        let result = combine_shapes("x", vec![vec![]]);
        assert!(matches!(result, Err(BackendError::ShapeMismatch(_))));
    }

    #[test]
    fn combine_rejects_leading_overflow() {
        let result = combine_shapes("x", vec![vec![usize::MAX, 2], vec![1, 2]]);
        assert!(matches!(result, Err(BackendError::ShapeMismatch(_))));
    }

    #[test]
    fn combine_of_nothing_is_empty_batch() {
        let result = combine_shapes("x", Vec::<Vec<usize>>::new());
        assert!(matches!(result, Err(BackendError::EmptyBatch)));
    }
}
