// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Typed memory buffers over host or device storage.
//!
//! A [`Buffer`] either owns its storage (released through the platform when
//! the buffer is dropped) or borrows storage supplied by the caller. The
//! ownership tag also determines the memory location; there is no separate
//! location field that could disagree with it.

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use super::element::Element;
use super::location::{CopyKind, DeviceId, MemoryLocation};
use super::platform::MemoryPlatform;
use super::stream::Stream;
use crate::error::BackendError;

/// Owned storage obtained from a platform. Released exactly once, on drop.
pub(crate) struct Allocation {
    ptr: NonNull<u8>,
    layout: Layout,
    location: MemoryLocation,
    device_id: DeviceId,
    platform: Arc<dyn MemoryPlatform>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if self.layout.size() == 0 {
            return;
        }
        // SAFETY: ptr/layout/location/device are exactly what allocate returned.
        let result = unsafe {
            self.platform
                .deallocate(self.ptr, self.layout, self.location, self.device_id)
        };
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                bytes = self.layout.size(),
                location = %self.location,
                "failed to release buffer storage"
            );
        }
    }
}

// SAFETY: an allocation is an address plus the platform that owns it; the
// platform is Send + Sync.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Ownership-tagged storage pointer.
///
/// Variant order matters: even variants are host, odd variants are device.
enum Storage<T> {
    BorrowedHost(NonNull<T>),
    BorrowedDevice(NonNull<T>),
    OwnedHost(Allocation),
    OwnedDevice(Allocation),
}

impl<T> Storage<T> {
    fn index(&self) -> usize {
        match self {
            Storage::BorrowedHost(_) => 0,
            Storage::BorrowedDevice(_) => 1,
            Storage::OwnedHost(_) => 2,
            Storage::OwnedDevice(_) => 3,
        }
    }

    fn location(&self) -> MemoryLocation {
        if self.index() % 2 == 0 {
            MemoryLocation::Host
        } else {
            MemoryLocation::Device
        }
    }

    fn raw(&self) -> *mut T {
        match self {
            Storage::BorrowedHost(ptr) | Storage::BorrowedDevice(ptr) => ptr.as_ptr(),
            Storage::OwnedHost(alloc) | Storage::OwnedDevice(alloc) => alloc.ptr.as_ptr().cast(),
        }
    }

    fn borrowed(ptr: NonNull<T>, location: MemoryLocation) -> Self {
        match location {
            MemoryLocation::Host => Storage::BorrowedHost(ptr),
            MemoryLocation::Device => Storage::BorrowedDevice(ptr),
        }
    }

    fn owned(alloc: Allocation) -> Self {
        match alloc.location {
            MemoryLocation::Host => Storage::OwnedHost(alloc),
            MemoryLocation::Device => Storage::OwnedDevice(alloc),
        }
    }
}

/// A contiguous region of `size` elements of `T` in host or device memory.
pub struct Buffer<T: Element> {
    storage: Storage<T>,
    size: usize,
    device_id: DeviceId,
    stream: Stream,
    platform: Arc<dyn MemoryPlatform>,
    _marker: PhantomData<T>,
}

impl<T: Element> Buffer<T> {
    /// Allocate an owning buffer of `size` elements.
    ///
    /// Host storage is zero-initialized. Fails with
    /// [`BackendError::Allocation`] if the platform cannot provide the
    /// storage, including device memory on a platform without device support.
    pub fn allocate(
        platform: &Arc<dyn MemoryPlatform>,
        size: usize,
        location: MemoryLocation,
        device_id: DeviceId,
        stream: Stream,
    ) -> Result<Self, BackendError> {
        let alloc = allocate_storage::<T>(platform, size, location, device_id)?;
        tracing::trace!(
            elements = size,
            dtype = T::NAME,
            location = %location,
            device_id,
            "allocated buffer"
        );
        Ok(Self {
            storage: Storage::owned(alloc),
            size,
            device_id,
            stream,
            platform: Arc::clone(platform),
            _marker: PhantomData,
        })
    }

    /// Wrap caller-owned storage without allocating.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` elements in `location` (on `device_id`
    /// for device memory), properly aligned, and must stay valid and not be
    /// released for as long as the returned buffer or anything copied from
    /// it asynchronously is in use. The buffer never frees `ptr`.
    pub unsafe fn wrap(
        platform: &Arc<dyn MemoryPlatform>,
        ptr: NonNull<T>,
        size: usize,
        location: MemoryLocation,
        device_id: DeviceId,
        stream: Stream,
    ) -> Self {
        Self {
            storage: Storage::borrowed(ptr, location),
            size,
            device_id,
            stream,
            platform: Arc::clone(platform),
            _marker: PhantomData,
        }
    }

    /// Allocate a buffer in `location` holding a copy of `data`.
    ///
    /// The slice is staged into owned host storage first, so the caller may
    /// release it as soon as this returns even if the device copy is still
    /// pending on `stream`.
    pub fn from_host_slice(
        platform: &Arc<dyn MemoryPlatform>,
        data: &[T],
        location: MemoryLocation,
        device_id: DeviceId,
        stream: Stream,
    ) -> Result<Self, BackendError> {
        let mut staged = Self::allocate(platform, data.len(), MemoryLocation::Host, device_id, stream)?;
        staged.as_host_slice_mut()?.copy_from_slice(data);
        Self::move_to(staged, location)
    }

    /// Create an owning copy of `other` in `location`.
    ///
    /// Always allocates and copies, even when `location` matches `other`; the
    /// result never aliases `other`'s storage. The copy is enqueued on
    /// `other`'s stream, which the new buffer inherits.
    pub fn copy_from(
        other: &Buffer<T>,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<Self, BackendError> {
        let result = Self::allocate(&other.platform, other.size, location, device_id, other.stream)?;
        // SAFETY: both buffers hold `other.size` elements; result is fresh
        // storage so the ranges cannot overlap.
        unsafe {
            raw_copy(
                &*other.platform,
                result.storage.raw(),
                location,
                result.device_id,
                other.storage.raw(),
                other.location(),
                other.device_id,
                other.size,
                other.stream,
            )?;
        }
        Ok(result)
    }

    /// Owning copy in the same location and on the same device.
    pub fn try_clone(&self) -> Result<Self, BackendError> {
        Self::copy_from(self, self.location(), self.device_id)
    }

    /// Move `other` into `location`.
    ///
    /// If `location` matches, ownership is transferred with no allocation and
    /// no copy. Otherwise a new buffer is allocated exactly once and the data
    /// copied; if that copy may still be in flight, `other`'s owned storage is
    /// kept alive by the platform until the stream is next synchronized.
    pub fn move_to(other: Buffer<T>, location: MemoryLocation) -> Result<Self, BackendError> {
        if other.location() == location {
            return Ok(other);
        }
        let result = Self::copy_from(&other, location, other.device_id)?;
        let kind = CopyKind::between(location, other.location());
        if other.size > 0 && other.platform.copy_is_async(kind) {
            let stream = other.stream;
            let platform = Arc::clone(&other.platform);
            if let Some(alloc) = other.into_allocation() {
                platform.retain_until_synchronized(stream, Arc::new(alloc));
            }
        }
        Ok(result)
    }

    /// Raw pointer to the first element. Never null; zero-sized buffers
    /// expose a dangling, aligned pointer.
    pub fn data(&self) -> *const T {
        self.storage.raw()
    }

    pub fn data_mut(&mut self) -> *mut T {
        self.storage.raw()
    }

    /// Number of elements. Fixed for the lifetime of the buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn byte_size(&self) -> usize {
        self.size * mem::size_of::<T>()
    }

    pub fn location(&self) -> MemoryLocation {
        self.storage.location()
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.storage, Storage::OwnedHost(_) | Storage::OwnedDevice(_))
    }

    /// Index of the active ownership tag: 0 borrowed-host, 1 borrowed-device,
    /// 2 owned-host, 3 owned-device.
    pub fn storage_index(&self) -> usize {
        self.storage.index()
    }

    pub fn platform(&self) -> &Arc<dyn MemoryPlatform> {
        &self.platform
    }

    /// Rebind to `new_stream` after waiting for all work on the current one.
    ///
    /// This blocks the calling thread; avoid it on hot paths.
    pub fn set_stream(&mut self, new_stream: Stream) -> Result<(), BackendError> {
        tracing::debug!(from = %self.stream, to = %new_stream, "rebinding buffer stream");
        self.platform.synchronize(self.stream)?;
        self.stream = new_stream;
        Ok(())
    }

    /// View host storage as a slice.
    ///
    /// Outstanding asynchronous copies into this buffer are not waited for.
    pub fn as_host_slice(&self) -> Result<&[T], BackendError> {
        self.ensure_host()?;
        // SAFETY: host storage is valid and initialized for `size` elements;
        // the shared borrow of self prevents concurrent mutation through it.
        Ok(unsafe { std::slice::from_raw_parts(self.storage.raw(), self.size) })
    }

    pub fn as_host_slice_mut(&mut self) -> Result<&mut [T], BackendError> {
        self.ensure_host()?;
        // SAFETY: as above, with exclusive access through &mut self.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.storage.raw(), self.size) })
    }

    /// Copy the contents to a host `Vec`, synchronizing the buffer's stream.
    pub fn to_vec(&self) -> Result<Vec<T>, BackendError> {
        if self.location().is_host() {
            self.platform.synchronize(self.stream)?;
            return Ok(self.as_host_slice()?.to_vec());
        }
        let host = Self::copy_from(self, MemoryLocation::Host, self.device_id)?;
        self.platform.synchronize(self.stream)?;
        Ok(host.as_host_slice()?.to_vec())
    }

    fn ensure_host(&self) -> Result<(), BackendError> {
        match self.location() {
            MemoryLocation::Host => Ok(()),
            location => Err(BackendError::NotHostAccessible(location)),
        }
    }

    fn into_allocation(self) -> Option<Allocation> {
        match self.storage {
            Storage::OwnedHost(alloc) | Storage::OwnedDevice(alloc) => Some(alloc),
            Storage::BorrowedHost(_) | Storage::BorrowedDevice(_) => None,
        }
    }
}

impl<T: Element> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("dtype", &T::NAME)
            .field("size", &self.size)
            .field("location", &self.location())
            .field("owned", &self.is_owned())
            .field("device_id", &self.device_id)
            .field("stream", &self.stream)
            .field("platform", &self.platform.name())
            .finish()
    }
}

// SAFETY: the buffer owns or borrows plain data (`Element` has no drop glue
// and is Send + Sync); callers must not rebind a stream on one thread while
// another relies on outstanding work on it.
unsafe impl<T: Element> Send for Buffer<T> {}
unsafe impl<T: Element> Sync for Buffer<T> {}

/// Copy `src[src_offset..src_end]` into `dst` starting at `dst_offset`.
///
/// Fails with [`BackendError::Range`] before anything is enqueued if the
/// source range is inverted or exceeds `src`, or if it does not fit in `dst`
/// after `dst_offset`. If the buffers are bound to different streams, `dst`
/// is first rebound to `src`'s stream, which blocks on `dst`'s old stream.
///
/// Not thread-safe with respect to `src`'s stream: if another thread rebinds
/// it while the copy is in flight, `dst` may receive stale data.
pub fn copy<T: Element>(
    dst: &mut Buffer<T>,
    src: &Buffer<T>,
    dst_offset: usize,
    src_offset: usize,
    src_end: usize,
) -> Result<(), BackendError> {
    let out_of_range = src_end < src_offset
        || src_end > src.size
        || dst_offset > dst.size
        || src_end - src_offset > dst.size - dst_offset;
    if out_of_range {
        return Err(BackendError::Range {
            dst_offset,
            src_offset,
            src_end,
            src_size: src.size,
            dst_size: dst.size,
        });
    }

    if dst.stream != src.stream {
        dst.set_stream(src.stream)?;
    }

    let len = src_end - src_offset;
    // SAFETY: offsets were range-checked above; `dst` is borrowed mutably and
    // `src` shared, so they are distinct buffers.
    unsafe {
        raw_copy(
            &*dst.platform,
            dst.storage.raw().add(dst_offset),
            dst.location(),
            dst.device_id,
            src.storage.raw().add(src_offset),
            src.location(),
            src.device_id,
            len,
            dst.stream,
        )
    }
}

/// Copy all of `src` into the start of `dst`.
pub fn copy_all<T: Element>(dst: &mut Buffer<T>, src: &Buffer<T>) -> Result<(), BackendError> {
    let end = src.size();
    copy(dst, src, 0, 0, end)
}

/// Copy all of `src` into `dst` starting at `dst_offset`.
pub fn copy_at<T: Element>(
    dst: &mut Buffer<T>,
    src: &Buffer<T>,
    dst_offset: usize,
) -> Result<(), BackendError> {
    let end = src.size();
    copy(dst, src, dst_offset, 0, end)
}

/// Copy `src[src_offset..src_end]` into the start of `dst`.
pub fn copy_range<T: Element>(
    dst: &mut Buffer<T>,
    src: &Buffer<T>,
    src_offset: usize,
    src_end: usize,
) -> Result<(), BackendError> {
    copy(dst, src, 0, src_offset, src_end)
}

/// Minimum alignment of owned storage, so byte buffers can be viewed as any
/// [`Element`] type.
const STORAGE_ALIGN: usize = 64;

fn allocate_storage<T: Element>(
    platform: &Arc<dyn MemoryPlatform>,
    size: usize,
    location: MemoryLocation,
    device_id: DeviceId,
) -> Result<Allocation, BackendError> {
    let layout = Layout::array::<T>(size)
        .and_then(|layout| layout.align_to(STORAGE_ALIGN))
        .map_err(|_| {
            BackendError::allocation(usize::MAX, location, device_id, "size overflows address space")
        })?;
    let capabilities = platform.capabilities();
    if location.is_device() && !capabilities.device_memory {
        return Err(BackendError::allocation(
            layout.size(),
            location,
            device_id,
            format!("device memory requested on {} platform without device support", platform.name()),
        ));
    }
    let ptr = if layout.size() == 0 {
        NonNull::<T>::dangling().cast::<u8>()
    } else {
        platform.allocate(layout, location, device_id)?
    };
    Ok(Allocation {
        ptr,
        layout,
        location,
        device_id,
        platform: Arc::clone(platform),
    })
}

/// Single funnel for element copies; dispatches on the location pair.
///
/// # Safety
///
/// Both ranges must be valid for `len` elements and must not overlap.
#[allow(clippy::too_many_arguments)]
unsafe fn raw_copy<T: Element>(
    platform: &dyn MemoryPlatform,
    dst: *mut T,
    dst_location: MemoryLocation,
    dst_device: DeviceId,
    src: *const T,
    src_location: MemoryLocation,
    src_device: DeviceId,
    len: usize,
    stream: Stream,
) -> Result<(), BackendError> {
    if len == 0 {
        return Ok(());
    }
    let kind = CopyKind::between(dst_location, src_location);
    let device_id = if dst_location.is_device() { dst_device } else { src_device };
    let bytes = len * mem::size_of::<T>();
    tracing::trace!(%kind, bytes, %stream, "buffer copy");
    platform.copy(kind, dst.cast(), src.cast(), bytes, device_id, stream)
}

#[cfg(test)]
#[path = "buffer_tests.rs"]
mod tests;
