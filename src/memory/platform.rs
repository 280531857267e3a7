// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Raw memory platform: allocator, copy primitive and stream synchronization.
//!
//! Buffers never touch memory directly; every allocation, release and copy is
//! delegated to a [`MemoryPlatform`]. Whether device memory exists at all is a
//! capability of the platform instance, fixed at construction, so the buffer
//! and batch logic is identical across host-only and GPU deployments.

use std::alloc::{self, Layout};
use std::any::Any;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::location::{CopyKind, DeviceId, MemoryLocation};
use super::stream::Stream;
use crate::error::BackendError;
use crate::telemetry;

/// What a platform instance can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformCapabilities {
    /// Device memory can be allocated and copied to/from.
    pub device_memory: bool,
    /// Number of addressable devices (0 when `device_memory` is false).
    pub device_count: usize,
}

impl PlatformCapabilities {
    pub const HOST_ONLY: Self = Self {
        device_memory: false,
        device_count: 0,
    };
}

/// Trait abstracting the raw allocate/deallocate/copy primitives.
pub trait MemoryPlatform: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> PlatformCapabilities;

    /// Allocate `layout.size()` bytes (never zero) in `location`.
    ///
    /// Host allocations are zero-initialized.
    fn allocate(
        &self,
        layout: Layout,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<NonNull<u8>, BackendError>;

    /// Release storage returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this platform with the same layout,
    /// location and device, and must not be released twice.
    unsafe fn deallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<(), BackendError>;

    /// Copy `bytes` bytes from `src` to `dst`, enqueued on `stream`.
    ///
    /// `device_id` is the device on the device side of the copy (ignored for
    /// host-to-host). Whether the call returns before the data has moved is
    /// reported by [`copy_is_async`](Self::copy_is_async).
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `bytes` bytes in the locations named by
    /// `kind`, must not overlap, and must stay valid until the copy completes.
    unsafe fn copy(
        &self,
        kind: CopyKind,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        device_id: DeviceId,
        stream: Stream,
    ) -> Result<(), BackendError>;

    /// True if a copy of this kind may still be in flight when `copy` returns.
    fn copy_is_async(&self, kind: CopyKind) -> bool;

    /// Block until all work enqueued on `stream` has completed.
    fn synchronize(&self, stream: Stream) -> Result<(), BackendError>;

    /// Keep `guard` alive until `stream` is next synchronized.
    ///
    /// Used when the source of an asynchronous copy is released before the
    /// copy is known to have finished. Platforms whose copies are synchronous
    /// drop the guard immediately.
    fn retain_until_synchronized(&self, _stream: Stream, guard: Arc<dyn Any + Send + Sync>) {
        drop(guard);
    }

    fn stats(&self) -> &PlatformStats;
}

/// Counters shared by all platform implementations.
#[derive(Debug, Default)]
pub struct PlatformStats {
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
    live_bytes: AtomicUsize,
    copies: AtomicUsize,
    copied_bytes: AtomicUsize,
    synchronizations: AtomicUsize,
}

/// Point-in-time copy of [`PlatformStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub allocations: usize,
    pub deallocations: usize,
    pub live_bytes: usize,
    pub copies: usize,
    pub copied_bytes: usize,
    pub synchronizations: usize,
}

impl StatsSnapshot {
    /// Allocations not yet released.
    pub fn live_allocations(&self) -> usize {
        self.allocations.saturating_sub(self.deallocations)
    }
}

impl PlatformStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            allocations: self.allocations.load(Ordering::SeqCst),
            deallocations: self.deallocations.load(Ordering::SeqCst),
            live_bytes: self.live_bytes.load(Ordering::SeqCst),
            copies: self.copies.load(Ordering::SeqCst),
            copied_bytes: self.copied_bytes.load(Ordering::SeqCst),
            synchronizations: self.synchronizations.load(Ordering::SeqCst),
        }
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn record_allocation(&self, location: MemoryLocation, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_add(bytes, Ordering::SeqCst);
        telemetry::record_allocation(location, bytes);
    }

    pub(crate) fn record_deallocation(&self, bytes: usize) {
        self.deallocations.fetch_add(1, Ordering::SeqCst);
        self.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub(crate) fn record_copy(&self, kind: CopyKind, bytes: usize) {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.copied_bytes.fetch_add(bytes, Ordering::SeqCst);
        telemetry::record_copy(kind, bytes);
    }

    pub(crate) fn record_synchronization(&self) {
        self.synchronizations.fetch_add(1, Ordering::SeqCst);
        telemetry::record_stream_sync();
    }
}

// -- Host memory helpers shared by the platform implementations ---------------

pub(crate) fn host_allocate(layout: Layout) -> Result<NonNull<u8>, BackendError> {
    if layout.size() == 0 {
        return Err(BackendError::allocation(
            0,
            MemoryLocation::Host,
            0,
            "zero-sized allocation requested from platform",
        ));
    }
    // SAFETY: layout has non-zero size.
    let raw = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(raw).ok_or_else(|| {
        BackendError::allocation(layout.size(), MemoryLocation::Host, 0, "host allocator returned null")
    })
}

/// # Safety
///
/// `ptr` must come from [`host_allocate`] with the same layout.
pub(crate) unsafe fn host_deallocate(ptr: NonNull<u8>, layout: Layout) {
    alloc::dealloc(ptr.as_ptr(), layout);
}

/// # Safety
///
/// Same contract as [`MemoryPlatform::copy`] with both ranges CPU-addressable.
pub(crate) unsafe fn host_copy(dst: *mut u8, src: *const u8, bytes: usize) {
    std::ptr::copy_nonoverlapping(src, dst, bytes);
}
