//! Host-only memory platform.
//!
//! Used on deployments without an accelerator. Device memory requests fail
//! with an allocation error instead of being silently served from host RAM.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::location::{CopyKind, DeviceId, MemoryLocation};
use super::platform::{
    host_allocate, host_copy, host_deallocate, MemoryPlatform, PlatformCapabilities, PlatformStats,
};
use super::stream::Stream;
use crate::error::BackendError;

/// Platform backed by the global allocator with no device support.
#[derive(Debug, Default)]
pub struct HostPlatform {
    stats: PlatformStats,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryPlatform for HostPlatform {
    fn name(&self) -> &'static str {
        "host"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities::HOST_ONLY
    }

    fn allocate(
        &self,
        layout: Layout,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<NonNull<u8>, BackendError> {
        if location.is_device() {
            return Err(BackendError::allocation(
                layout.size(),
                location,
                device_id,
                "device memory requested on a host-only platform",
            ));
        }
        let ptr = host_allocate(layout)?;
        self.stats.record_allocation(location, layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        location: MemoryLocation,
        _device_id: DeviceId,
    ) -> Result<(), BackendError> {
        if location.is_device() {
            return Err(BackendError::InternalConsistency(
                "device deallocation on a host-only platform".into(),
            ));
        }
        host_deallocate(ptr, layout);
        self.stats.record_deallocation(layout.size());
        Ok(())
    }

    unsafe fn copy(
        &self,
        kind: CopyKind,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        _device_id: DeviceId,
        _stream: Stream,
    ) -> Result<(), BackendError> {
        if kind.touches_device() {
            return Err(BackendError::Platform(format!(
                "{} copy on a host-only platform",
                kind
            )));
        }
        host_copy(dst, src, bytes);
        self.stats.record_copy(kind, bytes);
        Ok(())
    }

    fn copy_is_async(&self, _kind: CopyKind) -> bool {
        false
    }

    fn synchronize(&self, _stream: Stream) -> Result<(), BackendError> {
        self.stats.record_synchronization();
        Ok(())
    }

    fn stats(&self) -> &PlatformStats {
        &self.stats
    }
}
