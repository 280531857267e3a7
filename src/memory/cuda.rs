// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! CUDA memory platform backed by `cudarc`.
//!
//! Streams are raw `CUstream` handles; `Stream::DEFAULT` maps to the legacy
//! null stream. Host storage comes from the global allocator (pageable), so
//! host/device copies are asynchronous only with respect to the host thread
//! when the driver chooses to stage them.

use std::alloc::Layout;
use std::any::Any;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use cudarc::driver::{result, sys, CudaDevice, DriverError};
use parking_lot::Mutex;

use super::location::{CopyKind, DeviceId, MemoryLocation};
use super::platform::{
    host_allocate, host_copy, host_deallocate, MemoryPlatform, PlatformCapabilities, PlatformStats,
};
use super::stream::Stream;
use crate::error::BackendError;

fn driver_error(context: &str, err: DriverError) -> BackendError {
    BackendError::Platform(format!("{}: {:?}", context, err))
}

fn raw_stream(stream: Stream) -> sys::CUstream {
    stream.as_raw() as usize as sys::CUstream
}

/// Platform that allocates device memory through the CUDA driver API.
pub struct CudaPlatform {
    devices: Vec<Arc<CudaDevice>>,
    stats: PlatformStats,
    retained: Mutex<HashMap<Stream, Vec<Arc<dyn Any + Send + Sync>>>>,
}

impl CudaPlatform {
    /// Open every visible CUDA device.
    pub fn new() -> Result<Self, BackendError> {
        let count = CudaDevice::count().map_err(|e| driver_error("device count", e))?;
        let devices = (0..count as usize)
            .map(|ordinal| CudaDevice::new(ordinal).map_err(|e| driver_error("device open", e)))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::info!(devices = devices.len(), "CUDA platform initialized");
        Ok(Self {
            devices,
            stats: PlatformStats::default(),
            retained: Mutex::new(HashMap::new()),
        })
    }

    fn bind(&self, device_id: DeviceId) -> Result<&Arc<CudaDevice>, BackendError> {
        let device = self.devices.get(device_id).ok_or_else(|| {
            BackendError::Platform(format!("CUDA device {} not found", device_id))
        })?;
        device
            .bind_to_thread()
            .map_err(|e| driver_error("bind device", e))?;
        Ok(device)
    }
}

impl MemoryPlatform for CudaPlatform {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            device_memory: !self.devices.is_empty(),
            device_count: self.devices.len(),
        }
    }

    fn allocate(
        &self,
        layout: Layout,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<NonNull<u8>, BackendError> {
        let ptr = match location {
            MemoryLocation::Host => host_allocate(layout)?,
            MemoryLocation::Device => {
                self.bind(device_id)
                    .map_err(|e| BackendError::allocation(layout.size(), location, device_id, e.to_string()))?;
                // SAFETY: the device context is bound to this thread.
                let dptr = unsafe { result::malloc_sync(layout.size()) }.map_err(|e| {
                    BackendError::allocation(layout.size(), location, device_id, format!("{:?}", e))
                })?;
                NonNull::new(dptr as usize as *mut u8).ok_or_else(|| {
                    BackendError::allocation(layout.size(), location, device_id, "driver returned null")
                })?
            }
        };
        self.stats.record_allocation(location, layout.size());
        Ok(ptr)
    }

    unsafe fn deallocate(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<(), BackendError> {
        match location {
            MemoryLocation::Host => host_deallocate(ptr, layout),
            MemoryLocation::Device => {
                self.bind(device_id)?;
                result::free_sync(ptr.as_ptr() as usize as sys::CUdeviceptr)
                    .map_err(|e| driver_error("free", e))?;
            }
        }
        self.stats.record_deallocation(layout.size());
        Ok(())
    }

    unsafe fn copy(
        &self,
        kind: CopyKind,
        dst: *mut u8,
        src: *const u8,
        bytes: usize,
        device_id: DeviceId,
        stream: Stream,
    ) -> Result<(), BackendError> {
        if bytes == 0 {
            return Ok(());
        }
        if kind.touches_device() {
            self.bind(device_id)?;
        }
        let cu_stream = raw_stream(stream);
        match kind {
            CopyKind::HostToHost => host_copy(dst, src, bytes),
            CopyKind::HostToDevice => {
                let src = std::slice::from_raw_parts(src, bytes);
                result::memcpy_htod_async(dst as usize as sys::CUdeviceptr, src, cu_stream)
                    .map_err(|e| driver_error("memcpy h2d", e))?;
            }
            CopyKind::DeviceToHost => {
                let dst = std::slice::from_raw_parts_mut(dst, bytes);
                result::memcpy_dtoh_async(dst, src as usize as sys::CUdeviceptr, cu_stream)
                    .map_err(|e| driver_error("memcpy d2h", e))?;
            }
            CopyKind::DeviceToDevice => {
                result::memcpy_dtod_async(
                    dst as usize as sys::CUdeviceptr,
                    src as usize as sys::CUdeviceptr,
                    bytes,
                    cu_stream,
                )
                .map_err(|e| driver_error("memcpy d2d", e))?;
            }
        }
        self.stats.record_copy(kind, bytes);
        Ok(())
    }

    fn copy_is_async(&self, kind: CopyKind) -> bool {
        kind.touches_device()
    }

    fn synchronize(&self, stream: Stream) -> Result<(), BackendError> {
        // SAFETY: stream handles are created by the surrounding runtime and
        // outlive the buffers bound to them.
        unsafe { result::stream::synchronize(raw_stream(stream)) }
            .map_err(|e| driver_error("stream synchronize", e))?;
        let released = self.retained.lock().remove(&stream);
        drop(released);
        self.stats.record_synchronization();
        Ok(())
    }

    fn retain_until_synchronized(&self, stream: Stream, guard: Arc<dyn Any + Send + Sync>) {
        self.retained.lock().entry(stream).or_default().push(guard);
    }

    fn stats(&self) -> &PlatformStats {
        &self.stats
    }
}

// SAFETY: CUDA device handles are thread-safe; raw stream handles are plain
// integers inside `Stream`.
unsafe impl Send for CudaPlatform {}
unsafe impl Sync for CudaPlatform {}
