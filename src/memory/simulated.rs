// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Simulated device platform (testing + CPU fallback).
//!
//! Device memory is emulated in host RAM with a per-device capacity. Live
//! device allocations are tracked so leaks and double frees are detected. In
//! deferred mode, copies that touch device memory are queued per stream and
//! only executed, in issue order, when that stream is synchronized.

use std::alloc::Layout;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::location::{CopyKind, DeviceId, MemoryLocation};
use super::platform::{
    host_allocate, host_copy, host_deallocate, MemoryPlatform, PlatformCapabilities, PlatformStats,
};
use super::stream::Stream;
use crate::error::BackendError;

/// Configuration for the simulated device platform.
#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    pub device_count: usize,
    /// Device memory available per device, in bytes.
    pub capacity_per_device: usize,
    /// Queue device copies until the stream is synchronized.
    pub deferred_copies: bool,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            capacity_per_device: 256 * 1024 * 1024, // 256 MiB
            deferred_copies: false,
        }
    }
}

struct DeviceAllocation {
    bytes: usize,
    device_id: DeviceId,
}

struct DeviceState {
    // Keyed by start address.
    live: BTreeMap<usize, DeviceAllocation>,
    used: Vec<usize>,
}

struct PendingCopy {
    dst: usize,
    src: usize,
    bytes: usize,
}

#[derive(Default)]
struct StreamQueue {
    copies: Vec<PendingCopy>,
    retained: Vec<Arc<dyn Any + Send + Sync>>,
}

/// Device platform backed by host RAM.
pub struct SimulatedDevicePlatform {
    config: SimulatedDeviceConfig,
    stats: PlatformStats,
    devices: Mutex<DeviceState>,
    streams: Mutex<HashMap<Stream, StreamQueue>>,
}

impl SimulatedDevicePlatform {
    pub fn new(config: SimulatedDeviceConfig) -> Self {
        let used = vec![0; config.device_count];
        Self {
            config,
            stats: PlatformStats::default(),
            devices: Mutex::new(DeviceState {
                live: BTreeMap::new(),
                used,
            }),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Platform with synchronous copies and default capacity.
    pub fn synchronous() -> Self {
        Self::new(SimulatedDeviceConfig::default())
    }

    /// Platform whose device copies only land on stream synchronization.
    pub fn deferred() -> Self {
        Self::new(SimulatedDeviceConfig {
            deferred_copies: true,
            ..Default::default()
        })
    }

    /// Count of live (un-freed) device allocations.
    pub fn leak_count(&self) -> usize {
        self.devices.lock().live.len()
    }

    /// Device bytes in use on `device_id`.
    pub fn device_bytes_in_use(&self, device_id: DeviceId) -> usize {
        self.devices.lock().used.get(device_id).copied().unwrap_or(0)
    }

    /// Copies enqueued on `stream` and not yet executed.
    pub fn pending_copies(&self, stream: Stream) -> usize {
        self.streams
            .lock()
            .get(&stream)
            .map(|q| q.copies.len())
            .unwrap_or(0)
    }

    /// Guards held until `stream` is synchronized.
    pub fn retained_guards(&self, stream: Stream) -> usize {
        self.streams
            .lock()
            .get(&stream)
            .map(|q| q.retained.len())
            .unwrap_or(0)
    }

    fn check_device_range(&self, ptr: usize, bytes: usize) -> Result<(), BackendError> {
        let state = self.devices.lock();
        let contained = state
            .live
            .range(..=ptr)
            .next_back()
            .map(|(start, alloc)| ptr + bytes <= start + alloc.bytes)
            .unwrap_or(false);
        if contained {
            Ok(())
        } else {
            Err(BackendError::Platform(format!(
                "invalid device range {:#x}+{} bytes",
                ptr, bytes
            )))
        }
    }

    fn drain(&self, queue: StreamQueue) {
        for pending in &queue.copies {
            // SAFETY: validated when enqueued; callers keep both ranges alive
            // until the stream is synchronized.
            unsafe { host_copy(pending.dst as *mut u8, pending.src as *const u8, pending.bytes) };
        }
        drop(queue.retained);
    }

    fn drain_all(&self) {
        let queues: Vec<StreamQueue> = self.streams.lock().drain().map(|(_, q)| q).collect();
        for queue in queues {
            self.drain(queue);
        }
    }
}

impl MemoryPlatform for SimulatedDevicePlatform {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn capabilities(&self) -> PlatformCapabilities {
        PlatformCapabilities {
            device_memory: self.config.device_count > 0,
            device_count: self.config.device_count,
        }
    }

    fn allocate(
        &self,
        layout: Layout,
        location: MemoryLocation,
        device_id: DeviceId,
    ) -> Result<NonNull<u8>, BackendError> {
        if location.is_host() {
            let ptr = host_allocate(layout)?;
            self.stats.record_allocation(location, layout.size());
            return Ok(ptr);
        }

        let mut state = self.devices.lock();
        let used = *state.used.get(device_id).ok_or_else(|| {
            BackendError::allocation(layout.size(), location, device_id, "no such device")
        })?;
        if used + layout.size() > self.config.capacity_per_device {
            return Err(BackendError::allocation(
                layout.size(),
                location,
                device_id,
                format!(
                    "out of device memory, available {} bytes",
                    self.config.capacity_per_device - used
                ),
            ));
        }
        let ptr = host_allocate(layout)?;
        state.used[device_id] += layout.size();
        state.live.insert(
            ptr.as_ptr() as usize,
            DeviceAllocation {
                bytes: layout.size(),
                device_id,
            },
        );
        drop(state);

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
            // Device frees are implicitly synchronizing.
            self.drain_all();
            let mut state = self.devices.lock();
            let alloc = state.live.remove(&(ptr.as_ptr() as usize)).ok_or_else(|| {
                BackendError::InternalConsistency(format!(
                    "double-free or unknown device allocation {:#x}",
                    ptr.as_ptr() as usize
                ))
            })?;
            state.used[alloc.device_id] -= alloc.bytes;
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
        stream: Stream,
    ) -> Result<(), BackendError> {
        if bytes == 0 {
            return Ok(());
        }
        if kind.destination().is_device() {
            self.check_device_range(dst as usize, bytes)?;
        }
        if kind.source().is_device() {
            self.check_device_range(src as usize, bytes)?;
        }

        if self.copy_is_async(kind) {
            self.streams
                .lock()
                .entry(stream)
                .or_default()
                .copies
                .push(PendingCopy {
                    dst: dst as usize,
                    src: src as usize,
                    bytes,
                });
        } else {
            host_copy(dst, src, bytes);
        }
        self.stats.record_copy(kind, bytes);
        Ok(())
    }

    fn copy_is_async(&self, kind: CopyKind) -> bool {
        self.config.deferred_copies && kind.touches_device()
    }

    fn synchronize(&self, stream: Stream) -> Result<(), BackendError> {
        let queue = self.streams.lock().remove(&stream);
        if let Some(queue) = queue {
            tracing::trace!(%stream, pending = queue.copies.len(), "draining simulated stream");
            self.drain(queue);
        }
        self.stats.record_synchronization();
        Ok(())
    }

    fn retain_until_synchronized(&self, stream: Stream, guard: Arc<dyn Any + Send + Sync>) {
        self.streams
            .lock()
            .entry(stream)
            .or_default()
            .retained
            .push(guard);
    }

    fn stats(&self) -> &PlatformStats {
        &self.stats
    }
}

#[cfg(test)]
#[path = "simulated_tests.rs"]
mod tests;
