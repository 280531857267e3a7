//! Tests for the simulated device platform.

use std::alloc::Layout;
use std::sync::Arc;

use super::*;
use crate::memory::Buffer;

fn layout(bytes: usize) -> Layout {
    Layout::from_size_align(bytes, 8).unwrap()
}

fn small_device(capacity: usize, deferred: bool) -> SimulatedDevicePlatform {
    SimulatedDevicePlatform::new(SimulatedDeviceConfig {
        device_count: 2,
        capacity_per_device: capacity,
        deferred_copies: deferred,
    })
}

#[test]
fn allocate_and_deallocate_all_returns_zero() {
    let platform = small_device(4096, false);
    let mut ptrs = Vec::new();
    for _ in 0..8 {
        ptrs.push(platform.allocate(layout(512), MemoryLocation::Device, 0).unwrap());
    }
    assert_eq!(platform.device_bytes_in_use(0), 4096);
    for ptr in ptrs {
        unsafe { platform.deallocate(ptr, layout(512), MemoryLocation::Device, 0).unwrap() };
    }
    assert_eq!(platform.device_bytes_in_use(0), 0);
    assert_eq!(platform.leak_count(), 0);
}

#[test]
fn beyond_capacity_is_allocation_error() {
    let platform = small_device(1024, false);
    let a = platform.allocate(layout(512), MemoryLocation::Device, 0).unwrap();
    let result = platform.allocate(layout(1024), MemoryLocation::Device, 0);
    assert!(matches!(result, Err(BackendError::Allocation { bytes: 1024, .. })));
    unsafe { platform.deallocate(a, layout(512), MemoryLocation::Device, 0).unwrap() };
}

#[test]
fn capacity_is_per_device() {
    let platform = small_device(1024, false);
    let a = platform.allocate(layout(1024), MemoryLocation::Device, 0).unwrap();
    let b = platform.allocate(layout(1024), MemoryLocation::Device, 1).unwrap();
    assert_eq!(platform.device_bytes_in_use(0), 1024);
    assert_eq!(platform.device_bytes_in_use(1), 1024);
    unsafe {
        platform.deallocate(a, layout(1024), MemoryLocation::Device, 0).unwrap();
        platform.deallocate(b, layout(1024), MemoryLocation::Device, 1).unwrap();
    }
}

#[test]
fn unknown_device_is_rejected() {
    let platform = small_device(1024, false);
    let result = platform.allocate(layout(64), MemoryLocation::Device, 7);
    assert!(matches!(result, Err(BackendError::Allocation { device_id: 7, .. })));
}

#[test]
fn double_free_detection() {
    let platform = small_device(4096, false);
    let ptr = platform.allocate(layout(256), MemoryLocation::Device, 0).unwrap();
    let other = platform.allocate(layout(256), MemoryLocation::Device, 0).unwrap();
    unsafe { platform.deallocate(ptr, layout(256), MemoryLocation::Device, 0).unwrap() };
    assert_eq!(platform.leak_count(), 1);

    // Rejected before the host allocator is touched.
    let result = unsafe { platform.deallocate(ptr, layout(256), MemoryLocation::Device, 0) };
    assert!(matches!(result, Err(BackendError::InternalConsistency(_))));
    assert_eq!(platform.device_bytes_in_use(0), 256);
    unsafe { platform.deallocate(other, layout(256), MemoryLocation::Device, 0).unwrap() };
}

#[test]
fn stress_test_1000_cycles_zero_drift() {
    let platform = small_device(1024 * 1024, false);
    for _ in 0..1000 {
        let ptr = platform.allocate(layout(1024), MemoryLocation::Device, 0).unwrap();
        unsafe { platform.deallocate(ptr, layout(1024), MemoryLocation::Device, 0).unwrap() };
    }
    assert_eq!(platform.device_bytes_in_use(0), 0);
    assert_eq!(platform.leak_count(), 0);
    let stats = platform.stats().snapshot();
    assert_eq!(stats.allocations, 1000);
    assert_eq!(stats.live_allocations(), 0);
    assert_eq!(stats.live_bytes, 0);
}

#[test]
fn copy_outside_device_allocation_is_rejected() {
    let platform = small_device(4096, false);
    let dev = platform.allocate(layout(64), MemoryLocation::Device, 0).unwrap();
    let host = vec![0u8; 128];
    let result = unsafe {
        platform.copy(CopyKind::HostToDevice, dev.as_ptr(), host.as_ptr(), 128, 0, Stream::DEFAULT)
    };
    assert!(matches!(result, Err(BackendError::Platform(_))));
    unsafe { platform.deallocate(dev, layout(64), MemoryLocation::Device, 0).unwrap() };
}

#[test]
fn deferred_copies_land_on_synchronize() {
    let platform = small_device(4096, true);
    let stream = Stream::from_raw(3);
    let dev = platform.allocate(layout(4), MemoryLocation::Device, 0).unwrap();
    let src = [1u8, 2, 3, 4];
    let mut back = [0u8; 4];
    unsafe {
        platform.copy(CopyKind::HostToDevice, dev.as_ptr(), src.as_ptr(), 4, 0, stream).unwrap();
        platform.copy(CopyKind::DeviceToHost, back.as_mut_ptr(), dev.as_ptr(), 4, 0, stream).unwrap();
    }
    assert_eq!(platform.pending_copies(stream), 2);
    assert_eq!(back, [0; 4]);

    platform.synchronize(stream).unwrap();
    assert_eq!(platform.pending_copies(stream), 0);
    assert_eq!(back, [1, 2, 3, 4]);
    unsafe { platform.deallocate(dev, layout(4), MemoryLocation::Device, 0).unwrap() };
}

#[test]
fn synchronize_only_drains_its_own_stream() {
    let platform = small_device(4096, true);
    let dev = platform.allocate(layout(4), MemoryLocation::Device, 0).unwrap();
    let src = [9u8; 4];
    unsafe {
        platform
            .copy(CopyKind::HostToDevice, dev.as_ptr(), src.as_ptr(), 4, 0, Stream::from_raw(1))
            .unwrap();
    }
    platform.synchronize(Stream::from_raw(2)).unwrap();
    assert_eq!(platform.pending_copies(Stream::from_raw(1)), 1);
    platform.synchronize(Stream::from_raw(1)).unwrap();
    assert_eq!(platform.pending_copies(Stream::from_raw(1)), 0);
    unsafe { platform.deallocate(dev, layout(4), MemoryLocation::Device, 0).unwrap() };
}

#[test]
fn host_copies_are_never_deferred() {
    let platform = small_device(4096, true);
    assert!(!platform.copy_is_async(CopyKind::HostToHost));
    assert!(platform.copy_is_async(CopyKind::DeviceToDevice));

    let src = [5u8; 8];
    let mut dst = [0u8; 8];
    unsafe {
        platform
            .copy(CopyKind::HostToHost, dst.as_mut_ptr(), src.as_ptr(), 8, 0, Stream::DEFAULT)
            .unwrap();
    }
    assert_eq!(dst, [5; 8]);
}

#[test]
fn retained_guard_released_on_synchronize() {
    let platform: Arc<dyn MemoryPlatform> = Arc::new(small_device(4096, true));
    let guard: Arc<Vec<u8>> = Arc::new(vec![1, 2, 3]);
    let stream = Stream::from_raw(5);
    platform.retain_until_synchronized(stream, guard.clone());
    assert_eq!(Arc::strong_count(&guard), 2);
    platform.synchronize(stream).unwrap();
    assert_eq!(Arc::strong_count(&guard), 1);
}

#[test]
fn buffers_release_device_memory_on_drop() {
    let sim = Arc::new(small_device(4096, false));
    let platform: Arc<dyn MemoryPlatform> = sim.clone();
    {
        let _a = Buffer::<f32>::allocate(&platform, 64, MemoryLocation::Device, 0, Stream::DEFAULT).unwrap();
        let _b = Buffer::<f32>::allocate(&platform, 64, MemoryLocation::Device, 1, Stream::DEFAULT).unwrap();
        assert_eq!(sim.leak_count(), 2);
        assert_eq!(sim.device_bytes_in_use(0), 256);
    }
    assert_eq!(sim.leak_count(), 0);
}

#[test]
fn zero_devices_means_host_only() {
    let platform = SimulatedDevicePlatform::new(SimulatedDeviceConfig {
        device_count: 0,
        ..Default::default()
    });
    assert_eq!(platform.capabilities(), PlatformCapabilities::HOST_ONLY);
    assert!(small_device(1024, false).capabilities().device_memory);
}
