//! Integration tests for buffers, tensors and memory platforms.

use std::sync::Arc;

use gg_batch::memory::{copy, copy_all, SimulatedDeviceConfig};
use gg_batch::{
    BackendError, Buffer, ErrorKind, HostPlatform, MemoryLocation, MemoryPlatform, SimulatedDevicePlatform,
    Stream, Tensor,
};

fn host() -> Arc<dyn MemoryPlatform> {
    Arc::new(HostPlatform::new())
}

#[test]
fn copy_is_independent_of_original() {
    let platform = host();
    let mut original =
        Buffer::from_host_slice(&platform, &[1i32, 2, 3, 4], MemoryLocation::Host, 0, Stream::DEFAULT).unwrap();
    let copy = original.try_clone().unwrap();

    original.as_host_slice_mut().unwrap()[0] = 99;

    assert_eq!(copy.to_vec().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn host_only_platform_refuses_device_memory() {
    let platform = host();
    let err = Buffer::<u8>::allocate(&platform, 1024, MemoryLocation::Device, 0, Stream::DEFAULT).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Allocation);
    assert!(!err.is_programming_error());
}

#[test]
fn host_device_host_round_trip_is_identical() {
    let platform: Arc<dyn MemoryPlatform> = Arc::new(SimulatedDevicePlatform::deferred());
    let values: Vec<half::bf16> = (0..257).map(|i| half::bf16::from_f32(i as f32 * 0.25)).collect();

    let device = Buffer::from_host_slice(&platform, &values, MemoryLocation::Device, 0, Stream::from_raw(1)).unwrap();
    let back = Buffer::move_to(device, MemoryLocation::Host).unwrap();
    platform.synchronize(Stream::from_raw(1)).unwrap();

    assert_eq!(back.as_host_slice().unwrap(), values.as_slice());
}

#[test]
fn device_host_device_round_trip_is_identical() {
    for platform in [SimulatedDevicePlatform::synchronous(), SimulatedDevicePlatform::deferred()] {
        let platform: Arc<dyn MemoryPlatform> = Arc::new(platform);
        let stream = Stream::from_raw(5);
        let values: Vec<u16> = (0..300).map(|i| i * 3).collect();
        let origin = Buffer::from_host_slice(&platform, &values, MemoryLocation::Device, 0, stream).unwrap();

        let on_host = Buffer::move_to(origin.try_clone().unwrap(), MemoryLocation::Host).unwrap();
        let back = Buffer::move_to(on_host, MemoryLocation::Device).unwrap();

        assert_eq!(back.location(), MemoryLocation::Device);
        assert_eq!(back.to_vec().unwrap(), origin.to_vec().unwrap());
        assert_eq!(back.to_vec().unwrap(), values);
    }
}

#[test]
fn device_to_device_across_devices() {
    let platform: Arc<dyn MemoryPlatform> = Arc::new(SimulatedDevicePlatform::new(SimulatedDeviceConfig {
        device_count: 2,
        ..Default::default()
    }));
    let on_zero =
        Buffer::from_host_slice(&platform, &[1u64, 2, 3], MemoryLocation::Device, 0, Stream::DEFAULT).unwrap();
    let on_one = Buffer::copy_from(&on_zero, MemoryLocation::Device, 1).unwrap();
    assert_eq!(on_one.device_id(), 1);
    assert_eq!(on_one.to_vec().unwrap(), vec![1, 2, 3]);
}

#[test]
fn device_capacity_exhaustion_is_an_error() {
    let platform: Arc<dyn MemoryPlatform> = Arc::new(SimulatedDevicePlatform::new(SimulatedDeviceConfig {
        device_count: 1,
        capacity_per_device: 1024,
        deferred_copies: false,
    }));
    let _held = Buffer::<f32>::allocate(&platform, 200, MemoryLocation::Device, 0, Stream::DEFAULT).unwrap();
    let result = Buffer::<f32>::allocate(&platform, 200, MemoryLocation::Device, 0, Stream::DEFAULT);
    assert!(matches!(result, Err(BackendError::Allocation { .. })));
}

#[test]
fn range_errors_are_programming_errors() {
    let platform = host();
    let src = Buffer::<f32>::allocate(&platform, 4, MemoryLocation::Host, 0, Stream::DEFAULT).unwrap();
    let mut dst = Buffer::<f32>::allocate(&platform, 2, MemoryLocation::Host, 0, Stream::DEFAULT).unwrap();

    let err = copy_all(&mut dst, &src).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Range);
    assert!(err.is_programming_error());
    assert!(copy(&mut dst, &src, 0, 2, 4).is_ok());
}

#[test]
fn size_never_changes() {
    let platform: Arc<dyn MemoryPlatform> = Arc::new(SimulatedDevicePlatform::synchronous());
    let mut buffer = Buffer::<i32>::allocate(&platform, 10, MemoryLocation::Host, 0, Stream::DEFAULT).unwrap();
    buffer.set_stream(Stream::from_raw(2)).unwrap();
    let seed = Buffer::<i32>::allocate(&platform, 3, MemoryLocation::Host, 0, Stream::from_raw(2)).unwrap();
    copy(&mut buffer, &seed, 7, 0, 3).unwrap();
    let moved = Buffer::move_to(buffer, MemoryLocation::Device).unwrap();
    assert_eq!(moved.size(), 10);
    let back = Buffer::move_to(moved, MemoryLocation::Host).unwrap();
    assert_eq!(back.size(), 10);
}

#[test]
fn tensor_shape_must_match_buffer() {
    let platform = host();
    let buffer = Buffer::<f32>::allocate(&platform, 6, MemoryLocation::Host, 0, Stream::DEFAULT).unwrap();
    let result = Tensor::new(vec![4, 2], buffer);
    assert!(matches!(result, Err(BackendError::ShapeMismatch(_))));

    let tensor = Tensor::<f32>::allocate(&platform, vec![2, 3], MemoryLocation::Host, 0, Stream::DEFAULT).unwrap();
    assert_eq!(tensor.size(), 6);
    assert_eq!(tensor.location(), MemoryLocation::Host);
}
