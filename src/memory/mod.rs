//! Memory management module.
//!
//! Provides typed host/device buffers and the platform abstraction they
//! allocate and copy through.

mod buffer;
#[cfg(feature = "cuda")]
mod cuda;
mod element;
mod host;
mod location;
mod platform;
mod simulated;
mod stream;

pub use buffer::{copy, copy_all, copy_at, copy_range, Buffer};
#[cfg(feature = "cuda")]
pub use cuda::CudaPlatform;
pub use element::Element;
pub(crate) use element::{as_bytes, from_bytes};
pub use host::HostPlatform;
pub use location::{CopyKind, DeviceId, MemoryLocation};
pub use platform::{MemoryPlatform, PlatformCapabilities, PlatformStats, StatsSnapshot};
pub use simulated::{SimulatedDeviceConfig, SimulatedDevicePlatform};
pub use stream::Stream;
