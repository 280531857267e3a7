//! GG-BATCH backend core
//!
//! Typed host/device memory buffers and batch assembly for a GPU
//! model-serving backend. The crate moves tensors between host and device
//! memory and concatenates per-request inputs into batch tensors. It also
//! scatters batch outputs back to per-request responses. It does not run
//! models or schedule batches; batch membership is handed to it.
//!
//! # Layers
//!
//! - [`memory`]: [`Buffer`] over a pluggable [`MemoryPlatform`] (host-only,
//!   simulated device, or CUDA behind the `cuda` feature)
//! - [`tensor`]: a buffer plus a shape
//! - [`batch`]: [`Batch`] with its input and output assemblers, and the
//!   collaborator traits the host runtime implements
//!
//! ```
//! use std::sync::Arc;
//! use gg_batch::batch::local::{LocalRequest, LocalRuntime};
//! use gg_batch::{Batch, BatchSettings, HostPlatform, MemoryLocation, MemoryPlatform, Stream};
//!
//! let platform: Arc<dyn MemoryPlatform> = Arc::new(HostPlatform::new());
//! let runtime = LocalRuntime::new(platform.clone());
//! let requests = vec![
//!     LocalRequest::new(1).with_input(&platform, "x", vec![2, 3], &[0f32; 6], MemoryLocation::Host, 0)?,
//!     LocalRequest::new(2).with_input(&platform, "x", vec![1, 3], &[1f32; 3], MemoryLocation::Host, 0)?,
//! ];
//! let batch = Batch::new(&runtime, &requests, &BatchSettings::default(), Stream::DEFAULT)?;
//! let x = batch.get_input::<f32>("x", MemoryLocation::Host, 0)?;
//! assert_eq!(x.shape(), &[3, 3]);
//! # Ok::<(), gg_batch::BackendError>(())
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod memory;
pub mod telemetry;
pub mod tensor;

pub use batch::{Batch, BatchSettings, BatchState};
pub use config::BackendConfig;
pub use error::{BackendError, ErrorKind};
pub use memory::{
    Buffer, DeviceId, Element, HostPlatform, MemoryLocation, MemoryPlatform, SimulatedDevicePlatform, Stream,
};
pub use tensor::Tensor;
