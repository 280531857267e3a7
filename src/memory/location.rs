//! Memory locations and the copy-direction dispatch key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of an accelerator device. Ignored for host memory.
pub type DeviceId = usize;

/// Where the storage of a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLocation {
    /// Main system memory, CPU-addressable.
    #[default]
    Host,
    /// Accelerator-resident memory, not directly CPU-addressable.
    Device,
}

impl MemoryLocation {
    pub fn is_host(self) -> bool {
        self == Self::Host
    }

    pub fn is_device(self) -> bool {
        self == Self::Device
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLocation::Host => write!(f, "host"),
            MemoryLocation::Device => write!(f, "device"),
        }
    }
}

/// Direction of a raw copy, keyed by (destination, source) location.
///
/// Every copy in the crate goes through [`CopyKind::between`], so a new
/// storage class only needs a new arm here and in the platform's `copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl CopyKind {
    pub fn between(dst: MemoryLocation, src: MemoryLocation) -> Self {
        match (dst, src) {
            (MemoryLocation::Host, MemoryLocation::Host) => Self::HostToHost,
            (MemoryLocation::Device, MemoryLocation::Host) => Self::HostToDevice,
            (MemoryLocation::Host, MemoryLocation::Device) => Self::DeviceToHost,
            (MemoryLocation::Device, MemoryLocation::Device) => Self::DeviceToDevice,
        }
    }

    pub fn destination(self) -> MemoryLocation {
        match self {
            Self::HostToHost | Self::DeviceToHost => MemoryLocation::Host,
            Self::HostToDevice | Self::DeviceToDevice => MemoryLocation::Device,
        }
    }

    pub fn source(self) -> MemoryLocation {
        match self {
            Self::HostToHost | Self::HostToDevice => MemoryLocation::Host,
            Self::DeviceToHost | Self::DeviceToDevice => MemoryLocation::Device,
        }
    }

    /// True if either side of the copy is device memory.
    pub fn touches_device(self) -> bool {
        self != Self::HostToHost
    }

    /// Label used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostToHost => "h2h",
            Self::HostToDevice => "h2d",
            Self::DeviceToHost => "d2h",
            Self::DeviceToDevice => "d2d",
        }
    }
}

impl fmt::Display for CopyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
