//! Execution stream handles.

use std::fmt;

/// An ordered queue of asynchronous operations on one device.
///
/// The handle is opaque to this crate; only the [`MemoryPlatform`] that
/// created it knows what it refers to. `Stream::DEFAULT` is the platform's
/// default (legacy) stream.
///
/// [`MemoryPlatform`]: super::MemoryPlatform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stream(u64);

impl Stream {
    pub const DEFAULT: Stream = Stream(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub fn is_default(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}
