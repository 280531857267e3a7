//! Error types for the batch backend core.
//!
//! Every error is raised to the immediate caller. Nothing here is transient,
//! so nothing is retried and nothing is replaced with a default value.

use thiserror::Error;

use crate::memory::{DeviceId, MemoryLocation};

/// Errors raised by buffers, tensors and batch assembly.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Allocation failed: {bytes} bytes in {location} memory (device {device_id}): {reason}")]
    Allocation {
        bytes: usize,
        location: MemoryLocation,
        device_id: DeviceId,
        reason: String,
    },

    #[error("Bad copy between buffers: source range {src_offset}..{src_end} of {src_size}, destination offset {dst_offset} of {dst_size}")]
    Range {
        dst_offset: usize,
        src_offset: usize,
        src_end: usize,
        src_size: usize,
        dst_size: usize,
    },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Batch already finalized")]
    DoubleFinalize,

    #[error("Batch is finalized; no further inputs or outputs can be requested")]
    BatchFinalized,

    #[error("Batch contains no requests")]
    EmptyBatch,

    #[error("Batch too large: {count} requests, maximum {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("Input not found: {0}")]
    MissingInput(String),

    #[error("Output already requested: {0}")]
    DuplicateOutput(String),

    #[error("Buffer in {0} memory is not host accessible")]
    NotHostAccessible(MemoryLocation),

    #[error("Platform operation failed: {0}")]
    Platform(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of [`BackendError`], mirroring the error kinds the
/// surrounding runtime reports per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Range,
    ShapeMismatch,
    InternalConsistency,
    DoubleFinalize,
    InvalidRequest,
    Platform,
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::Range { .. } => ErrorKind::Range,
            Self::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
            Self::InternalConsistency(_) => ErrorKind::InternalConsistency,
            Self::DoubleFinalize => ErrorKind::DoubleFinalize,
            Self::BatchFinalized
            | Self::EmptyBatch
            | Self::BatchTooLarge { .. }
            | Self::MissingInput(_)
            | Self::DuplicateOutput(_)
            | Self::NotHostAccessible(_)
            | Self::Config(_) => ErrorKind::InvalidRequest,
            Self::Platform(_) => ErrorKind::Platform,
        }
    }

    /// Returns true if the error comes from misuse of the API by backend code
    /// rather than from the data carried by the requests.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::Range { .. }
                | Self::DoubleFinalize
                | Self::BatchFinalized
                | Self::DuplicateOutput(_)
                | Self::NotHostAccessible(_)
        )
    }

    pub(crate) fn allocation(
        bytes: usize,
        location: MemoryLocation,
        device_id: DeviceId,
        reason: impl Into<String>,
    ) -> Self {
        Self::Allocation {
            bytes,
            location,
            device_id,
            reason: reason.into(),
        }
    }
}
