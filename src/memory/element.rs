//! Element types that may be stored in a [`Buffer`](super::Buffer).

use half::{bf16, f16};

mod sealed {
    pub trait Sealed {}
}

/// Plain-old-data element type.
///
/// Buffers are filled by raw byte copies (possibly from device memory), so an
/// element must be valid for any bit pattern and carry no drop glue. The trait
/// is sealed to the types below for that reason.
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    /// Name used in logs and error messages.
    const NAME: &'static str;
}

macro_rules! impl_element {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                const NAME: &'static str = $name;
            }
        )*
    };
}

impl_element! {
    u8 => "uint8",
    i8 => "int8",
    u16 => "uint16",
    i16 => "int16",
    u32 => "uint32",
    i32 => "int32",
    u64 => "uint64",
    i64 => "int64",
    f32 => "fp32",
    f64 => "fp64",
    f16 => "fp16",
    bf16 => "bf16",
}

/// View a typed slice as raw bytes.
pub(crate) fn as_bytes<T: Element>(data: &[T]) -> &[u8] {
    // SAFETY: `Element` types are plain data without padding.
    unsafe { std::slice::from_raw_parts(data.as_ptr().cast(), std::mem::size_of_val(data)) }
}

/// Decode raw bytes into elements. Trailing bytes that do not fill a whole
/// element are ignored.
pub(crate) fn from_bytes<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        // SAFETY: every bit pattern is a valid `Element`; the read is unaligned.
        .map(|chunk| unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<T>()) })
        .collect()
}
