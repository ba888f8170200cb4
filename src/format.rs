//! Sample formats and the raw-buffer conversion engine.
//!
//! Buffers crossing the native boundary are plain byte slices tagged with a
//! [`SampleFormat`]. The conversion engine rewrites them one sample at a time
//! between any two supported linear PCM representations, and can swap byte
//! order in place for formats delivered in the opposite endianness.

use serde::{Deserialize, Serialize};

/// A linear PCM sample representation.
///
/// The `*Swapped` variants mark device formats delivered in the opposite byte
/// order from the host; they must be passed through [`byte_swap`] before (or
/// after) conversion. 8-bit samples have no byte order. 24-bit formats are
/// deliberately absent: devices reporting them are rejected during
/// negotiation with [`Error::UnsupportedSampleFormat`](crate::Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer, host byte order.
    I16,
    /// 32-bit signed integer, host byte order.
    I32,
    /// 32-bit float, host byte order.
    F32,
    /// 64-bit float, host byte order.
    F64,
    /// 16-bit signed integer, opposite byte order.
    I16Swapped,
    /// 32-bit signed integer, opposite byte order.
    I32Swapped,
    /// 32-bit float, opposite byte order.
    F32Swapped,
    /// 64-bit float, opposite byte order.
    F64Swapped,
}

impl SampleFormat {
    /// Width of one sample in bytes.
    pub fn bytes(self) -> usize {
        match self {
            SampleFormat::I8 => 1,
            SampleFormat::I16 | SampleFormat::I16Swapped => 2,
            SampleFormat::I32
            | SampleFormat::F32
            | SampleFormat::I32Swapped
            | SampleFormat::F32Swapped => 4,
            SampleFormat::F64 | SampleFormat::F64Swapped => 8,
        }
    }

    /// Whether the representation is floating point.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            SampleFormat::F32
                | SampleFormat::F64
                | SampleFormat::F32Swapped
                | SampleFormat::F64Swapped
        )
    }

    /// Whether samples arrive in the opposite byte order from the host.
    pub fn needs_swap(self) -> bool {
        matches!(
            self,
            SampleFormat::I16Swapped
                | SampleFormat::I32Swapped
                | SampleFormat::F32Swapped
                | SampleFormat::F64Swapped
        )
    }

    /// The host-byte-order equivalent of this format.
    pub fn base(self) -> SampleFormat {
        match self {
            SampleFormat::I16Swapped => SampleFormat::I16,
            SampleFormat::I32Swapped => SampleFormat::I32,
            SampleFormat::F32Swapped => SampleFormat::F32,
            SampleFormat::F64Swapped => SampleFormat::F64,
            other => other,
        }
    }

    /// The opposite-byte-order equivalent of this format (identity for 8-bit).
    pub fn swapped(self) -> SampleFormat {
        match self {
            SampleFormat::I16 => SampleFormat::I16Swapped,
            SampleFormat::I32 => SampleFormat::I32Swapped,
            SampleFormat::F32 => SampleFormat::F32Swapped,
            SampleFormat::F64 => SampleFormat::F64Swapped,
            other => other,
        }
    }
}

/// Sample types a user callback may be bound with.
///
/// Implemented for `i8`, `i16`, `i32`, `f32` and `f64`; the associated
/// constant is how the bound callback reports its formats to the backend
/// during negotiation.
pub trait Sample: bytemuck::Pod + Default + Send + 'static {
    /// The wire format corresponding to this type.
    const FORMAT: SampleFormat;
}

impl Sample for i8 {
    const FORMAT: SampleFormat = SampleFormat::I8;
}
impl Sample for i16 {
    const FORMAT: SampleFormat = SampleFormat::I16;
}
impl Sample for i32 {
    const FORMAT: SampleFormat = SampleFormat::I32;
}
impl Sample for f32 {
    const FORMAT: SampleFormat = SampleFormat::F32;
}
impl Sample for f64 {
    const FORMAT: SampleFormat = SampleFormat::F64;
}

/// Raw load/store of one sample in host byte order.
trait Pcm: Copy {
    const BYTES: usize;
    fn load(bytes: &[u8]) -> Self;
    fn store(self, bytes: &mut [u8]);
}

macro_rules! impl_pcm {
    ($($ty:ty),*) => {$(
        impl Pcm for $ty {
            const BYTES: usize = std::mem::size_of::<$ty>();

            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; Self::BYTES];
                raw.copy_from_slice(&bytes[..Self::BYTES]);
                <$ty>::from_ne_bytes(raw)
            }

            fn store(self, bytes: &mut [u8]) {
                bytes[..Self::BYTES].copy_from_slice(&self.to_ne_bytes());
            }
        }
    )*};
}

impl_pcm!(i8, i16, i32, f32, f64);

/// Per-sample value conversion between two representations.
trait ConvertFrom<T> {
    fn convert_from(value: T) -> Self;
}

// Integer to integer: widening shifts left by the byte-count delta,
// narrowing is a plain cast with no rescale.
macro_rules! int_to_int {
    ($($src:ty => $dst:ty),* $(,)?) => {$(
        impl ConvertFrom<$src> for $dst {
            fn convert_from(value: $src) -> $dst {
                let out = value as $dst;
                let widen =
                    std::mem::size_of::<$dst>().saturating_sub(std::mem::size_of::<$src>());
                if widen > 0 { out << widen } else { out }
            }
        }
    )*};
}

// Integer to float: normalize by the source type's maximum.
macro_rules! int_to_float {
    ($($src:ty => $dst:ty),* $(,)?) => {$(
        impl ConvertFrom<$src> for $dst {
            fn convert_from(value: $src) -> $dst {
                value as $dst / <$src>::MAX as $dst
            }
        }
    )*};
}

// Float to integer: scale by the destination type's maximum.
macro_rules! float_to_int {
    ($($src:ty => $dst:ty),* $(,)?) => {$(
        impl ConvertFrom<$src> for $dst {
            fn convert_from(value: $src) -> $dst {
                (value * <$dst>::MAX as $src) as $dst
            }
        }
    )*};
}

macro_rules! float_to_float {
    ($($src:ty => $dst:ty),* $(,)?) => {$(
        impl ConvertFrom<$src> for $dst {
            fn convert_from(value: $src) -> $dst {
                value as $dst
            }
        }
    )*};
}

int_to_int!(i8 => i16, i8 => i32, i16 => i8, i16 => i32, i32 => i8, i32 => i16);
int_to_float!(i8 => f32, i8 => f64, i16 => f32, i16 => f64, i32 => f32, i32 => f64);
float_to_int!(f32 => i8, f32 => i16, f32 => i32, f64 => i8, f64 => i16, f64 => i32);
float_to_float!(f32 => f64, f64 => f32);

fn convert_samples<I, O>(dst: &mut [u8], src: &[u8], samples: usize)
where
    I: Pcm,
    O: Pcm + ConvertFrom<I>,
{
    for i in 0..samples {
        let value = I::load(&src[i * I::BYTES..]);
        O::convert_from(value).store(&mut dst[i * O::BYTES..]);
    }
}

/// Convert `samples` samples from `src` (read as `src_format`) into `dst`
/// (written as `dst_format`).
///
/// Both formats are treated as host byte order; swapped device formats must
/// go through [`byte_swap`] first. A pair with no conversion rule (same
/// representation on both sides) is copied through verbatim.
pub fn convert(
    dst: &mut [u8],
    src: &[u8],
    samples: usize,
    dst_format: SampleFormat,
    src_format: SampleFormat,
) {
    use SampleFormat::*;
    match (src_format.base(), dst_format.base()) {
        (I8, I16) => convert_samples::<i8, i16>(dst, src, samples),
        (I8, I32) => convert_samples::<i8, i32>(dst, src, samples),
        (I8, F32) => convert_samples::<i8, f32>(dst, src, samples),
        (I8, F64) => convert_samples::<i8, f64>(dst, src, samples),
        (I16, I8) => convert_samples::<i16, i8>(dst, src, samples),
        (I16, I32) => convert_samples::<i16, i32>(dst, src, samples),
        (I16, F32) => convert_samples::<i16, f32>(dst, src, samples),
        (I16, F64) => convert_samples::<i16, f64>(dst, src, samples),
        (I32, I8) => convert_samples::<i32, i8>(dst, src, samples),
        (I32, I16) => convert_samples::<i32, i16>(dst, src, samples),
        (I32, F32) => convert_samples::<i32, f32>(dst, src, samples),
        (I32, F64) => convert_samples::<i32, f64>(dst, src, samples),
        (F32, I8) => convert_samples::<f32, i8>(dst, src, samples),
        (F32, I16) => convert_samples::<f32, i16>(dst, src, samples),
        (F32, I32) => convert_samples::<f32, i32>(dst, src, samples),
        (F32, F64) => convert_samples::<f32, f64>(dst, src, samples),
        (F64, I8) => convert_samples::<f64, i8>(dst, src, samples),
        (F64, I16) => convert_samples::<f64, i16>(dst, src, samples),
        (F64, I32) => convert_samples::<f64, i32>(dst, src, samples),
        (F64, F32) => convert_samples::<f64, f32>(dst, src, samples),
        _ => {
            let bytes = samples * src_format.bytes();
            dst[..bytes].copy_from_slice(&src[..bytes]);
        }
    }
}

/// Swap the byte order of `samples` samples in place.
///
/// Each width is handled with its own explicit swap sequence; 8-bit formats
/// are a no-op.
pub fn byte_swap(buffer: &mut [u8], samples: usize, format: SampleFormat) {
    match format.bytes() {
        2 => {
            for sample in buffer[..samples * 2].chunks_exact_mut(2) {
                sample.swap(0, 1);
            }
        }
        4 => {
            for sample in buffer[..samples * 4].chunks_exact_mut(4) {
                sample.swap(0, 3);
                sample.swap(1, 2);
            }
        }
        8 => {
            for sample in buffer[..samples * 8].chunks_exact_mut(8) {
                sample.swap(0, 7);
                sample.swap(1, 6);
                sample.swap(2, 5);
                sample.swap(3, 4);
            }
        }
        _ => {}
    }
}
