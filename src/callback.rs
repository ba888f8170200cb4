//! User callback binding and the typed channel views handed to it.
//!
//! A callback is bound with concrete sample types for each direction and
//! stored type-erased behind one dispatch point. The backend learns the
//! bound formats from the binding itself, so format deduction happens at
//! bind time and a mismatched signature is a compile error instead of a
//! runtime failure.

use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::format::{Sample, SampleFormat};

/// Per-period facts passed to the user callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackInfo {
    /// Number of input channels (0 for output-only streams).
    pub input_channels: usize,
    /// Number of output channels (0 for input-only streams).
    pub output_channels: usize,
    /// Frames per channel in this period.
    pub buffer_size: usize,
    /// Negotiated sample rate in Hz.
    pub sample_rate: f64,
}

/// Non-interleaved per-channel sample storage in the user's format.
///
/// Channels are backed by `u64` words so a view at any supported sample
/// width is correctly aligned. The same allocation is reused every period;
/// nothing on the period path allocates.
pub struct ChannelBuffers {
    channels: Vec<Box<[u64]>>,
    bytes_per_channel: usize,
}

impl ChannelBuffers {
    /// A zero-channel placeholder for the missing direction of a
    /// non-duplex stream.
    pub fn empty() -> Self {
        ChannelBuffers { channels: Vec::new(), bytes_per_channel: 0 }
    }

    /// Allocates `channels` buffers of `frames` samples in `format`.
    ///
    /// Allocation failure is reported as [`Error::NoMemory`] instead of
    /// aborting.
    pub fn allocate(channels: usize, frames: usize, format: SampleFormat) -> Result<Self> {
        let bytes_per_channel = frames * format.bytes();
        let words = bytes_per_channel.div_ceil(std::mem::size_of::<u64>());
        let mut storage = Vec::new();
        storage.try_reserve_exact(channels).map_err(|_| Error::NoMemory)?;
        for _ in 0..channels {
            let mut channel = Vec::new();
            channel.try_reserve_exact(words).map_err(|_| Error::NoMemory)?;
            channel.resize(words, 0u64);
            storage.push(channel.into_boxed_slice());
        }
        Ok(ChannelBuffers { channels: storage, bytes_per_channel })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn bytes_per_channel(&self) -> usize {
        self.bytes_per_channel
    }

    /// One channel's samples as raw bytes in the buffer's format.
    pub fn channel_bytes(&self, channel: usize) -> &[u8] {
        &bytemuck::cast_slice(&self.channels[channel])[..self.bytes_per_channel]
    }

    pub fn channel_bytes_mut(&mut self, channel: usize) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.channels[channel])[..self.bytes_per_channel]
    }

    /// Zeroes every channel.
    pub fn silence(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0);
        }
    }
}

/// Read-only typed view over the input channels for one period.
pub struct Buffers<'a, S: Sample> {
    buffers: &'a ChannelBuffers,
    frames: usize,
    _marker: PhantomData<S>,
}

impl<'a, S: Sample> Buffers<'a, S> {
    pub(crate) fn new(buffers: &'a ChannelBuffers, frames: usize) -> Self {
        debug_assert!(
            buffers.channels.is_empty()
                || frames * std::mem::size_of::<S>() <= buffers.bytes_per_channel
        );
        Buffers { buffers, frames, _marker: PhantomData }
    }

    pub fn channels(&self) -> usize {
        self.buffers.channel_count()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Samples of one channel.
    pub fn channel(&self, channel: usize) -> &[S] {
        let bytes = &self.buffers.channel_bytes(channel)[..self.frames * std::mem::size_of::<S>()];
        bytemuck::cast_slice(bytes)
    }
}

/// Mutable typed view over the output channels for one period.
pub struct BuffersMut<'a, S: Sample> {
    buffers: &'a mut ChannelBuffers,
    frames: usize,
    _marker: PhantomData<S>,
}

impl<'a, S: Sample> BuffersMut<'a, S> {
    pub(crate) fn new(buffers: &'a mut ChannelBuffers, frames: usize) -> Self {
        debug_assert!(
            buffers.channels.is_empty()
                || frames * std::mem::size_of::<S>() <= buffers.bytes_per_channel
        );
        BuffersMut { buffers, frames, _marker: PhantomData }
    }

    pub fn channels(&self) -> usize {
        self.buffers.channel_count()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn channel(&self, channel: usize) -> &[S] {
        let bytes = &self.buffers.channel_bytes(channel)[..self.frames * std::mem::size_of::<S>()];
        bytemuck::cast_slice(bytes)
    }

    /// Samples of one channel, writable.
    pub fn channel_mut(&mut self, channel: usize) -> &mut [S] {
        let width = std::mem::size_of::<S>();
        let frames = self.frames;
        let bytes = &mut self.buffers.channel_bytes_mut(channel)[..frames * width];
        bytemuck::cast_slice_mut(bytes)
    }
}

/// Dispatch point a backend drives once per period.
trait ErasedCallback: Send {
    fn call(&mut self, input: &ChannelBuffers, output: &mut ChannelBuffers, info: CallbackInfo);
    fn input_format(&self) -> SampleFormat;
    fn output_format(&self) -> SampleFormat;
}

struct Typed<I, O, F> {
    callback: F,
    _marker: PhantomData<fn(I, O)>,
}

impl<I, O, F> ErasedCallback for Typed<I, O, F>
where
    I: Sample,
    O: Sample,
    F: for<'a> FnMut(Buffers<'a, I>, BuffersMut<'a, O>, CallbackInfo) + Send + 'static,
{
    fn call(&mut self, input: &ChannelBuffers, output: &mut ChannelBuffers, info: CallbackInfo) {
        (self.callback)(
            Buffers::new(input, info.buffer_size),
            BuffersMut::new(output, info.buffer_size),
            info,
        );
    }

    fn input_format(&self) -> SampleFormat {
        I::FORMAT
    }

    fn output_format(&self) -> SampleFormat {
        O::FORMAT
    }
}

/// A type-erased user callback together with the formats it was bound with.
pub struct CallbackBinding {
    inner: Box<dyn ErasedCallback>,
}

impl CallbackBinding {
    /// Erases a typed callback. The sample types become the user-side
    /// formats the backend converts to and from.
    pub fn bind<I, O, F>(callback: F) -> Self
    where
        I: Sample,
        O: Sample,
        F: for<'a> FnMut(Buffers<'a, I>, BuffersMut<'a, O>, CallbackInfo) + Send + 'static,
    {
        CallbackBinding { inner: Box::new(Typed { callback, _marker: PhantomData }) }
    }

    /// Format the callback reads input samples in.
    pub fn input_format(&self) -> SampleFormat {
        self.inner.input_format()
    }

    /// Format the callback writes output samples in.
    pub fn output_format(&self) -> SampleFormat {
        self.inner.output_format()
    }

    /// Runs the callback for one period.
    pub fn call(
        &mut self,
        input: &ChannelBuffers,
        output: &mut ChannelBuffers,
        info: CallbackInfo,
    ) {
        self.inner.call(input, output, info);
    }
}

impl std::fmt::Debug for CallbackBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBinding")
            .field("input_format", &self.input_format())
            .field("output_format", &self.output_format())
            .finish()
    }
}
