//! Duplex audio I/O with one stream API over pluggable native backends.
//!
//! A [`Stream`] drives a user callback with non-interleaved, typed channel
//! buffers and hides the differences between two backend models:
//!
//! - [`Api::Driver`] is a singleton low-latency driver protocol. One driver
//!   owns input and output, periods arrive as synchronous double-buffer
//!   switches, and only one stream per process can hold a driver. The crate
//!   ships no system driver host; vendor SDK glue plugs in through
//!   [`Stream::with_driver_host`] and the `notify_*` functions in
//!   [`backend::driver`].
//! - [`Api::Mixer`] is the desktop mixing service. Input and output pick
//!   endpoints independently, the service pins the sample rate, and a worker
//!   thread bridges the device cadence to fixed callback periods through
//!   ring buffers. A Windows implementation is built in.
//!
//! Sample formats convert automatically between the device side and the
//! types the callback is bound with, including byte-order correction for
//! drivers that deliver the opposite endianness.
//!
//! ```no_run
//! use duplexio::{Api, Stream, StreamParameters};
//!
//! fn main() -> duplexio::Result<()> {
//!     let mut stream = Stream::new(Api::Mixer)?;
//!     stream.set_callback::<f32, f32, _>(|input, mut output, info| {
//!         for channel in 0..info.output_channels {
//!             let source = if info.input_channels > 0 {
//!                 input.channel(channel % info.input_channels).to_vec()
//!             } else {
//!                 vec![0.0; info.buffer_size]
//!             };
//!             output.channel_mut(channel).copy_from_slice(&source);
//!         }
//!     })?;
//!     stream.open(StreamParameters::default())?;
//!     stream.start()?;
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     stream.close()
//! }
//! ```

pub mod backend;
mod callback;
mod device;
mod error;
mod format;
mod ring;
mod stream;

pub use callback::{Buffers, BuffersMut, CallbackInfo, ChannelBuffers};
pub use device::{Api, ChannelInfo, DeviceInfo};
pub use error::{Error, Result};
pub use format::{byte_swap, convert, Sample, SampleFormat};
pub use ring::RingBuffer;
pub use stream::{
    DeviceSelector, Stream, StreamInformation, StreamParameters, StreamState,
};
