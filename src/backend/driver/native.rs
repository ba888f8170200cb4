//! Opaque surface of a vendor low-latency driver SDK.
//!
//! The driver protocol is modeled as two traits: a [`DriverHost`] that can
//! list and load drivers (loading is exclusive, one driver at a time per
//! process) and a [`DriverSession`] for the loaded driver. The crate ships
//! no system implementation; vendor SDK glue implements these traits and the
//! backend does the rest. Sessions unload their driver on drop.

use thiserror::Error;

use crate::device::ChannelInfo;
use crate::format::SampleFormat;

/// Outcome of a failed driver call, with the canonical diagnostic message
/// for each condition. Backends map these onto the public error taxonomy
/// and log the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("hardware input or output is not present or available")]
    NotPresent,
    #[error("hardware is malfunctioning")]
    HardwareMalfunction,
    #[error("input parameter invalid")]
    InvalidParameter,
    #[error("hardware is in a bad mode or used in a bad mode")]
    InvalidMode,
    #[error("sample clock or rate cannot be determined or is not present")]
    NoClock,
    #[error("not enough memory for completing the request")]
    NoMemory,
    #[error("driver rejected the request")]
    Rejected,
}

/// Sample representation reported by a driver, including byte orders and
/// widths the conversion engine does not handle. Big-endian reports map to
/// the swapped formats; 24-bit reports have no mapping and fail format
/// negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFormat {
    I8,
    I16,
    I24,
    I32,
    F32,
    F64,
    I16Be,
    I24Be,
    I32Be,
    F32Be,
    F64Be,
}

impl DriverFormat {
    /// The conversion-engine format for this report, or `None` when the
    /// width is unsupported.
    pub fn to_sample_format(self) -> Option<SampleFormat> {
        match self {
            DriverFormat::I8 => Some(SampleFormat::I8),
            DriverFormat::I16 => Some(SampleFormat::I16),
            DriverFormat::I32 => Some(SampleFormat::I32),
            DriverFormat::F32 => Some(SampleFormat::F32),
            DriverFormat::F64 => Some(SampleFormat::F64),
            DriverFormat::I16Be => Some(SampleFormat::I16Swapped),
            DriverFormat::I32Be => Some(SampleFormat::I32Swapped),
            DriverFormat::F32Be => Some(SampleFormat::F32Swapped),
            DriverFormat::F64Be => Some(SampleFormat::F64Swapped),
            DriverFormat::I24 | DriverFormat::I24Be => None,
        }
    }
}

/// Entry point into a vendor driver registry.
pub trait DriverHost: Send {
    /// Names of the installed drivers, in registry order. Index positions
    /// are the device ids used everywhere else.
    fn driver_names(&mut self) -> Result<Vec<String>, DriverError>;

    /// Loads and initializes one driver. At most one session exists at a
    /// time; the host may refuse a second load.
    fn load(&mut self, index: usize) -> Result<Box<dyn DriverSession>, DriverError>;
}

/// A loaded driver. Dropping the session unloads it.
pub trait DriverSession: Send {
    /// `(input, output)` channel counts.
    fn channel_counts(&mut self) -> Result<(usize, usize), DriverError>;

    fn channel_info(&mut self, channel: usize, input: bool) -> Result<ChannelInfo, DriverError>;

    fn can_sample_rate(&mut self, rate: f64) -> bool;

    fn sample_rate(&mut self) -> Result<f64, DriverError>;

    fn set_sample_rate(&mut self, rate: f64) -> Result<(), DriverError>;

    /// Sample representation for one direction. The whole direction shares
    /// one format.
    fn sample_format(&mut self, input: bool) -> Result<DriverFormat, DriverError>;

    /// The driver's preferred period length in frames.
    fn preferred_buffer_size(&mut self) -> Result<usize, DriverError>;

    /// Allocates the driver-owned double buffers for every channel.
    fn create_buffers(
        &mut self,
        input_channels: usize,
        output_channels: usize,
        buffer_size: usize,
    ) -> Result<(), DriverError>;

    fn dispose_buffers(&mut self);

    /// One half of a channel's double buffer, in the driver's format and
    /// byte order. `half` is the index handed to the buffer-switch
    /// notification (0 or 1).
    fn hardware_buffer(&mut self, channel: usize, input: bool, half: usize) -> &mut [u8];

    fn start(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self) -> Result<(), DriverError>;

    /// Tells the driver the output halves are filled for this period.
    fn output_ready(&mut self);

    /// Opens the vendor configuration UI.
    fn open_control_panel(&mut self) -> Result<(), DriverError>;
}
