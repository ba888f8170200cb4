//! Backend implementations behind the [`Stream`](crate::Stream) facade.

pub mod driver;
pub mod mixer;

use crate::callback::CallbackBinding;
use crate::device::{Api, ChannelInfo, DeviceInfo};
use crate::error::{Error, Result};
use crate::stream::{StreamInformation, StreamParameters, StreamState};

/// Sample rates probed during negotiation when the caller does not request
/// one, in preference order.
pub(crate) const SAMPLE_RATES: [f64; 12] = [
    48000.0, 44100.0, 88200.0, 96000.0, 176400.0, 192000.0, 352800.0, 384000.0, 8000.0, 11025.0,
    16000.0, 22050.0,
];

/// What every backend model implements for the stream facade.
///
/// The facade owns exactly one backend and forwards each public operation;
/// all state-machine legality checks live behind this trait so the two
/// models can differ where their protocols differ.
pub(crate) trait AudioBackend: Send {
    fn api(&self) -> Api;

    /// Re-enumerates and returns the reconciled device list.
    fn devices(&mut self) -> Result<&[DeviceInfo]>;

    /// Per-channel query. Backends without channel metadata return
    /// [`Error::NoApi`].
    fn channel_info(&mut self, device: usize, channel: usize, input: bool) -> Result<ChannelInfo> {
        let _ = (device, channel, input);
        Err(Error::NoApi)
    }

    fn set_callback(&mut self, binding: CallbackBinding);

    /// Snapshot of the negotiated stream facts.
    fn information(&self) -> StreamInformation;
    fn state(&self) -> StreamState;

    fn open(&mut self, params: &StreamParameters) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    fn set_sample_rate(&mut self, rate: f64) -> Result<()>;

    /// Opens the vendor configuration UI where the protocol has one.
    fn open_control_panel(&mut self) -> Result<()> {
        Err(Error::NoApi)
    }
}
