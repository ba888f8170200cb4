//! The stream facade: one object, one settings struct, two backend models.

use serde::{Deserialize, Serialize};

use crate::backend::driver::{native::DriverHost, DriverBackend};
use crate::backend::mixer::{native::MixerHost, MixerBackend};
use crate::backend::AudioBackend;
use crate::callback::{Buffers, BuffersMut, CallbackBinding, CallbackInfo};
use crate::device::{Api, ChannelInfo, DeviceInfo};
use crate::error::{Error, Result};
use crate::format::{Sample, SampleFormat};

/// How a stream direction picks its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelector {
    /// Use the backend's default device for this direction.
    Default,
    /// Leave this direction unused.
    NoDevice,
    /// A specific device id from the current device list.
    Id(usize),
}

/// What the caller asks for at [`Stream::open`]. Negotiation may settle on
/// different values; [`Stream::information`] reports what was granted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamParameters {
    pub input: DeviceSelector,
    pub output: DeviceSelector,
    /// Frames per period. `None` lets the backend pick (the driver's
    /// preferred size, or the mixing backend's default of 256).
    pub buffer_size: Option<usize>,
    /// Requested rate in Hz. `None` lets the backend negotiate one.
    pub sample_rate: Option<f64>,
    /// When the granted rate differs from the request: `true` accepts the
    /// device rate, `false` turns the mismatch into an error. No resampling
    /// is performed either way.
    pub resampling: bool,
}

impl Default for StreamParameters {
    fn default() -> Self {
        StreamParameters {
            input: DeviceSelector::Default,
            output: DeviceSelector::Default,
            buffer_size: None,
            sample_rate: None,
            resampling: true,
        }
    }
}

/// Lifecycle position of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No devices held. The state after construction and after `close`.
    #[default]
    Closed,
    /// Devices held and negotiated, callback not being driven.
    Opened,
    /// Callback being driven by the backend.
    Running,
}

/// Facts negotiated at `open`, as granted by the backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamInformation {
    pub state: StreamState,
    /// Device id per direction; `None` when the direction is unused.
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Granted frames per period.
    pub buffer_size: usize,
    /// Granted rate in Hz.
    pub sample_rate: f64,
    /// Device-side formats; `None` when the direction is unused.
    pub input_format: Option<SampleFormat>,
    pub output_format: Option<SampleFormat>,
}

/// A duplex audio stream over one backend.
///
/// Construction binds a backend model; every later operation forwards to
/// it. Dropping a stream closes it.
pub struct Stream {
    backend: Option<Box<dyn AudioBackend>>,
}

impl Stream {
    /// A stream with no backend. Every operation fails with
    /// [`Error::NoApi`] until [`bind`](Stream::bind) succeeds.
    pub fn unbound() -> Self {
        Stream { backend: None }
    }

    /// A stream over the platform's backend for `api`.
    ///
    /// The mixing service is available on Windows; the driver protocol has
    /// no built-in host (plug vendor SDK glue in through
    /// [`with_driver_host`](Stream::with_driver_host)). Everything else
    /// fails with [`Error::NoApi`].
    pub fn new(api: Api) -> Result<Self> {
        let mut stream = Stream::unbound();
        stream.bind(api)?;
        Ok(stream)
    }

    /// A stream over a caller-provided driver host.
    pub fn with_driver_host(host: Box<dyn DriverHost>) -> Self {
        Stream { backend: Some(Box::new(DriverBackend::new(host))) }
    }

    /// A stream over a caller-provided mixer host.
    pub fn with_mixer_host(host: Box<dyn MixerHost>) -> Self {
        Stream { backend: Some(Box::new(MixerBackend::new(host))) }
    }

    /// Binds the platform backend for `api` to an unbound stream.
    pub fn bind(&mut self, api: Api) -> Result<()> {
        if self.backend.is_some() {
            return Err(Error::AlreadyOpen);
        }
        self.backend = Some(platform_backend(api)?);
        Ok(())
    }

    fn backend(&mut self) -> Result<&mut Box<dyn AudioBackend>> {
        self.backend.as_mut().ok_or(Error::NoApi)
    }

    /// The bound backend model, if any.
    pub fn api(&self) -> Option<Api> {
        self.backend.as_ref().map(|b| b.api())
    }

    /// Re-enumerates and returns the device list. Entries keep their list
    /// position across calls while the device stays present.
    pub fn devices(&mut self) -> Result<&[DeviceInfo]> {
        self.backend()?.devices()
    }

    /// One device by id from a fresh enumeration.
    pub fn device(&mut self, id: usize) -> Result<DeviceInfo> {
        self.backend()?
            .devices()?
            .iter()
            .find(|device| device.id == id)
            .cloned()
            .ok_or(Error::NotPresent)
    }

    pub fn device_count(&mut self) -> Result<usize> {
        Ok(self.backend()?.devices()?.len())
    }

    /// Per-channel metadata, where the backend has it (driver protocol
    /// only).
    pub fn channel_info(
        &mut self,
        device: usize,
        channel: usize,
        input: bool,
    ) -> Result<ChannelInfo> {
        self.backend()?.channel_info(device, channel, input)
    }

    /// Binds the user callback. The sample types `I` and `O` decide the
    /// formats the stream converts to and from; they may differ per
    /// direction. Rebinding requires a closed stream.
    pub fn set_callback<I, O, F>(&mut self, callback: F) -> Result<()>
    where
        I: Sample,
        O: Sample,
        F: for<'a> FnMut(Buffers<'a, I>, BuffersMut<'a, O>, CallbackInfo) + Send + 'static,
    {
        let backend = self.backend()?;
        if backend.state() != StreamState::Closed {
            return Err(Error::AlreadyOpen);
        }
        backend.set_callback(CallbackBinding::bind::<I, O, F>(callback));
        Ok(())
    }

    /// Snapshot of the negotiated stream facts. Defaults when nothing is
    /// open.
    pub fn information(&self) -> StreamInformation {
        match &self.backend {
            Some(backend) => backend.information(),
            None => StreamInformation::default(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.backend.as_ref().map(|b| b.state()).unwrap_or_default()
    }

    /// Acquires devices and negotiates rate, formats, channel counts and
    /// buffer size. Fails without changing state; succeeds into
    /// [`StreamState::Opened`].
    pub fn open(&mut self, parameters: StreamParameters) -> Result<()> {
        self.backend()?.open(&parameters)
    }

    /// Starts driving the callback.
    pub fn start(&mut self) -> Result<()> {
        self.backend()?.start()
    }

    /// Stops driving the callback, keeping the devices held for a restart.
    pub fn stop(&mut self) -> Result<()> {
        self.backend()?.stop()
    }

    /// Releases the devices. The bound callback survives for a reopen.
    pub fn close(&mut self) -> Result<()> {
        self.backend()?.close()
    }

    /// Asks the open device to change its rate.
    pub fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        self.backend()?.set_sample_rate(rate)
    }

    /// Opens the vendor configuration UI where the backend has one.
    pub fn open_control_panel(&mut self) -> Result<()> {
        self.backend()?.open_control_panel()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(backend) = &mut self.backend {
            let _ = backend.close();
        }
    }
}

#[cfg(windows)]
fn platform_backend(api: Api) -> Result<Box<dyn AudioBackend>> {
    match api {
        Api::Mixer => {
            let host = crate::backend::mixer::windows::WindowsMixerHost::new();
            Ok(Box::new(MixerBackend::new(Box::new(host))))
        }
        Api::Driver => Err(Error::NoApi),
    }
}

#[cfg(not(windows))]
fn platform_backend(_api: Api) -> Result<Box<dyn AudioBackend>> {
    Err(Error::NoApi)
}
