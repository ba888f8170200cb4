//! Backend for the singleton low-latency driver protocol.
//!
//! One driver owns both directions of a stream and only one stream per
//! process can hold a driver. The driver calls back into the process over a
//! side channel with no stream context, so the open stream's engine sits in
//! a process-wide registry and the [`notify_buffer_switch`],
//! [`notify_sample_rate_change`] and [`notify_driver_message`] free
//! functions forward into it. Vendor SDK glue wires the driver's static
//! callbacks to those functions.

pub mod native;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::backend::{AudioBackend, SAMPLE_RATES};
use crate::callback::{CallbackBinding, CallbackInfo, ChannelBuffers};
use crate::device::{merge_device_list, Api, ChannelInfo, DeviceInfo};
use crate::error::{Error, Result};
use crate::format::{byte_swap, convert, SampleFormat};
use crate::stream::{DeviceSelector, StreamInformation, StreamParameters, StreamState};

use native::{DriverError, DriverHost, DriverSession};

/// Side-channel messages a driver can raise between periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverNotification {
    /// The driver changed its period length; user buffers are reallocated
    /// to match.
    BufferSizeChanged(usize),
    /// The driver wants the stream torn down and reopened. The stream is
    /// parked as opened-but-not-running until the owner restarts or closes
    /// it.
    ResetRequest,
    /// The driver lost sync and replayed or dropped a period.
    ResyncRequest,
    /// Input/output latencies changed.
    LatenciesChanged,
}

/// The one engine the driver's static callbacks can reach.
static ACTIVE: Mutex<Option<Arc<Mutex<DriverEngine>>>> = Mutex::new(None);

fn registry() -> MutexGuard<'static, Option<Arc<Mutex<DriverEngine>>>> {
    ACTIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn active_engine() -> Option<Arc<Mutex<DriverEngine>>> {
    registry().clone()
}

fn lock_engine(engine: &Arc<Mutex<DriverEngine>>) -> MutexGuard<'_, DriverEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives one period for the open stream. Vendor glue calls this from the
/// driver's buffer-switch callback with the half index the driver handed
/// over. A no-op when no stream is open or running.
pub fn notify_buffer_switch(half: usize) {
    if let Some(engine) = active_engine() {
        lock_engine(&engine).run_period(half);
    }
}

/// Folds a driver-initiated rate change into the open stream's negotiated
/// record.
pub fn notify_sample_rate_change(rate: f64) {
    if let Some(engine) = active_engine() {
        debug!(rate, "driver changed the sample rate");
        lock_engine(&engine).info.sample_rate = rate;
    }
}

/// Handles a driver side-channel message for the open stream.
pub fn notify_driver_message(message: DriverNotification) {
    let Some(engine) = active_engine() else { return };
    let mut engine = lock_engine(&engine);
    match message {
        DriverNotification::BufferSizeChanged(frames) => {
            debug!(frames, "driver changed the buffer size");
            if let Err(error) = engine.reallocate(frames) {
                error!(%error, "failed to reallocate user buffers");
            }
        }
        DriverNotification::ResetRequest => {
            warn!("driver requested a reset");
            if engine.phase == Phase::Running {
                let _ = engine.session.stop();
            }
            engine.phase = Phase::Reset;
            engine.info.state = StreamState::Opened;
        }
        DriverNotification::ResyncRequest => debug!("driver requested a resync"),
        DriverNotification::LatenciesChanged => debug!("driver latencies changed"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepared,
    Running,
    /// Parked after a reset request. Counts as opened-but-not-running.
    Reset,
}

/// Everything the period pipeline and the notification path touch.
struct DriverEngine {
    session: Box<dyn DriverSession>,
    callback: Option<CallbackBinding>,
    info: StreamInformation,
    input_user: ChannelBuffers,
    output_user: ChannelBuffers,
    device_input_format: SampleFormat,
    device_output_format: SampleFormat,
    user_input_format: SampleFormat,
    user_output_format: SampleFormat,
    phase: Phase,
}

impl DriverEngine {
    /// Byte-swaps and converts one period of hardware input into the user
    /// buffers, runs the callback, and converts the user output back into
    /// the hardware halves.
    fn run_period(&mut self, half: usize) {
        if self.phase != Phase::Running {
            return;
        }
        let DriverEngine {
            session,
            callback,
            info,
            input_user,
            output_user,
            device_input_format,
            device_output_format,
            user_input_format,
            user_output_format,
            ..
        } = self;
        let frames = info.buffer_size;

        for channel in 0..info.input_channels {
            let hardware = session.hardware_buffer(channel, true, half);
            if device_input_format.needs_swap() {
                byte_swap(hardware, frames, *device_input_format);
            }
            convert(
                input_user.channel_bytes_mut(channel),
                hardware,
                frames,
                *user_input_format,
                device_input_format.base(),
            );
        }

        if let Some(callback) = callback {
            callback.call(
                input_user,
                output_user,
                CallbackInfo {
                    input_channels: info.input_channels,
                    output_channels: info.output_channels,
                    buffer_size: frames,
                    sample_rate: info.sample_rate,
                },
            );
        }

        for channel in 0..info.output_channels {
            let hardware = session.hardware_buffer(channel, false, half);
            convert(
                hardware,
                output_user.channel_bytes(channel),
                frames,
                device_output_format.base(),
                *user_output_format,
            );
            if device_output_format.needs_swap() {
                byte_swap(hardware, frames, *device_output_format);
            }
        }

        session.output_ready();
    }

    fn reallocate(&mut self, frames: usize) -> Result<()> {
        self.input_user =
            ChannelBuffers::allocate(self.info.input_channels, frames, self.user_input_format)?;
        self.output_user =
            ChannelBuffers::allocate(self.info.output_channels, frames, self.user_output_format)?;
        self.info.buffer_size = frames;
        Ok(())
    }
}

/// Stream backend over a [`DriverHost`].
pub(crate) struct DriverBackend {
    host: Box<dyn DriverHost>,
    devices: Vec<DeviceInfo>,
    callback: Option<CallbackBinding>,
    engine: Option<Arc<Mutex<DriverEngine>>>,
    open_device: Option<usize>,
}

impl DriverBackend {
    pub(crate) fn new(host: Box<dyn DriverHost>) -> Self {
        DriverBackend {
            host,
            devices: Vec::new(),
            callback: None,
            engine: None,
            open_device: None,
        }
    }

    /// Loads each installed driver in turn to query its capabilities.
    /// Only possible while no driver is held open.
    fn probe_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        let names = self.host.driver_names().map_err(|error| {
            error!(%error, "driver enumeration failed");
            Error::Fail
        })?;
        let mut probed = Vec::new();
        for (id, name) in names.into_iter().enumerate() {
            let mut session = match self.host.load(id) {
                Ok(session) => session,
                Err(error) => {
                    warn!(driver = %name, %error, "skipping driver that failed to load");
                    continue;
                }
            };
            let (input_channels, output_channels) = match session.channel_counts() {
                Ok(counts) => counts,
                Err(error) => {
                    warn!(driver = %name, %error, "skipping driver that failed a channel query");
                    continue;
                }
            };
            let sample_rates = SAMPLE_RATES
                .iter()
                .copied()
                .filter(|rate| session.can_sample_rate(*rate))
                .collect();
            probed.push(DeviceInfo {
                id,
                name,
                input_channels,
                output_channels,
                sample_rates,
                default_device: id == 0,
                api: Api::Driver,
            });
        }
        Ok(probed)
    }
}

fn resolve_selector(selector: DeviceSelector, devices: &[DeviceInfo]) -> Result<usize> {
    match selector {
        DeviceSelector::Default => {
            devices.iter().find(|d| d.default_device).map(|d| d.id).ok_or(Error::NotPresent)
        }
        DeviceSelector::Id(id) if devices.iter().any(|d| d.id == id) => Ok(id),
        _ => Err(Error::NotPresent),
    }
}

fn map_load_error(error: DriverError) -> Error {
    error!(%error, "driver load failed");
    match error {
        DriverError::HardwareMalfunction => Error::Fail,
        _ => Error::NotPresent,
    }
}

fn map_rate_error(error: DriverError) -> Error {
    error!(%error, "driver rejected the sample rate");
    match error {
        DriverError::InvalidMode | DriverError::NoClock => Error::InvalidSampleRate,
        _ => Error::NotPresent,
    }
}

impl AudioBackend for DriverBackend {
    fn api(&self) -> Api {
        Api::Driver
    }

    fn devices(&mut self) -> Result<&[DeviceInfo]> {
        // Loading a driver for a query is impossible while one is held
        // open; serve the cached list until close.
        if self.engine.is_none() {
            let probed = self.probe_devices()?;
            merge_device_list(&mut self.devices, probed);
        }
        Ok(&self.devices)
    }

    fn channel_info(&mut self, device: usize, channel: usize, input: bool) -> Result<ChannelInfo> {
        if let Some(engine) = &self.engine {
            if self.open_device != Some(device) {
                return Err(Error::Fail);
            }
            return lock_engine(engine).session.channel_info(channel, input).map_err(|error| {
                error!(%error, channel, "channel query failed");
                Error::Fail
            });
        }
        let mut session = self.host.load(device).map_err(map_load_error)?;
        session.channel_info(channel, input).map_err(|error| {
            error!(%error, channel, "channel query failed");
            Error::Fail
        })
    }

    fn set_callback(&mut self, binding: CallbackBinding) {
        self.callback = Some(binding);
    }

    fn information(&self) -> StreamInformation {
        match &self.engine {
            Some(engine) => lock_engine(engine).info.clone(),
            None => StreamInformation::default(),
        }
    }

    fn state(&self) -> StreamState {
        match &self.engine {
            Some(engine) => match lock_engine(engine).phase {
                Phase::Running => StreamState::Running,
                Phase::Prepared | Phase::Reset => StreamState::Opened,
            },
            None => StreamState::Closed,
        }
    }

    fn open(&mut self, params: &StreamParameters) -> Result<()> {
        if self.engine.is_some() || registry().is_some() {
            return Err(Error::AlreadyOpen);
        }
        let (user_input_format, user_output_format) = match &self.callback {
            Some(callback) => (callback.input_format(), callback.output_format()),
            None => return Err(Error::NoCallback),
        };

        self.devices()?;
        let input_used = params.input != DeviceSelector::NoDevice;
        let output_used = params.output != DeviceSelector::NoDevice;
        // Both directions live on the same driver, so the selectors must
        // agree; a one-sided stream mirrors the used side.
        let device = match (input_used, output_used) {
            (false, false) => return Err(Error::NotPresent),
            (true, false) => resolve_selector(params.input, &self.devices)?,
            (false, true) => resolve_selector(params.output, &self.devices)?,
            (true, true) => {
                let input = resolve_selector(params.input, &self.devices)?;
                let output = resolve_selector(params.output, &self.devices)?;
                if input != output {
                    return Err(Error::InvalidDuplex);
                }
                input
            }
        };

        let mut session = self.host.load(device).map_err(map_load_error)?;
        let (device_inputs, device_outputs) = session.channel_counts().map_err(|error| {
            error!(%error, "channel query failed during open");
            Error::NotPresent
        })?;
        let input_channels = if input_used { device_inputs } else { 0 };
        let output_channels = if output_used { device_outputs } else { 0 };

        let sample_rate = match params.sample_rate {
            Some(rate) if session.can_sample_rate(rate) => rate,
            Some(rate) => {
                if !params.resampling {
                    return Err(Error::InvalidSampleRate);
                }
                let current = session.sample_rate().map_err(map_rate_error)?;
                warn!(requested = rate, granted = current, "requested rate unavailable");
                current
            }
            None => SAMPLE_RATES
                .iter()
                .copied()
                .find(|rate| session.can_sample_rate(*rate))
                .ok_or(Error::InvalidSampleRate)?,
        };
        session.set_sample_rate(sample_rate).map_err(map_rate_error)?;

        let input_format = if input_channels > 0 {
            let reported = session.sample_format(true).map_err(map_load_error)?;
            Some(reported.to_sample_format().ok_or(Error::UnsupportedSampleFormat)?)
        } else {
            None
        };
        let output_format = if output_channels > 0 {
            let reported = session.sample_format(false).map_err(map_load_error)?;
            Some(reported.to_sample_format().ok_or(Error::UnsupportedSampleFormat)?)
        } else {
            None
        };

        let buffer_size = match params.buffer_size {
            Some(size) => size,
            None => session.preferred_buffer_size().map_err(map_load_error)?,
        };
        session.create_buffers(input_channels, output_channels, buffer_size).map_err(|error| {
            error!(%error, buffer_size, "buffer creation failed");
            match error {
                DriverError::NoMemory => Error::NoMemory,
                DriverError::InvalidMode | DriverError::InvalidParameter => {
                    Error::InvalidBufferSize
                }
                _ => Error::NotPresent,
            }
        })?;

        let input_user = match ChannelBuffers::allocate(input_channels, buffer_size, user_input_format)
        {
            Ok(buffers) => buffers,
            Err(error) => {
                session.dispose_buffers();
                return Err(error);
            }
        };
        let output_user =
            match ChannelBuffers::allocate(output_channels, buffer_size, user_output_format) {
                Ok(buffers) => buffers,
                Err(error) => {
                    session.dispose_buffers();
                    return Err(error);
                }
            };

        let mut active = registry();
        if active.is_some() {
            session.dispose_buffers();
            return Err(Error::AlreadyOpen);
        }
        let callback = self.callback.take().ok_or(Error::NoCallback)?;
        let engine = Arc::new(Mutex::new(DriverEngine {
            session,
            callback: Some(callback),
            info: StreamInformation {
                state: StreamState::Opened,
                input_device: input_used.then_some(device),
                output_device: output_used.then_some(device),
                input_channels,
                output_channels,
                buffer_size,
                sample_rate,
                input_format,
                output_format,
            },
            input_user,
            output_user,
            device_input_format: input_format.unwrap_or(SampleFormat::F32),
            device_output_format: output_format.unwrap_or(SampleFormat::F32),
            user_input_format,
            user_output_format,
            phase: Phase::Prepared,
        }));
        *active = Some(engine.clone());
        drop(active);
        self.engine = Some(engine);
        self.open_device = Some(device);
        debug!(device, sample_rate, buffer_size, "driver stream opened");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::NotOpen)?;
        let mut engine = lock_engine(engine);
        if engine.phase == Phase::Running {
            return Err(Error::AlreadyRunning);
        }
        engine.session.start().map_err(|error| {
            error!(%error, "driver start failed");
            match error {
                DriverError::HardwareMalfunction => Error::Fail,
                _ => Error::NotPresent,
            }
        })?;
        engine.phase = Phase::Running;
        engine.info.state = StreamState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::NotOpen)?;
        let mut engine = lock_engine(engine);
        if engine.phase != Phase::Running {
            return Err(Error::NotRunning);
        }
        let result = engine.session.stop();
        engine.phase = Phase::Prepared;
        engine.info.state = StreamState::Opened;
        result.map_err(|error| {
            error!(%error, "driver stop failed");
            Error::Fail
        })
    }

    fn close(&mut self) -> Result<()> {
        let engine = self.engine.take().ok_or(Error::NotOpen)?;
        self.open_device = None;
        *registry() = None;
        let mut engine = lock_engine(&engine);
        if engine.phase == Phase::Running {
            let _ = engine.session.stop();
        }
        engine.session.dispose_buffers();
        // The binding survives close so the stream can be reopened
        // without rebinding.
        self.callback = engine.callback.take();
        drop(engine);
        debug!("driver stream closed");
        Ok(())
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::NotOpen)?;
        let mut engine = lock_engine(engine);
        engine.session.set_sample_rate(rate).map_err(map_rate_error)?;
        engine.info.sample_rate = rate;
        Ok(())
    }

    fn open_control_panel(&mut self) -> Result<()> {
        let engine = self.engine.as_ref().ok_or(Error::NotOpen)?;
        lock_engine(engine).session.open_control_panel().map_err(|error| {
            error!(%error, "control panel failed to open");
            Error::Fail
        })
    }
}

impl Drop for DriverBackend {
    fn drop(&mut self) {
        let _ = AudioBackend::close(self);
    }
}
