//! Backend for the desktop mixing service.
//!
//! Endpoints are independent per direction, rates are pinned by the
//! service's shared mode, and the device pushes/pulls on its own cadence.
//! A worker thread owns the live session while the stream runs: it drains
//! capture packets into a ring, runs whole callback periods out of that
//! ring into a render ring, and feeds the render side from there. Stopping
//! sets a flag, joins the worker and takes the callback and user buffers
//! back for the next run.

pub mod native;
#[cfg(windows)]
pub mod windows;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::backend::AudioBackend;
use crate::callback::{CallbackBinding, CallbackInfo, ChannelBuffers};
use crate::device::{merge_device_list, Api, DeviceInfo};
use crate::error::{Error, Result};
use crate::format::{convert, SampleFormat};
use crate::ring::RingBuffer;
use crate::stream::{DeviceSelector, StreamInformation, StreamParameters, StreamState};

use native::{EndpointInfo, Interest, MixSampleType, MixerHost, MixerSession};

/// Frames per period when the caller does not ask for a size.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 256;

/// Upper bound on one wait so the worker notices its stop flag even when
/// the service goes quiet.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

fn mix_sample_format(sample_type: MixSampleType) -> Option<SampleFormat> {
    match sample_type {
        MixSampleType::I8 => Some(SampleFormat::I8),
        MixSampleType::I16 => Some(SampleFormat::I16),
        MixSampleType::I32 => Some(SampleFormat::I32),
        MixSampleType::F32 => Some(SampleFormat::F32),
        MixSampleType::F64 => Some(SampleFormat::F64),
        MixSampleType::I24 => None,
    }
}

/// One direction's negotiated shape.
#[derive(Clone, Copy)]
struct Direction {
    channels: usize,
    device_format: SampleFormat,
    user_format: SampleFormat,
}

impl Direction {
    fn frame_bytes(&self) -> usize {
        self.channels * self.device_format.bytes()
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<WorkerReturn>,
}

/// Moved into the worker at start and handed back at join.
struct WorkerReturn {
    callback: CallbackBinding,
    input_user: ChannelBuffers,
    output_user: ChannelBuffers,
}

struct OpenStream {
    info: StreamInformation,
    input_endpoint: Option<usize>,
    output_endpoint: Option<usize>,
    input: Option<Direction>,
    output: Option<Direction>,
    /// User buffers parked here between runs; `None` while the worker
    /// holds them.
    input_user: Option<ChannelBuffers>,
    output_user: Option<ChannelBuffers>,
    worker: Option<Worker>,
}

/// Stream backend over a [`MixerHost`].
pub(crate) struct MixerBackend {
    host: Box<dyn MixerHost>,
    endpoints: Vec<EndpointInfo>,
    devices: Vec<DeviceInfo>,
    callback: Option<CallbackBinding>,
    open: Option<OpenStream>,
}

impl MixerBackend {
    pub(crate) fn new(host: Box<dyn MixerHost>) -> Self {
        MixerBackend {
            host,
            endpoints: Vec::new(),
            devices: Vec::new(),
            callback: None,
            open: None,
        }
    }

    fn refresh(&mut self) -> Result<()> {
        let endpoints = self.host.endpoints().map_err(|error| {
            error!(%error, "endpoint enumeration failed");
            Error::Fail
        })?;
        let probed = endpoints
            .iter()
            .enumerate()
            .map(|(id, endpoint)| DeviceInfo {
                id,
                name: endpoint.name.clone(),
                input_channels: endpoint.input_channels,
                output_channels: endpoint.output_channels,
                sample_rates: vec![endpoint.sample_rate],
                default_device: endpoint.default_input || endpoint.default_output,
                api: Api::Mixer,
            })
            .collect();
        merge_device_list(&mut self.devices, probed);
        self.endpoints = endpoints;
        Ok(())
    }

    fn resolve_endpoint(&self, selector: DeviceSelector, input: bool) -> Result<Option<usize>> {
        let channels = |endpoint: &EndpointInfo| {
            if input {
                endpoint.input_channels
            } else {
                endpoint.output_channels
            }
        };
        match selector {
            DeviceSelector::NoDevice => Ok(None),
            DeviceSelector::Default => self
                .endpoints
                .iter()
                .position(|e| {
                    let is_default = if input { e.default_input } else { e.default_output };
                    is_default && channels(e) > 0
                })
                .map(Some)
                .ok_or(Error::NotPresent),
            DeviceSelector::Id(id) => {
                let endpoint = self.endpoints.get(id).ok_or(Error::NotPresent)?;
                if channels(endpoint) == 0 {
                    return Err(Error::NotPresent);
                }
                Ok(Some(id))
            }
        }
    }

    fn probe_direction(&mut self, endpoint: Option<usize>, input: bool) -> Result<Option<(f64, Direction)>> {
        let Some(id) = endpoint else { return Ok(None) };
        let mix = self.host.probe_format(id, input).map_err(|error| {
            error!(%error, endpoint = id, "format probe failed");
            Error::Fail
        })?;
        let device_format = mix_sample_format(mix.sample_type).ok_or(Error::UnsupportedSampleFormat)?;
        Ok(Some((
            mix.sample_rate,
            Direction { channels: mix.channels, device_format, user_format: device_format },
        )))
    }
}

impl AudioBackend for MixerBackend {
    fn api(&self) -> Api {
        Api::Mixer
    }

    fn devices(&mut self) -> Result<&[DeviceInfo]> {
        self.refresh()?;
        Ok(&self.devices)
    }

    fn set_callback(&mut self, binding: CallbackBinding) {
        self.callback = Some(binding);
    }

    fn information(&self) -> StreamInformation {
        match &self.open {
            Some(open) => open.info.clone(),
            None => StreamInformation::default(),
        }
    }

    fn state(&self) -> StreamState {
        match &self.open {
            Some(open) if open.worker.is_some() => StreamState::Running,
            Some(_) => StreamState::Opened,
            None => StreamState::Closed,
        }
    }

    fn open(&mut self, params: &StreamParameters) -> Result<()> {
        if self.open.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let (user_input_format, user_output_format) = match &self.callback {
            Some(callback) => (callback.input_format(), callback.output_format()),
            None => return Err(Error::NoCallback),
        };

        self.refresh()?;
        let input_endpoint = self.resolve_endpoint(params.input, true)?;
        let output_endpoint = self.resolve_endpoint(params.output, false)?;
        if input_endpoint.is_none() && output_endpoint.is_none() {
            return Err(Error::NotPresent);
        }

        let input_probe = self.probe_direction(input_endpoint, true)?;
        let output_probe = self.probe_direction(output_endpoint, false)?;
        let mut input = input_probe.map(|(_, d)| d);
        let mut output = output_probe.map(|(_, d)| d);
        if let Some(direction) = &mut input {
            direction.user_format = user_input_format;
        }
        if let Some(direction) = &mut output {
            direction.user_format = user_output_format;
        }

        // Shared mode pins each endpoint's rate; a duplex pair has to agree
        // and a request can only be honored if it happens to match.
        let sample_rate = match (&input_probe, &output_probe) {
            (Some((input_rate, _)), Some((output_rate, _))) => {
                if input_rate != output_rate {
                    return Err(Error::InvalidDuplex);
                }
                *input_rate
            }
            (Some((rate, _)), None) | (None, Some((rate, _))) => *rate,
            (None, None) => return Err(Error::NotPresent),
        };
        if let Some(requested) = params.sample_rate {
            if requested != sample_rate {
                if !params.resampling {
                    return Err(Error::InvalidSampleRate);
                }
                warn!(requested, granted = sample_rate, "requested rate unavailable");
            }
        }

        let buffer_size = params.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            return Err(Error::InvalidBufferSize);
        }

        let input_channels = input.map_or(0, |d| d.channels);
        let output_channels = output.map_or(0, |d| d.channels);
        let input_user = ChannelBuffers::allocate(input_channels, buffer_size, user_input_format)?;
        let output_user =
            ChannelBuffers::allocate(output_channels, buffer_size, user_output_format)?;

        self.open = Some(OpenStream {
            info: StreamInformation {
                state: StreamState::Opened,
                input_device: input_endpoint,
                output_device: output_endpoint,
                input_channels,
                output_channels,
                buffer_size,
                sample_rate,
                input_format: input.map(|d| d.device_format),
                output_format: output.map(|d| d.device_format),
            },
            input_endpoint,
            output_endpoint,
            input,
            output,
            input_user: Some(input_user),
            output_user: Some(output_user),
            worker: None,
        });
        debug!(sample_rate, buffer_size, "mixer stream opened");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let open = self.open.as_mut().ok_or(Error::NotOpen)?;
        if open.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        if self.callback.is_none() {
            return Err(Error::NoCallback);
        }

        // Fresh service clients for every run.
        let mut session = self
            .host
            .open_session(open.input_endpoint, open.output_endpoint)
            .map_err(|error| {
                error!(%error, "session open failed");
                Error::Fail
            })?;
        session.start().map_err(|error| {
            error!(%error, "session start failed");
            Error::Fail
        })?;

        let callback = self.callback.take().ok_or(Error::NoCallback)?;
        let input_user = open.input_user.take().unwrap_or_else(ChannelBuffers::empty);
        let output_user = open.output_user.take().unwrap_or_else(ChannelBuffers::empty);
        let stop = Arc::new(AtomicBool::new(false));
        let context = WorkerContext {
            session,
            callback,
            input_user,
            output_user,
            stop: stop.clone(),
            input: open.input,
            output: open.output,
            buffer_size: open.info.buffer_size,
            sample_rate: open.info.sample_rate,
        };
        let handle = thread::spawn(move || context.run());
        open.worker = Some(Worker { stop, handle });
        open.info.state = StreamState::Running;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let open = self.open.as_mut().ok_or(Error::NotOpen)?;
        let worker = open.worker.take().ok_or(Error::NotRunning)?;
        worker.stop.store(true, Ordering::Relaxed);
        open.info.state = StreamState::Opened;
        match worker.handle.join() {
            Ok(returned) => {
                self.callback = Some(returned.callback);
                open.input_user = Some(returned.input_user);
                open.output_user = Some(returned.output_user);
                Ok(())
            }
            Err(_) => {
                // The binding and user buffers died with the worker; the
                // stream cannot be restarted without rebinding.
                error!("mixer worker panicked");
                Err(Error::Fail)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let running = match &self.open {
            None => return Err(Error::NotOpen),
            Some(open) => open.worker.is_some(),
        };
        if running {
            let _ = AudioBackend::stop(self);
        }
        self.open = None;
        debug!("mixer stream closed");
        Ok(())
    }

    fn set_sample_rate(&mut self, _rate: f64) -> Result<()> {
        // The service owns the shared-mode rate; no request can be honored.
        match &self.open {
            Some(_) => Err(Error::InvalidSampleRate),
            None => Err(Error::NotOpen),
        }
    }
}

impl Drop for MixerBackend {
    fn drop(&mut self) {
        let _ = AudioBackend::close(self);
    }
}

/// Everything the worker thread owns while the stream runs.
struct WorkerContext {
    session: Box<dyn MixerSession>,
    callback: CallbackBinding,
    input_user: ChannelBuffers,
    output_user: ChannelBuffers,
    stop: Arc<AtomicBool>,
    input: Option<Direction>,
    output: Option<Direction>,
    buffer_size: usize,
    sample_rate: f64,
}

impl WorkerContext {
    fn run(mut self) -> WorkerReturn {
        debug!("mixer worker started");

        // Rings hold interleaved device-format bytes, sized for one period
        // plus one full hardware buffer per direction.
        let capture_frames = self.session.capture_buffer_frames();
        let render_frames = self.session.render_buffer_frames();
        let period_in_bytes = self.input.map_or(0, |d| self.buffer_size * d.frame_bytes());
        let period_out_bytes = self.output.map_or(0, |d| self.buffer_size * d.frame_bytes());
        let mut input_ring: RingBuffer<u8> = RingBuffer::new(
            self.input.map_or(0, |d| (self.buffer_size + capture_frames) * d.frame_bytes()) + 2,
        );
        let mut output_ring: RingBuffer<u8> = RingBuffer::new(
            self.output.map_or(0, |d| (self.buffer_size + render_frames) * d.frame_bytes()) + 2,
        );
        let mut capture_scratch =
            vec![0u8; self.input.map_or(0, |d| capture_frames.max(1) * d.frame_bytes())];
        let mut period_in = vec![0u8; period_in_bytes];
        let mut period_out = vec![0u8; period_out_bytes];
        let channel_width = self.input.map_or(0, |d| d.device_format.bytes()).max(
            self.output.map_or(0, |d| d.device_format.bytes()),
        );
        let mut channel_scratch = vec![0u8; self.buffer_size * channel_width.max(1)];
        let mut render_scratch =
            vec![0u8; self.output.map_or(0, |d| render_frames.max(1) * d.frame_bytes())];

        let interest = match (&self.input, &self.output) {
            (Some(_), Some(_)) => Interest::Both,
            (Some(_), None) => Interest::Capture,
            _ => Interest::Render,
        };
        let info = CallbackInfo {
            input_channels: self.input.map_or(0, |d| d.channels),
            output_channels: self.output.map_or(0, |d| d.channels),
            buffer_size: self.buffer_size,
            sample_rate: self.sample_rate,
        };

        'run: while !self.stop.load(Ordering::Relaxed) {
            if let Err(error) = self.session.wait_ready(interest, WAIT_TIMEOUT) {
                error!(%error, "wait on the service failed");
                break 'run;
            }

            // Drain pending capture packets. A packet the ring cannot take
            // stays with the service until the next pass.
            if let Some(direction) = self.input {
                loop {
                    let available = match self.session.capture_available() {
                        Ok(frames) => frames,
                        Err(error) => {
                            error!(%error, "capture query failed");
                            break 'run;
                        }
                    };
                    let bytes = available * direction.frame_bytes();
                    if available == 0 || input_ring.space() < bytes {
                        break;
                    }
                    if capture_scratch.len() < bytes {
                        // Packets are bounded by the hardware buffer, but the
                        // scratch must never trust that.
                        capture_scratch.resize(bytes, 0);
                    }
                    let frames = match self.session.read_capture(&mut capture_scratch[..bytes]) {
                        Ok(frames) => frames,
                        Err(error) => {
                            error!(%error, "capture read failed");
                            break 'run;
                        }
                    };
                    for &byte in &capture_scratch[..frames * direction.frame_bytes()] {
                        input_ring.enqueue(byte);
                    }
                }
            }

            // Run whole periods while the input ring can supply one and the
            // output ring can take one.
            loop {
                let input_ready = self.input.is_none() || input_ring.len() >= period_in_bytes;
                let output_ready =
                    self.output.is_none() || output_ring.space() >= period_out_bytes;
                if !input_ready || !output_ready {
                    break;
                }

                if let Some(direction) = self.input {
                    for byte in period_in.iter_mut() {
                        *byte = input_ring.dequeue();
                    }
                    deinterleave_convert(
                        &mut self.input_user,
                        &period_in,
                        &mut channel_scratch,
                        self.buffer_size,
                        direction,
                    );
                }

                self.callback.call(&self.input_user, &mut self.output_user, info);

                if let Some(direction) = self.output {
                    interleave_convert(
                        &mut period_out,
                        &self.output_user,
                        &mut channel_scratch,
                        self.buffer_size,
                        direction,
                    );
                    for &byte in period_out.iter() {
                        output_ring.enqueue(byte);
                    }
                }

                if self.input.is_none() && self.output.is_none() {
                    break;
                }
            }

            // Feed the render side whatever it has room for.
            if let Some(direction) = self.output {
                let free = match self.session.render_free() {
                    Ok(frames) => frames,
                    Err(error) => {
                        error!(%error, "render query failed");
                        break 'run;
                    }
                };
                // A session may report more free frames than one hardware
                // buffer holds; write at most a scratch buffer per pass.
                let frames = free
                    .min(output_ring.len() / direction.frame_bytes())
                    .min(render_scratch.len() / direction.frame_bytes());
                if frames > 0 {
                    let bytes = frames * direction.frame_bytes();
                    for byte in render_scratch[..bytes].iter_mut() {
                        *byte = output_ring.dequeue();
                    }
                    if let Err(error) = self.session.write_render(&render_scratch[..bytes], frames)
                    {
                        error!(%error, "render write failed");
                        break 'run;
                    }
                }
            }
        }

        self.session.stop();
        debug!("mixer worker stopped");
        WorkerReturn {
            callback: self.callback,
            input_user: self.input_user,
            output_user: self.output_user,
        }
    }
}

/// Splits one interleaved device-format period into the per-channel user
/// buffers, converting formats on the way.
fn deinterleave_convert(
    user: &mut ChannelBuffers,
    period: &[u8],
    channel_scratch: &mut [u8],
    frames: usize,
    direction: Direction,
) {
    let width = direction.device_format.bytes();
    for channel in 0..direction.channels {
        for frame in 0..frames {
            let src = (frame * direction.channels + channel) * width;
            channel_scratch[frame * width..(frame + 1) * width]
                .copy_from_slice(&period[src..src + width]);
        }
        convert(
            user.channel_bytes_mut(channel),
            channel_scratch,
            frames,
            direction.user_format,
            direction.device_format,
        );
    }
}

/// Converts the per-channel user buffers into one interleaved
/// device-format period.
fn interleave_convert(
    period: &mut [u8],
    user: &ChannelBuffers,
    channel_scratch: &mut [u8],
    frames: usize,
    direction: Direction,
) {
    let width = direction.device_format.bytes();
    for channel in 0..direction.channels {
        convert(
            channel_scratch,
            user.channel_bytes(channel),
            frames,
            direction.device_format,
            direction.user_format,
        );
        for frame in 0..frames {
            let dst = (frame * direction.channels + channel) * width;
            period[dst..dst + width].copy_from_slice(&channel_scratch[frame * width..(frame + 1) * width]);
        }
    }
}
