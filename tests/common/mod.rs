//! Mock native hosts for driving both backends without hardware.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duplexio::backend::driver::native::{DriverError, DriverFormat, DriverHost, DriverSession};
use duplexio::backend::mixer::native::{
    EndpointInfo, Interest, MixFormat, MixSampleType, MixerError, MixerHost, MixerSession, Ready,
};
use duplexio::ChannelInfo;

/// The driver registry is process-wide, so tests that open driver streams
/// take this lock to keep from tripping over each other.
pub static DRIVER_TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn driver_guard() -> std::sync::MutexGuard<'static, ()> {
    DRIVER_TEST_LOCK.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn driver_format_bytes(format: DriverFormat) -> usize {
    match format {
        DriverFormat::I8 => 1,
        DriverFormat::I16 | DriverFormat::I16Be => 2,
        DriverFormat::I24 | DriverFormat::I24Be => 3,
        DriverFormat::F64 | DriverFormat::F64Be => 8,
        _ => 4,
    }
}

#[derive(Clone)]
pub struct MockDriverConfig {
    pub names: Vec<String>,
    pub input_channels: usize,
    pub output_channels: usize,
    pub rates: Vec<f64>,
    pub input_format: DriverFormat,
    pub output_format: DriverFormat,
    pub preferred_buffer_size: usize,
    /// Forced failure for `create_buffers`.
    pub create_result: Option<DriverError>,
}

impl Default for MockDriverConfig {
    fn default() -> Self {
        MockDriverConfig {
            names: vec!["Mock Driver".to_string()],
            input_channels: 2,
            output_channels: 2,
            rates: vec![44100.0, 48000.0],
            input_format: DriverFormat::I16,
            output_format: DriverFormat::I16,
            preferred_buffer_size: 64,
            create_result: None,
        }
    }
}

/// Observable driver state shared between the mock session and the test.
pub struct DriverTap {
    /// Per-channel double buffers the test fills before a buffer switch.
    pub input: Vec<[Vec<u8>; 2]>,
    /// Copy of the hardware output taken at `output_ready`.
    pub output: Vec<[Vec<u8>; 2]>,
    pub output_ready_calls: usize,
    pub started: bool,
    pub sample_rate: f64,
    pub created_buffer_size: Option<usize>,
    pub disposed: bool,
    pub control_panel_opened: bool,
    pub loads: usize,
}

impl Default for DriverTap {
    fn default() -> Self {
        DriverTap {
            input: Vec::new(),
            output: Vec::new(),
            output_ready_calls: 0,
            started: false,
            sample_rate: 48000.0,
            created_buffer_size: None,
            disposed: false,
            control_panel_opened: false,
            loads: 0,
        }
    }
}

pub struct MockDriverHost {
    config: MockDriverConfig,
    tap: Arc<Mutex<DriverTap>>,
}

impl MockDriverHost {
    pub fn new(config: MockDriverConfig) -> Self {
        MockDriverHost { config, tap: Arc::new(Mutex::new(DriverTap::default())) }
    }

    pub fn tap(&self) -> Arc<Mutex<DriverTap>> {
        Arc::clone(&self.tap)
    }
}

impl DriverHost for MockDriverHost {
    fn driver_names(&mut self) -> Result<Vec<String>, DriverError> {
        Ok(self.config.names.clone())
    }

    fn load(&mut self, index: usize) -> Result<Box<dyn DriverSession>, DriverError> {
        if index >= self.config.names.len() {
            return Err(DriverError::NotPresent);
        }
        self.tap.lock().unwrap().loads += 1;
        Ok(Box::new(MockDriverSession {
            config: self.config.clone(),
            tap: Arc::clone(&self.tap),
            input: Vec::new(),
            output: Vec::new(),
        }))
    }
}

struct MockDriverSession {
    config: MockDriverConfig,
    tap: Arc<Mutex<DriverTap>>,
    input: Vec<[Vec<u8>; 2]>,
    output: Vec<[Vec<u8>; 2]>,
}

impl DriverSession for MockDriverSession {
    fn channel_counts(&mut self) -> Result<(usize, usize), DriverError> {
        Ok((self.config.input_channels, self.config.output_channels))
    }

    fn channel_info(&mut self, channel: usize, input: bool) -> Result<ChannelInfo, DriverError> {
        let count = if input { self.config.input_channels } else { self.config.output_channels };
        if channel >= count {
            return Err(DriverError::InvalidParameter);
        }
        Ok(ChannelInfo {
            name: format!("{} {}", if input { "In" } else { "Out" }, channel),
            group: 0,
            active: false,
            input,
        })
    }

    fn can_sample_rate(&mut self, rate: f64) -> bool {
        self.config.rates.contains(&rate)
    }

    fn sample_rate(&mut self) -> Result<f64, DriverError> {
        Ok(self.tap.lock().unwrap().sample_rate)
    }

    fn set_sample_rate(&mut self, rate: f64) -> Result<(), DriverError> {
        if !self.config.rates.contains(&rate) {
            return Err(DriverError::InvalidMode);
        }
        self.tap.lock().unwrap().sample_rate = rate;
        Ok(())
    }

    fn sample_format(&mut self, input: bool) -> Result<DriverFormat, DriverError> {
        Ok(if input { self.config.input_format } else { self.config.output_format })
    }

    fn preferred_buffer_size(&mut self) -> Result<usize, DriverError> {
        Ok(self.config.preferred_buffer_size)
    }

    fn create_buffers(
        &mut self,
        input_channels: usize,
        output_channels: usize,
        buffer_size: usize,
    ) -> Result<(), DriverError> {
        if let Some(error) = self.config.create_result {
            return Err(error);
        }
        let in_bytes = buffer_size * driver_format_bytes(self.config.input_format);
        let out_bytes = buffer_size * driver_format_bytes(self.config.output_format);
        self.input =
            (0..input_channels).map(|_| [vec![0; in_bytes], vec![0; in_bytes]]).collect();
        self.output =
            (0..output_channels).map(|_| [vec![0; out_bytes], vec![0; out_bytes]]).collect();
        let mut tap = self.tap.lock().unwrap();
        tap.input = self.input.clone();
        tap.output = self.output.clone();
        tap.created_buffer_size = Some(buffer_size);
        Ok(())
    }

    fn dispose_buffers(&mut self) {
        self.input.clear();
        self.output.clear();
        self.tap.lock().unwrap().disposed = true;
    }

    fn hardware_buffer(&mut self, channel: usize, input: bool, half: usize) -> &mut [u8] {
        if input {
            // Refresh from the tap so tests can stage capture bytes.
            let tap = self.tap.lock().unwrap();
            if tap.input[channel][half].len() == self.input[channel][half].len() {
                self.input[channel][half].copy_from_slice(&tap.input[channel][half]);
            }
            drop(tap);
            &mut self.input[channel][half]
        } else {
            &mut self.output[channel][half]
        }
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.tap.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.tap.lock().unwrap().started = false;
        Ok(())
    }

    fn output_ready(&mut self) {
        let mut tap = self.tap.lock().unwrap();
        tap.output = self.output.clone();
        tap.output_ready_calls += 1;
    }

    fn open_control_panel(&mut self) -> Result<(), DriverError> {
        self.tap.lock().unwrap().control_panel_opened = true;
        Ok(())
    }
}

fn mix_sample_bytes(sample_type: MixSampleType) -> usize {
    match sample_type {
        MixSampleType::I8 => 1,
        MixSampleType::I16 => 2,
        MixSampleType::I24 => 3,
        MixSampleType::F64 => 8,
        _ => 4,
    }
}

#[derive(Clone)]
pub struct MockEndpoint {
    pub name: String,
    pub input_channels: usize,
    pub output_channels: usize,
    pub sample_rate: f64,
    pub default_input: bool,
    pub default_output: bool,
    pub sample_type: MixSampleType,
}

impl MockEndpoint {
    pub fn capture(name: &str, channels: usize, rate: f64) -> Self {
        MockEndpoint {
            name: name.to_string(),
            input_channels: channels,
            output_channels: 0,
            sample_rate: rate,
            default_input: true,
            default_output: false,
            sample_type: MixSampleType::F32,
        }
    }

    pub fn render(name: &str, channels: usize, rate: f64) -> Self {
        MockEndpoint {
            name: name.to_string(),
            input_channels: 0,
            output_channels: channels,
            sample_rate: rate,
            default_input: false,
            default_output: true,
            sample_type: MixSampleType::F32,
        }
    }
}

/// Observable mixing-service state shared between the mock session and the
/// test.
#[derive(Default)]
pub struct MixerTap {
    /// Capture packets queued for the worker, interleaved device bytes.
    pub capture_packets: VecDeque<Vec<u8>>,
    /// Everything the worker wrote to the render side.
    pub rendered: Vec<u8>,
    pub sessions_opened: usize,
    pub started: bool,
    pub stopped: bool,
}

pub struct MockMixerHost {
    endpoints: Vec<MockEndpoint>,
    /// Frames `render_free` reports. The real service never reports more
    /// than its buffer length; tests can raise this to model a misbehaving
    /// one.
    pub render_free_frames: usize,
    tap: Arc<Mutex<MixerTap>>,
}

impl MockMixerHost {
    pub fn new(endpoints: Vec<MockEndpoint>) -> Self {
        MockMixerHost {
            endpoints,
            render_free_frames: 512,
            tap: Arc::new(Mutex::new(MixerTap::default())),
        }
    }

    pub fn tap(&self) -> Arc<Mutex<MixerTap>> {
        Arc::clone(&self.tap)
    }
}

impl MixerHost for MockMixerHost {
    fn endpoints(&mut self) -> Result<Vec<EndpointInfo>, MixerError> {
        Ok(self
            .endpoints
            .iter()
            .map(|e| EndpointInfo {
                name: e.name.clone(),
                input_channels: e.input_channels,
                output_channels: e.output_channels,
                sample_rate: e.sample_rate,
                default_input: e.default_input,
                default_output: e.default_output,
            })
            .collect())
    }

    fn probe_format(&mut self, endpoint: usize, input: bool) -> Result<MixFormat, MixerError> {
        let endpoint = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| MixerError("endpoint out of range".to_string()))?;
        let channels = if input { endpoint.input_channels } else { endpoint.output_channels };
        if channels == 0 {
            return Err(MixerError("direction unavailable".to_string()));
        }
        Ok(MixFormat {
            sample_rate: endpoint.sample_rate,
            channels,
            sample_type: endpoint.sample_type,
        })
    }

    fn open_session(
        &mut self,
        input: Option<usize>,
        output: Option<usize>,
    ) -> Result<Box<dyn MixerSession>, MixerError> {
        let input_frame_bytes = match input {
            Some(id) => {
                let endpoint = self
                    .endpoints
                    .get(id)
                    .ok_or_else(|| MixerError("endpoint out of range".to_string()))?;
                endpoint.input_channels * mix_sample_bytes(endpoint.sample_type)
            }
            None => 0,
        };
        self.tap.lock().unwrap().sessions_opened += 1;
        Ok(Box::new(MockMixerSession {
            tap: Arc::clone(&self.tap),
            input_frame_bytes,
            has_input: input.is_some(),
            has_output: output.is_some(),
            render_free_frames: self.render_free_frames,
        }))
    }
}

struct MockMixerSession {
    tap: Arc<Mutex<MixerTap>>,
    input_frame_bytes: usize,
    has_input: bool,
    has_output: bool,
    render_free_frames: usize,
}

impl MixerSession for MockMixerSession {
    fn start(&mut self) -> Result<(), MixerError> {
        self.tap.lock().unwrap().started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.tap.lock().unwrap().stopped = true;
    }

    fn capture_buffer_frames(&self) -> usize {
        if self.has_input {
            512
        } else {
            0
        }
    }

    fn render_buffer_frames(&self) -> usize {
        if self.has_output {
            512
        } else {
            0
        }
    }

    fn wait_ready(&mut self, _interest: Interest, _timeout: Duration) -> Result<Ready, MixerError> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(Ready::Timeout)
    }

    fn capture_available(&mut self) -> Result<usize, MixerError> {
        Ok(self
            .tap
            .lock()
            .unwrap()
            .capture_packets
            .front()
            .map(|packet| packet.len() / self.input_frame_bytes)
            .unwrap_or(0))
    }

    fn read_capture(&mut self, buffer: &mut [u8]) -> Result<usize, MixerError> {
        let mut tap = self.tap.lock().unwrap();
        let Some(packet) = tap.capture_packets.pop_front() else { return Ok(0) };
        buffer[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len() / self.input_frame_bytes)
    }

    fn render_free(&mut self) -> Result<usize, MixerError> {
        Ok(if self.has_output { self.render_free_frames } else { 0 })
    }

    fn write_render(&mut self, buffer: &[u8], _frames: usize) -> Result<(), MixerError> {
        self.tap.lock().unwrap().rendered.extend_from_slice(buffer);
        Ok(())
    }
}
