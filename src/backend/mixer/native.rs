//! Opaque surface of a desktop mixing service.
//!
//! The service is modeled as a [`MixerHost`] that enumerates shared-mode
//! endpoints and probes their mix formats, and a [`MixerSession`] holding
//! live capture/render clients. Sessions are opened fresh on every start and
//! dropped on stop; the backend never reuses service clients across runs.

use std::time::Duration;

use thiserror::Error;

/// Native diagnostic from the mixing service. Logged and mapped to the
/// public taxonomy at the call site, never returned raw.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MixerError(pub String);

/// One shared-mode endpoint as the service reports it.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub name: String,
    pub input_channels: usize,
    pub output_channels: usize,
    /// The service's mix rate for this endpoint. Shared mode pins it; the
    /// backend cannot change it.
    pub sample_rate: f64,
    pub default_input: bool,
    pub default_output: bool,
}

/// Sample representation of a mix format. 24-bit mixes are reported but not
/// handled; negotiation rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixSampleType {
    I8,
    I16,
    I24,
    I32,
    F32,
    F64,
}

/// The service's mix format for one direction of one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct MixFormat {
    pub sample_rate: f64,
    pub channels: usize,
    pub sample_type: MixSampleType,
}

/// Which direction the worker wants to be woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Capture,
    Render,
    Both,
}

/// Why [`MixerSession::wait_ready`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Capture,
    Render,
    Timeout,
}

pub trait MixerHost: Send {
    /// Current endpoint list. Index positions are the device ids used
    /// everywhere else.
    fn endpoints(&mut self) -> Result<Vec<EndpointInfo>, MixerError>;

    /// Mix format for one direction of an endpoint, without holding any
    /// client open.
    fn probe_format(&mut self, endpoint: usize, input: bool) -> Result<MixFormat, MixerError>;

    /// Opens live clients for the given endpoints. Called on every start.
    fn open_session(
        &mut self,
        input: Option<usize>,
        output: Option<usize>,
    ) -> Result<Box<dyn MixerSession>, MixerError>;
}

/// Live capture/render clients for one run of the stream.
///
/// All byte buffers are interleaved frames in the endpoint's mix format.
pub trait MixerSession: Send {
    fn start(&mut self) -> Result<(), MixerError>;

    fn stop(&mut self);

    /// Hardware capture buffer length in frames (0 without input).
    fn capture_buffer_frames(&self) -> usize;

    /// Hardware render buffer length in frames (0 without output).
    fn render_buffer_frames(&self) -> usize;

    /// Blocks until a direction of interest signals or the timeout passes.
    fn wait_ready(&mut self, interest: Interest, timeout: Duration) -> Result<Ready, MixerError>;

    /// Frames in the next capture packet, 0 when none is pending. The
    /// packet stays with the service until [`read_capture`] consumes it,
    /// so a caller short on space can leave it there.
    ///
    /// [`read_capture`]: MixerSession::read_capture
    fn capture_available(&mut self) -> Result<usize, MixerError>;

    /// Consumes the next capture packet into `buffer` and returns its
    /// length in frames.
    fn read_capture(&mut self, buffer: &mut [u8]) -> Result<usize, MixerError>;

    /// Frames currently writable on the render side.
    fn render_free(&mut self) -> Result<usize, MixerError>;

    /// Writes `frames` interleaved frames from `buffer` to the render
    /// client.
    fn write_render(&mut self, buffer: &[u8], frames: usize) -> Result<(), MixerError>;
}
