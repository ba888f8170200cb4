//! WASAPI implementation of the mixing-service traits.

use std::time::Duration;

use tracing::debug;

use windows::core::PWSTR;
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, IAudioCaptureClient, IAudioClient, IAudioRenderClient, IMMDevice,
    IMMDeviceEnumerator, MMDeviceEnumerator, AUDCLNT_BUFFERFLAGS_SILENT, AUDCLNT_SHAREMODE_SHARED,
    AUDCLNT_STREAMFLAGS_EVENTCALLBACK, DEVICE_STATE_ACTIVE, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Threading::{CreateEventW, WaitForMultipleObjects};
use windows::Win32::UI::Shell::PropertiesSystem::IPropertyStore;

use super::native::{
    EndpointInfo, Interest, MixFormat, MixSampleType, MixerError, MixerHost, MixerSession, Ready,
};

const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const WAVE_FORMAT_PCM: u16 = 1;
const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: windows::core::GUID =
    windows::core::GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

/// Shared-mode buffer duration requested at Initialize, in 100ns units
/// (100ms).
const BUFFER_DURATION: i64 = 1_000_000;

fn win_err(context: &str, error: windows::core::Error) -> MixerError {
    MixerError(format!("{context}: {error}"))
}

/// Makes sure the calling thread joined the multithreaded apartment.
/// Sessions move between threads, which is only sound under MTA.
fn ensure_com() {
    unsafe {
        let _ = CoInitializeEx(None, COINIT_MULTITHREADED);
    }
}

fn device_enumerator() -> Result<IMMDeviceEnumerator, MixerError> {
    unsafe {
        CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
            .map_err(|e| win_err("failed to create device enumerator", e))
    }
}

fn device_id(device: &IMMDevice) -> Result<String, MixerError> {
    unsafe {
        let id_ptr: PWSTR = device.GetId().map_err(|e| win_err("failed to get device id", e))?;
        let id = pwstr_to_string(id_ptr);
        CoTaskMemFree(Some(id_ptr.0 as *const _));
        Ok(id)
    }
}

fn device_name(device: &IMMDevice) -> String {
    unsafe {
        let name = device
            .OpenPropertyStore(STGM_READ)
            .ok()
            .and_then(|props: IPropertyStore| props.GetValue(&PKEY_Device_FriendlyName).ok())
            .map(|value| value.to_string())
            .unwrap_or_default();
        if name.is_empty() {
            "Unknown Device".to_string()
        } else {
            name
        }
    }
}

fn pwstr_to_string(pwstr: PWSTR) -> String {
    unsafe {
        if pwstr.0.is_null() {
            return String::new();
        }
        let len = (0..).take_while(|&i| *pwstr.0.add(i) != 0).count();
        String::from_utf16_lossy(std::slice::from_raw_parts(pwstr.0, len))
    }
}

/// Mix-format facts pulled out of a `WAVEFORMATEX`.
struct ParsedFormat {
    sample_rate: f64,
    channels: usize,
    frame_bytes: usize,
    sample_type: MixSampleType,
}

fn parse_wave_format(format: &WAVEFORMATEX) -> Result<ParsedFormat, MixerError> {
    let format_tag = format.wFormatTag;
    let is_float;
    let bits;

    if format_tag == WAVE_FORMAT_EXTENSIBLE {
        let ext = unsafe { &*(format as *const WAVEFORMATEX as *const WAVEFORMATEXTENSIBLE) };
        let sub_format = unsafe { std::ptr::read_unaligned(std::ptr::addr_of!(ext.SubFormat)) };
        is_float = sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT;
        bits = format.wBitsPerSample;
    } else if format_tag == WAVE_FORMAT_IEEE_FLOAT {
        is_float = true;
        bits = format.wBitsPerSample;
    } else if format_tag == WAVE_FORMAT_PCM {
        is_float = false;
        bits = format.wBitsPerSample;
    } else {
        return Err(MixerError(format!("unsupported format tag {format_tag}")));
    }

    let sample_type = match (is_float, bits) {
        (true, 32) => MixSampleType::F32,
        (true, 64) => MixSampleType::F64,
        (false, 8) => MixSampleType::I8,
        (false, 16) => MixSampleType::I16,
        (false, 24) => MixSampleType::I24,
        (false, 32) => MixSampleType::I32,
        _ => return Err(MixerError(format!("unsupported sample width {bits} (float={is_float})"))),
    };

    Ok(ParsedFormat {
        sample_rate: format.nSamplesPerSec as f64,
        channels: format.nChannels as usize,
        frame_bytes: format.nBlockAlign as usize,
        sample_type,
    })
}

/// Activates a client on the device and reads its mix format.
fn probe_device_format(device: &IMMDevice) -> Result<ParsedFormat, MixerError> {
    unsafe {
        let client: IAudioClient = device
            .Activate(CLSCTX_ALL, None)
            .map_err(|e| win_err("failed to activate audio client", e))?;
        let format_ptr = client.GetMixFormat().map_err(|e| win_err("failed to get mix format", e))?;
        let parsed = parse_wave_format(&*format_ptr);
        CoTaskMemFree(Some(format_ptr as *const _));
        parsed
    }
}

struct WindowsEndpoint {
    id: String,
    capture: bool,
}

/// [`MixerHost`] over the Windows audio session API.
pub struct WindowsMixerHost {
    endpoints: Vec<WindowsEndpoint>,
}

// COM interfaces are only touched through methods, and every entry point
// joins the MTA first.
unsafe impl Send for WindowsMixerHost {}

impl WindowsMixerHost {
    pub fn new() -> Self {
        ensure_com();
        WindowsMixerHost { endpoints: Vec::new() }
    }

    fn endpoint_device(&self, index: usize) -> Result<(IMMDevice, bool), MixerError> {
        let endpoint = self
            .endpoints
            .get(index)
            .ok_or_else(|| MixerError(format!("endpoint {index} out of range")))?;
        let wide: Vec<u16> = endpoint.id.encode_utf16().chain(std::iter::once(0)).collect();
        let device = unsafe {
            device_enumerator()?
                .GetDevice(windows::core::PCWSTR(wide.as_ptr()))
                .map_err(|e| win_err("failed to get device", e))?
        };
        Ok((device, endpoint.capture))
    }
}

impl Default for WindowsMixerHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MixerHost for WindowsMixerHost {
    fn endpoints(&mut self) -> Result<Vec<EndpointInfo>, MixerError> {
        ensure_com();
        let enumerator = device_enumerator()?;
        let default_capture = unsafe {
            enumerator.GetDefaultAudioEndpoint(eCapture, eConsole).ok().and_then(|d| device_id(&d).ok())
        };
        let default_render = unsafe {
            enumerator.GetDefaultAudioEndpoint(eRender, eConsole).ok().and_then(|d| device_id(&d).ok())
        };

        let mut endpoints = Vec::new();
        let mut infos = Vec::new();
        for (flow, capture) in [(eCapture, true), (eRender, false)] {
            let collection = unsafe {
                enumerator
                    .EnumAudioEndpoints(flow, DEVICE_STATE_ACTIVE)
                    .map_err(|e| win_err("failed to enumerate endpoints", e))?
            };
            let count =
                unsafe { collection.GetCount().map_err(|e| win_err("failed to count endpoints", e))? };
            for i in 0..count {
                let Ok(device) = (unsafe { collection.Item(i) }) else { continue };
                let Ok(id) = device_id(&device) else { continue };
                let Ok(format) = probe_device_format(&device) else { continue };
                let default = if capture {
                    default_capture.as_deref() == Some(id.as_str())
                } else {
                    default_render.as_deref() == Some(id.as_str())
                };
                infos.push(EndpointInfo {
                    name: device_name(&device),
                    input_channels: if capture { format.channels } else { 0 },
                    output_channels: if capture { 0 } else { format.channels },
                    sample_rate: format.sample_rate,
                    default_input: capture && default,
                    default_output: !capture && default,
                });
                endpoints.push(WindowsEndpoint { id, capture });
            }
        }
        self.endpoints = endpoints;
        Ok(infos)
    }

    fn probe_format(&mut self, endpoint: usize, input: bool) -> Result<MixFormat, MixerError> {
        ensure_com();
        let (device, capture) = self.endpoint_device(endpoint)?;
        if capture != input {
            return Err(MixerError(format!("endpoint {endpoint} has no {} side", if input { "capture" } else { "render" })));
        }
        let format = probe_device_format(&device)?;
        Ok(MixFormat {
            sample_rate: format.sample_rate,
            channels: format.channels,
            sample_type: format.sample_type,
        })
    }

    fn open_session(
        &mut self,
        input: Option<usize>,
        output: Option<usize>,
    ) -> Result<Box<dyn MixerSession>, MixerError> {
        ensure_com();
        let capture = match input {
            Some(endpoint) => {
                let (device, is_capture) = self.endpoint_device(endpoint)?;
                if !is_capture {
                    return Err(MixerError(format!("endpoint {endpoint} is not a capture endpoint")));
                }
                Some(CaptureSide::open(&device)?)
            }
            None => None,
        };
        let render = match output {
            Some(endpoint) => {
                let (device, is_capture) = self.endpoint_device(endpoint)?;
                if is_capture {
                    return Err(MixerError(format!("endpoint {endpoint} is not a render endpoint")));
                }
                Some(RenderSide::open(&device)?)
            }
            None => None,
        };
        debug!(input = input.is_some(), output = output.is_some(), "WASAPI session opened");
        Ok(Box::new(WindowsMixerSession { capture, render }))
    }
}

/// Activates and initializes an event-driven shared-mode client, returning
/// the client, its buffer length and the mix-format frame size.
unsafe fn initialize_client(
    device: &IMMDevice,
    event: HANDLE,
) -> Result<(IAudioClient, u32, usize), MixerError> {
    let client: IAudioClient = device
        .Activate(CLSCTX_ALL, None)
        .map_err(|e| win_err("failed to activate audio client", e))?;
    let format_ptr = client.GetMixFormat().map_err(|e| win_err("failed to get mix format", e))?;
    let frame_bytes = (*format_ptr).nBlockAlign as usize;
    let init = client.Initialize(
        AUDCLNT_SHAREMODE_SHARED,
        AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
        BUFFER_DURATION,
        0,
        format_ptr,
        None,
    );
    CoTaskMemFree(Some(format_ptr as *const _));
    init.map_err(|e| win_err("failed to initialize audio client", e))?;
    client.SetEventHandle(event).map_err(|e| win_err("failed to set event handle", e))?;
    let buffer_frames =
        client.GetBufferSize().map_err(|e| win_err("failed to get buffer size", e))?;
    Ok((client, buffer_frames, frame_bytes))
}

struct CaptureSide {
    client: IAudioClient,
    capture: IAudioCaptureClient,
    event: HANDLE,
    buffer_frames: u32,
    frame_bytes: usize,
}

impl CaptureSide {
    fn open(device: &IMMDevice) -> Result<Self, MixerError> {
        unsafe {
            let event = CreateEventW(None, false, false, None)
                .map_err(|e| win_err("failed to create event", e))?;
            let (client, buffer_frames, frame_bytes) = match initialize_client(device, event) {
                Ok(parts) => parts,
                Err(error) => {
                    let _ = CloseHandle(event);
                    return Err(error);
                }
            };
            let capture: IAudioCaptureClient = client
                .GetService()
                .map_err(|e| win_err("failed to get capture client", e))?;
            Ok(CaptureSide { client, capture, event, buffer_frames, frame_bytes })
        }
    }
}

impl Drop for CaptureSide {
    fn drop(&mut self) {
        unsafe {
            let _ = self.client.Stop();
            if !self.event.is_invalid() {
                let _ = CloseHandle(self.event);
            }
        }
    }
}

struct RenderSide {
    client: IAudioClient,
    render: IAudioRenderClient,
    event: HANDLE,
    buffer_frames: u32,
    frame_bytes: usize,
}

impl RenderSide {
    fn open(device: &IMMDevice) -> Result<Self, MixerError> {
        unsafe {
            let event = CreateEventW(None, false, false, None)
                .map_err(|e| win_err("failed to create event", e))?;
            let (client, buffer_frames, frame_bytes) = match initialize_client(device, event) {
                Ok(parts) => parts,
                Err(error) => {
                    let _ = CloseHandle(event);
                    return Err(error);
                }
            };
            let render: IAudioRenderClient = client
                .GetService()
                .map_err(|e| win_err("failed to get render client", e))?;
            Ok(RenderSide { client, render, event, buffer_frames, frame_bytes })
        }
    }
}

impl Drop for RenderSide {
    fn drop(&mut self) {
        unsafe {
            let _ = self.client.Stop();
            if !self.event.is_invalid() {
                let _ = CloseHandle(self.event);
            }
        }
    }
}

pub struct WindowsMixerSession {
    capture: Option<CaptureSide>,
    render: Option<RenderSide>,
}

// The session is created on the control thread and driven from the worker.
// All clients live in the MTA, so cross-thread calls are sound.
unsafe impl Send for WindowsMixerSession {}

impl MixerSession for WindowsMixerSession {
    fn start(&mut self) -> Result<(), MixerError> {
        ensure_com();
        unsafe {
            if let Some(side) = &self.capture {
                side.client.Start().map_err(|e| win_err("failed to start capture client", e))?;
            }
            if let Some(side) = &self.render {
                side.client.Start().map_err(|e| win_err("failed to start render client", e))?;
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        unsafe {
            if let Some(side) = &self.capture {
                let _ = side.client.Stop();
            }
            if let Some(side) = &self.render {
                let _ = side.client.Stop();
            }
        }
    }

    fn capture_buffer_frames(&self) -> usize {
        self.capture.as_ref().map_or(0, |side| side.buffer_frames as usize)
    }

    fn render_buffer_frames(&self) -> usize {
        self.render.as_ref().map_or(0, |side| side.buffer_frames as usize)
    }

    fn wait_ready(&mut self, interest: Interest, timeout: Duration) -> Result<Ready, MixerError> {
        let mut handles: Vec<HANDLE> = Vec::with_capacity(2);
        let mut order: Vec<Ready> = Vec::with_capacity(2);
        if matches!(interest, Interest::Capture | Interest::Both) {
            if let Some(side) = &self.capture {
                handles.push(side.event);
                order.push(Ready::Capture);
            }
        }
        if matches!(interest, Interest::Render | Interest::Both) {
            if let Some(side) = &self.render {
                handles.push(side.event);
                order.push(Ready::Render);
            }
        }
        if handles.is_empty() {
            return Err(MixerError("no client to wait on".to_string()));
        }
        let result =
            unsafe { WaitForMultipleObjects(&handles, false, timeout.as_millis() as u32) };
        if result == WAIT_TIMEOUT {
            return Ok(Ready::Timeout);
        }
        let index = result.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
        order
            .get(index)
            .copied()
            .ok_or_else(|| MixerError(format!("wait failed with status {:#x}", result.0)))
    }

    fn capture_available(&mut self) -> Result<usize, MixerError> {
        let Some(side) = &self.capture else { return Ok(0) };
        unsafe {
            side.capture
                .GetNextPacketSize()
                .map(|frames| frames as usize)
                .map_err(|e| win_err("failed to get packet size", e))
        }
    }

    fn read_capture(&mut self, buffer: &mut [u8]) -> Result<usize, MixerError> {
        let Some(side) = &self.capture else { return Ok(0) };
        unsafe {
            let mut data: *mut u8 = std::ptr::null_mut();
            let mut frames: u32 = 0;
            let mut flags: u32 = 0;
            side.capture
                .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                .map_err(|e| win_err("failed to get capture buffer", e))?;
            let bytes = (frames as usize * side.frame_bytes).min(buffer.len());
            if flags & AUDCLNT_BUFFERFLAGS_SILENT as u32 != 0 {
                buffer[..bytes].fill(0);
            } else {
                buffer[..bytes].copy_from_slice(std::slice::from_raw_parts(data, bytes));
            }
            side.capture
                .ReleaseBuffer(frames)
                .map_err(|e| win_err("failed to release capture buffer", e))?;
            Ok(bytes / side.frame_bytes)
        }
    }

    fn render_free(&mut self) -> Result<usize, MixerError> {
        let Some(side) = &self.render else { return Ok(0) };
        unsafe {
            let padding = side
                .client
                .GetCurrentPadding()
                .map_err(|e| win_err("failed to get render padding", e))?;
            Ok((side.buffer_frames - padding) as usize)
        }
    }

    fn write_render(&mut self, buffer: &[u8], frames: usize) -> Result<(), MixerError> {
        let Some(side) = &self.render else { return Ok(()) };
        unsafe {
            let data = side
                .render
                .GetBuffer(frames as u32)
                .map_err(|e| win_err("failed to get render buffer", e))?;
            let bytes = frames * side.frame_bytes;
            std::slice::from_raw_parts_mut(data, bytes).copy_from_slice(&buffer[..bytes]);
            side.render
                .ReleaseBuffer(frames as u32, 0)
                .map_err(|e| win_err("failed to release render buffer", e))?;
        }
        Ok(())
    }
}
