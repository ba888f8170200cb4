//! Mixing-service backend driven end to end through a mock service.

mod common;

use std::time::{Duration, Instant};

use duplexio::backend::mixer::native::MixSampleType;
use duplexio::{Api, DeviceSelector, Error, SampleFormat, Stream, StreamParameters, StreamState};

use common::{MockEndpoint, MockMixerHost};

fn duplex_endpoints(rate: f64) -> Vec<MockEndpoint> {
    vec![MockEndpoint::capture("Mic", 1, rate), MockEndpoint::render("Speakers", 1, rate)]
}

fn duplex_params(buffer_size: usize) -> StreamParameters {
    StreamParameters {
        input: DeviceSelector::Default,
        output: DeviceSelector::Default,
        buffer_size: Some(buffer_size),
        sample_rate: None,
        resampling: true,
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes.chunks_exact(4).map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for the worker");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn lifecycle_follows_the_state_machine() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let mut stream = Stream::with_mixer_host(Box::new(host));

    assert_eq!(stream.start(), Err(Error::NotOpen));
    assert_eq!(stream.stop(), Err(Error::NotOpen));
    assert_eq!(stream.close(), Err(Error::NotOpen));

    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    stream.open(duplex_params(4)).unwrap();
    assert_eq!(stream.state(), StreamState::Opened);
    assert_eq!(stream.open(duplex_params(4)), Err(Error::AlreadyOpen));
    assert_eq!(stream.stop(), Err(Error::NotRunning));

    stream.start().unwrap();
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(stream.start(), Err(Error::AlreadyRunning));

    stream.stop().unwrap();
    assert_eq!(stream.state(), StreamState::Opened);
    stream.close().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);

    // The callback survives close, so the stream can be reopened as-is.
    stream.open(duplex_params(4)).unwrap();
    assert_eq!(stream.state(), StreamState::Opened);
    stream.close().unwrap();
}

#[test]
fn default_selectors_resolve_per_direction() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    stream.open(StreamParameters::default()).unwrap();

    let info = stream.information();
    assert_eq!(info.input_device, Some(0));
    assert_eq!(info.output_device, Some(1));
    assert_eq!(info.input_channels, 1);
    assert_eq!(info.output_channels, 1);
    assert_eq!(info.sample_rate, 48000.0);
    assert_eq!(info.buffer_size, 256);
    assert_eq!(info.input_format, Some(SampleFormat::F32));
    assert_eq!(info.output_format, Some(SampleFormat::F32));
}

#[test]
fn missing_default_device_is_not_present() {
    let host = MockMixerHost::new(vec![MockEndpoint::render("Speakers", 2, 48000.0)]);
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    assert_eq!(stream.open(StreamParameters::default()), Err(Error::NotPresent));
}

#[test]
fn stream_without_any_device_is_rejected() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    let params = StreamParameters {
        input: DeviceSelector::NoDevice,
        output: DeviceSelector::NoDevice,
        ..StreamParameters::default()
    };
    assert_eq!(stream.open(params), Err(Error::NotPresent));
}

#[test]
fn endpoints_with_different_rates_are_an_invalid_duplex_pair() {
    let endpoints =
        vec![MockEndpoint::capture("Mic", 1, 44100.0), MockEndpoint::render("Speakers", 1, 48000.0)];
    let mut stream = Stream::with_mixer_host(Box::new(MockMixerHost::new(endpoints)));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    assert_eq!(stream.open(StreamParameters::default()), Err(Error::InvalidDuplex));
}

#[test]
fn rate_mismatch_honors_the_resampling_flag() {
    let mut stream =
        Stream::with_mixer_host(Box::new(MockMixerHost::new(duplex_endpoints(48000.0))));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();

    let mut params = duplex_params(4);
    params.sample_rate = Some(44100.0);
    params.resampling = false;
    assert_eq!(stream.open(params), Err(Error::InvalidSampleRate));

    params.resampling = true;
    stream.open(params).unwrap();
    // The service's pinned rate wins.
    assert_eq!(stream.information().sample_rate, 48000.0);
}

#[test]
fn packed_24_bit_mixes_are_unsupported() {
    let mut endpoints = duplex_endpoints(48000.0);
    endpoints[0].sample_type = MixSampleType::I24;
    let mut stream = Stream::with_mixer_host(Box::new(MockMixerHost::new(endpoints)));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    assert_eq!(stream.open(StreamParameters::default()), Err(Error::UnsupportedSampleFormat));
    assert_eq!(stream.state(), StreamState::Closed);
}

#[test]
fn zero_buffer_size_is_rejected() {
    let mut stream =
        Stream::with_mixer_host(Box::new(MockMixerHost::new(duplex_endpoints(48000.0))));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    assert_eq!(stream.open(duplex_params(0)), Err(Error::InvalidBufferSize));
}

#[test]
fn duplex_worker_loops_capture_back_to_render() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream
        .set_callback::<f32, f32, _>(|input, mut output, _| {
            let frames = input.channel(0).to_vec();
            output.channel_mut(0).copy_from_slice(&frames);
        })
        .unwrap();
    stream.open(duplex_params(4)).unwrap();

    let mut staged = Vec::new();
    for packet in 0..8 {
        let values: Vec<f32> = (0..4).map(|i| (packet * 4 + i) as f32 / 100.0).collect();
        staged.extend_from_slice(&values);
        tap.lock().unwrap().capture_packets.push_back(f32_bytes(&values));
    }

    stream.start().unwrap();
    wait_for(|| tap.lock().unwrap().rendered.len() >= staged.len() * 4);
    stream.stop().unwrap();

    let rendered = f32_values(&tap.lock().unwrap().rendered);
    assert_eq!(&rendered[..staged.len()], staged.as_slice());
}

#[test]
fn worker_converts_between_device_and_callback_formats() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    // The device mixes in f32; the callback is bound with i16.
    stream
        .set_callback::<i16, i16, _>(|input, mut output, _| {
            let frames = input.channel(0).to_vec();
            output.channel_mut(0).copy_from_slice(&frames);
        })
        .unwrap();
    stream.open(duplex_params(4)).unwrap();
    tap.lock().unwrap().capture_packets.push_back(f32_bytes(&[0.5; 4]));

    stream.start().unwrap();
    wait_for(|| tap.lock().unwrap().rendered.len() >= 16);
    stream.stop().unwrap();

    let rendered = f32_values(&tap.lock().unwrap().rendered);
    for value in &rendered[..4] {
        // 0.5 quantized through i16 and back.
        assert!((value - 0.5).abs() < 1e-3, "got {value}");
    }
}

#[test]
fn output_only_stream_renders_without_capture() {
    let host = MockMixerHost::new(vec![MockEndpoint::render("Speakers", 1, 48000.0)]);
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream
        .set_callback::<f32, f32, _>(|input, mut output, _| {
            assert_eq!(input.channels(), 0);
            output.channel_mut(0).fill(0.25);
        })
        .unwrap();
    let params = StreamParameters {
        input: DeviceSelector::NoDevice,
        output: DeviceSelector::Default,
        buffer_size: Some(4),
        sample_rate: None,
        resampling: true,
    };
    stream.open(params).unwrap();
    let info = stream.information();
    assert_eq!(info.input_channels, 0);
    assert_eq!(info.input_format, None);

    stream.start().unwrap();
    wait_for(|| !tap.lock().unwrap().rendered.is_empty());
    stream.stop().unwrap();

    let rendered = f32_values(&tap.lock().unwrap().rendered);
    assert!(rendered.iter().all(|v| *v == 0.25));
}

#[test]
fn render_side_reporting_extra_free_frames_is_clamped() {
    let mut host = MockMixerHost::new(vec![MockEndpoint::render("Speakers", 1, 48000.0)]);
    // More free frames than the 512-frame hardware buffer holds.
    host.render_free_frames = 4096;
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream
        .set_callback::<f32, f32, _>(|_, mut output, _| {
            output.channel_mut(0).fill(0.125);
        })
        .unwrap();
    let params = StreamParameters {
        input: DeviceSelector::NoDevice,
        output: DeviceSelector::Default,
        buffer_size: Some(4),
        sample_rate: None,
        resampling: true,
    };
    stream.open(params).unwrap();
    stream.start().unwrap();

    wait_for(|| tap.lock().unwrap().rendered.len() >= 2048);
    assert_eq!(stream.state(), StreamState::Running);
    stream.stop().unwrap();

    let rendered = f32_values(&tap.lock().unwrap().rendered);
    assert!(rendered.iter().all(|v| *v == 0.125));
}

#[test]
fn a_panicked_worker_surfaces_through_stop() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream
        .set_callback::<f32, f32, _>(|_, _, _| panic!("callback blew up"))
        .unwrap();
    stream.open(duplex_params(4)).unwrap();
    tap.lock().unwrap().capture_packets.push_back(f32_bytes(&[0.0; 4]));

    stream.start().unwrap();
    wait_for(|| tap.lock().unwrap().capture_packets.is_empty());
    assert_eq!(stream.stop(), Err(Error::Fail));

    // The binding died with the worker; a restart must fail before it
    // touches the service again.
    assert_eq!(stream.start(), Err(Error::NoCallback));
    assert_eq!(tap.lock().unwrap().sessions_opened, 1);
    stream.close().unwrap();
}

#[test]
fn restart_opens_a_fresh_session_with_the_same_callback() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    stream.open(duplex_params(4)).unwrap();

    stream.start().unwrap();
    stream.stop().unwrap();
    assert!(tap.lock().unwrap().stopped);

    stream.start().unwrap();
    assert_eq!(stream.state(), StreamState::Running);
    assert_eq!(tap.lock().unwrap().sessions_opened, 2);
    stream.close().unwrap();
}

#[test]
fn close_while_running_joins_the_worker() {
    let host = MockMixerHost::new(duplex_endpoints(48000.0));
    let tap = host.tap();
    let mut stream = Stream::with_mixer_host(Box::new(host));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    stream.open(duplex_params(4)).unwrap();
    stream.start().unwrap();

    stream.close().unwrap();
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(tap.lock().unwrap().stopped);
}

#[test]
fn the_service_owns_the_sample_rate() {
    let mut stream =
        Stream::with_mixer_host(Box::new(MockMixerHost::new(duplex_endpoints(48000.0))));
    assert_eq!(stream.set_sample_rate(44100.0), Err(Error::NotOpen));
    stream.set_callback::<f32, f32, _>(|_, _, _| {}).unwrap();
    stream.open(duplex_params(4)).unwrap();
    assert_eq!(stream.set_sample_rate(44100.0), Err(Error::InvalidSampleRate));
}

#[test]
fn enumeration_reports_both_directions() {
    let mut stream =
        Stream::with_mixer_host(Box::new(MockMixerHost::new(duplex_endpoints(48000.0))));
    let devices = stream.devices().unwrap().to_vec();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name, "Mic");
    assert_eq!(devices[0].input_channels, 1);
    assert_eq!(devices[0].output_channels, 0);
    assert!(devices[0].default_device);
    assert_eq!(devices[1].name, "Speakers");
    assert_eq!(devices[1].output_channels, 1);
    assert_eq!(devices[0].api, Api::Mixer);
    assert_eq!(stream.api(), Some(Api::Mixer));
}

#[test]
fn channel_metadata_is_a_driver_feature() {
    let mut stream =
        Stream::with_mixer_host(Box::new(MockMixerHost::new(duplex_endpoints(48000.0))));
    assert_eq!(stream.channel_info(0, 0, true), Err(Error::NoApi));
    assert_eq!(stream.open_control_panel(), Err(Error::NoApi));
}

#[test]
fn unbound_streams_fail_every_operation() {
    let mut stream = Stream::unbound();
    assert_eq!(stream.api(), None);
    assert_eq!(stream.state(), StreamState::Closed);
    assert_eq!(stream.information(), duplexio::StreamInformation::default());
    assert!(matches!(stream.devices(), Err(Error::NoApi)));
    assert_eq!(stream.set_callback::<f32, f32, _>(|_, _, _| {}), Err(Error::NoApi));
    assert_eq!(stream.open(StreamParameters::default()), Err(Error::NoApi));
    assert_eq!(stream.start(), Err(Error::NoApi));
    assert_eq!(stream.close(), Err(Error::NoApi));
}
