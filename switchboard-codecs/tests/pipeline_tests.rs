//! Built-in transcoders driven through patches and calls

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_codecs::g711::ulaw_to_linear;
use switchboard_codecs::video::yuv420p_size;
use switchboard_codecs::{builtin_registry, VideoCodec, VideoDecoder, VideoEncoder};
use switchboard_core::{
    well_known, CallEndReason, CallManager, LocalEndpoint, LocalEndpointConfig, ManagerConfig,
    MediaCommand, MediaFrame, MediaPatch, MediaStream, MemoryMediaStream, PatchConfig, Transcoder,
};

const WAIT: Duration = Duration::from_secs(5);

fn endpoint(prefix: &str, formats: &[&str]) -> Arc<LocalEndpoint> {
    LocalEndpoint::new(LocalEndpointConfig {
        prefix: prefix.to_string(),
        formats: formats.iter().map(|f| f.to_string()).collect(),
        ..Default::default()
    })
    .unwrap()
}

fn manager(endpoints: &[Arc<LocalEndpoint>]) -> Arc<CallManager> {
    let manager = CallManager::new(ManagerConfig::default(), builtin_registry().unwrap());
    for endpoint in endpoints {
        manager.attach_endpoint(endpoint.clone());
    }
    manager
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn picture(seed: u8) -> Vec<u8> {
    let size = yuv420p_size(352, 288).unwrap();
    (0..size).map(|i| ((i / 7) as u8).wrapping_add(seed)).collect()
}

#[test]
fn passive_patch_compands_pcm() {
    let pcm = well_known::get(well_known::PCM16).unwrap();
    let pcmu = well_known::get(well_known::PCMU).unwrap();

    let source = Arc::new(MemoryMediaStream::source(pcm, 1).passive());
    let sink = Arc::new(MemoryMediaStream::sink(pcmu, 1));
    let patch = MediaPatch::new(
        source.clone(),
        Arc::new(builtin_registry().unwrap()),
        PatchConfig::default(),
        false,
    )
    .unwrap();
    patch.add_sink(sink.clone()).unwrap();

    // The encoder wants 20 ms of linear audio per packet
    assert_eq!(source.data_size(), 320);
    assert_eq!(sink.data_size(), 160);

    let samples: Vec<i16> = (0..160).map(|i| ((i as i16) - 80) * 300).collect();
    let payload: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let mut frame = MediaFrame::new(255, 160, payload);
    assert!(patch.push_frame(&mut frame).unwrap());

    let written = sink.written();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].payload_type, 0);
    assert_eq!(written[0].timestamp, 160);
    assert_eq!(written[0].payload_len(), 160);

    for (original, &coded) in samples.iter().zip(written[0].payload.iter()) {
        let error = (i32::from(*original) - i32::from(ulaw_to_linear(coded))).abs();
        assert!(error <= (i32::from(*original).abs() / 16).max(32));
    }
    patch.close();
}

#[test]
fn call_transcodes_pcm_to_alaw() {
    let a = endpoint("a", &["PCM-16"]);
    let b = endpoint("b", &["PCMA"]);
    let m = manager(&[a.clone(), b.clone()]);

    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    assert!(call.is_established());
    let connections = call.connections();
    let alice = a.find_connection(&connections[0].token()).unwrap();
    let bob = b.find_connection(&connections[1].token()).unwrap();

    let source = alice.source_stream(1).unwrap();
    assert_eq!(source.media_format().name(), "PCM-16");
    let stats = source.patch().unwrap().statistics();
    assert_eq!(stats.sinks[0].transcoders, vec!["PCM-16->PCMA".to_string()]);

    source.push(MediaFrame::new(255, 0, vec![0u8; 320]));
    let sink = bob.sink_stream(1).unwrap();
    assert!(sink.wait_for_written(1, WAIT));
    let frame = &sink.written()[0];
    assert_eq!(frame.payload_type, 8);
    assert!(frame.payload.iter().all(|&b| b == 0xD5));

    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn call_transcodes_h264_to_vp8() {
    let a = endpoint("a", &["H.264"]);
    let b = endpoint("b", &["VP8"]);
    let m = manager(&[a.clone(), b.clone()]);

    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let connections = call.connections();
    let alice = a.find_connection(&connections[0].token()).unwrap();
    let bob = b.find_connection(&connections[1].token()).unwrap();

    let source = alice.source_stream(2).unwrap();
    let stats = source.patch().unwrap().statistics();
    assert_eq!(
        stats.sinks[0].transcoders,
        vec!["H.264->YUV420P".to_string(), "YUV420P->VP8".to_string()]
    );

    let yuv = well_known::get(well_known::YUV420P).unwrap();
    let mut encoder =
        VideoEncoder::new(VideoCodec::H264, yuv.clone(), well_known::get("H.264").unwrap())
            .unwrap();
    let original = picture(5);
    for packet in encoder.convert(&MediaFrame::new(127, 0, original.clone())).unwrap() {
        source.push(packet);
    }

    let sink = bob.sink_stream(2).unwrap();
    assert!(eventually(|| sink.written().iter().any(|f| f.marker)));

    let mut decoder =
        VideoDecoder::new(VideoCodec::Vp8, well_known::get("VP8").unwrap(), yuv).unwrap();
    let decoded: Vec<MediaFrame> = sink
        .written()
        .iter()
        .inspect(|f| assert_eq!(f.payload_type, 97))
        .flat_map(|f| decoder.convert(f).unwrap())
        .collect();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].payload.as_ref(), original.as_slice());

    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn decoder_without_reference_asks_source_for_key_frame() {
    let a = endpoint("a", &["H.264"]);
    let b = endpoint("b", &["VP8"]);
    let m = manager(&[a.clone(), b.clone()]);

    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let alice = a
        .find_connection(&call.connections()[0].token())
        .unwrap();
    let source = alice.source_stream(2).unwrap();

    let yuv = well_known::get(well_known::YUV420P).unwrap();
    let mut encoder =
        VideoEncoder::new(VideoCodec::H264, yuv, well_known::get("H.264").unwrap()).unwrap();
    let still = picture(0);
    // Key frame is lost on the way
    encoder.convert(&MediaFrame::new(127, 0, still.clone())).unwrap();
    for packet in encoder.convert(&MediaFrame::new(127, 3000, still)).unwrap() {
        source.push(packet);
    }

    assert!(eventually(|| source
        .commands()
        .contains(&MediaCommand::VideoUpdatePicture)));
    call.clear(CallEndReason::LocalUser, None);
}
