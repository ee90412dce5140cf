//! End-to-end call scenarios over local endpoints

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::recording::read_raw_recording;
use switchboard_core::{
    well_known, CallEndReason, CallError, CallEvent, CallManager, CallState, Connection,
    ConnectionPhase, ContentRole, FnTranscoder, LocalConnection, LocalEndpoint,
    LocalEndpointConfig, ManagerConfig, MediaFrame, MediaStream, MediaType, RecordEntry,
    RecordingOptions, TranscoderError, TranscoderRegistry,
};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(2);

fn endpoint(prefix: &str, formats: &[&str], autostart: bool) -> Arc<LocalEndpoint> {
    LocalEndpoint::new(LocalEndpointConfig {
        prefix: prefix.to_string(),
        formats: formats.iter().map(|f| f.to_string()).collect(),
        autostart,
        ..Default::default()
    })
    .unwrap()
}

fn manager(registry: TranscoderRegistry, endpoints: &[Arc<LocalEndpoint>]) -> Arc<CallManager> {
    let manager = CallManager::new(ManagerConfig::default(), registry);
    for endpoint in endpoints {
        manager.attach_endpoint(endpoint.clone());
    }
    manager
}

fn video_registry() -> TranscoderRegistry {
    let mut registry = TranscoderRegistry::new();
    let yuv = well_known::get(well_known::YUV420P).unwrap();
    for codec in [well_known::H264, well_known::VP8] {
        let codec = well_known::get(codec).unwrap();
        for (from, to) in [(codec.clone(), yuv.clone()), (yuv.clone(), codec.clone())] {
            registry.register(from, to, |i, o| {
                let pt = o.payload_type();
                Ok(Box::new(FnTranscoder::new(i.clone(), o.clone(), move |f| {
                    let mut out = f.clone();
                    out.payload_type = pt;
                    Ok(vec![out])
                })))
            });
        }
    }
    registry
}

fn parties(
    call: &switchboard_core::Call,
    a: &LocalEndpoint,
    b: &LocalEndpoint,
) -> (Arc<LocalConnection>, Arc<LocalConnection>) {
    let connections = call.connections();
    (
        a.find_connection(&connections[0].token()).unwrap(),
        b.find_connection(&connections[1].token()).unwrap(),
    )
}

#[test]
fn happy_path_negotiates_common_codec_without_transcoding() {
    let a = endpoint("a", &["PCMU", "PCMA", "G.729"], true);
    let b = endpoint("b", &["G.729", "G.711"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);

    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    assert!(call.is_established());
    assert_eq!(call.state(), CallState::Established);
    assert_eq!(call.party_a(), "alice");
    assert_eq!(call.party_b(), "bob");

    let (alice, bob) = parties(&call, &a, &b);
    let forward = alice.source_stream(1).unwrap();
    let reverse = bob.source_stream(1).unwrap();
    assert_eq!(forward.media_format().name(), "G.729");
    assert_eq!(reverse.media_format().name(), "G.729");
    assert_eq!(bob.sink_stream(1).unwrap().media_format().name(), "G.729");

    let stats = forward.patch().unwrap().statistics();
    assert_eq!(stats.sinks.len(), 1);
    assert!(stats.sinks[0].transcoders.is_empty());

    // Two G.729 frames per packet.
    assert_eq!(forward.data_size(), 20);
    assert_eq!(forward.frame_time(), 160);

    call.clear(CallEndReason::LocalUser, None);
    assert!(call.is_cleared());
}

#[test]
fn media_flows_between_established_parties() {
    let a = endpoint("a", &["PCMU"], true);
    let b = endpoint("b", &["PCMU"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);

    let source = alice.source_stream(1).unwrap();
    for i in 0..3u32 {
        source.push(MediaFrame::new(0, i * 160, vec![0xffu8; 160]));
    }
    let sink = bob.sink_stream(1).unwrap();
    assert!(sink.wait_for_written(3, WAIT));
    let timestamps: Vec<u32> = sink.written().iter().map(|f| f.timestamp).collect();
    assert_eq!(timestamps, vec![0, 160, 320]);

    call.clear(CallEndReason::LocalUser, None);
    assert!(!source.is_open());
    assert!(!sink.is_open());
}

#[test]
fn transcoded_path_goes_through_intermediate() {
    let a = endpoint("a", &["H.264"], true);
    let b = endpoint("b", &["VP8"], true);
    let m = manager(video_registry(), &[a.clone(), b.clone()]);

    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);
    let source = alice.source_stream(2).unwrap();
    assert_eq!(source.media_format().name(), "H.264");

    let stats = source.patch().unwrap().statistics();
    assert_eq!(
        stats.sinks[0].transcoders,
        vec!["H.264->YUV420P".to_string(), "YUV420P->VP8".to_string()]
    );

    source.push(MediaFrame::new(96, 0, vec![1u8, 2, 3]).with_marker(true));
    let sink = bob.sink_stream(2).unwrap();
    assert!(sink.wait_for_written(1, WAIT));
    assert_eq!(sink.written()[0].payload_type, 97);

    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn no_common_format_fails_media() {
    let a = endpoint("a", &["H.264"], false);
    let b = endpoint("b", &["VP8"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, _) = parties(&call, &a, &b);

    let result = call.open_source_media_streams(alice.as_ref(), MediaType::Video, 0, None, None);
    assert!(matches!(
        result,
        Err(CallError::Negotiation(TranscoderError::NoCompatibleFormats(_)))
    ));
    assert!(alice.source_stream(2).is_none());
    call.clear(CallEndReason::NoCompatibleMedia, None);
}

#[test]
fn content_role_filters_formats() {
    let a = endpoint("a", &["H.264"], false);
    let b = endpoint("b", &["H.264"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, _) = parties(&call, &a, &b);

    let result = call.open_source_media_streams(
        alice.as_ref(),
        MediaType::Video,
        0,
        None,
        Some(ContentRole::Speaker),
    );
    assert!(result.is_err());

    call.open_source_media_streams(
        alice.as_ref(),
        MediaType::Video,
        0,
        None,
        Some(ContentRole::Slides),
    )
    .unwrap();
    assert!(alice.source_stream(2).is_some());
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn reopening_matching_source_is_a_no_op() {
    let a = endpoint("a", &["PCMU", "PCMA"], true);
    let b = endpoint("b", &["PCMU", "PCMA"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, _) = parties(&call, &a, &b);

    let before = alice.source_stream(1).unwrap();
    let pcmu = well_known::get(well_known::PCMU).unwrap();
    call.open_source_media_streams(alice.as_ref(), MediaType::Audio, 1, Some(&pcmu), None)
        .unwrap();
    let after = alice.source_stream(1).unwrap();
    assert_eq!(before.id(), after.id());
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn release_collapses_call_with_same_reason() {
    let a = endpoint("a", &["PCMU"], true);
    let b = endpoint("b", &["PCMU"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);

    bob.release(CallEndReason::RemoteUser);
    assert_eq!(alice.phase(), ConnectionPhase::Released);
    assert_eq!(alice.call_end_reason(), Some(CallEndReason::RemoteUser));
    assert!(call.is_cleared());
    assert_eq!(call.end_reason(), Some(CallEndReason::RemoteUser));
    assert_eq!(call.state(), CallState::Cleared);
    assert_eq!(m.call_count(), 0);
}

#[test]
fn third_party_release_keeps_call_up() {
    let a = endpoint("a", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let call = m.set_up_call("a:alice", "a:bob").unwrap();
    let carol = m.make_connection(&call, "a:carol").unwrap();
    assert_eq!(call.connection_count(), 3);

    carol.release(CallEndReason::RemoteUser);
    assert_eq!(call.connection_count(), 2);
    assert!(!call.is_clearing());
    call.clear(CallEndReason::LocalUser, None);
    assert_eq!(call.end_reason(), Some(CallEndReason::RemoteUser));
}

#[test]
fn clearing_call_refuses_new_work() {
    let a = endpoint("a", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let call = m.set_up_call("a:alice", "a:bob").unwrap();
    let first = call.connections()[0].clone();
    call.clear(CallEndReason::LocalUser, None);

    assert!(matches!(
        call.open_source_media_streams(first.as_ref(), MediaType::Audio, 1, None, None),
        Err(CallError::Clearing)
    ));
    assert!(matches!(
        m.make_connection(&call, "a:dave"),
        Err(CallError::Clearing)
    ));
    assert!(!call.on_set_up(first.as_ref()));
}

#[test]
fn unreachable_party_b_clears_with_no_user() {
    let a = endpoint("a", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let mut events = m.subscribe_events();

    let result = m.set_up_call("a:alice", "sip:bob@example.com");
    assert!(result.is_err());
    assert_eq!(m.call_count(), 0);

    let mut cleared = None;
    while let Ok(event) = events.try_recv() {
        if let CallEvent::Cleared { reason, .. } = event {
            cleared = Some(reason);
        }
    }
    assert_eq!(cleared, Some(CallEndReason::NoUser));
}

#[test]
fn events_follow_call_lifecycle() {
    let a = endpoint("a", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let mut events = m.subscribe_events();

    let call = m.set_up_call("a:alice", "a:bob").unwrap();
    call.clear(CallEndReason::LocalUser, None);

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.call_token(), call.token());
        received.push(event);
    }
    assert_eq!(received.len(), 4);
    assert!(matches!(received[0], CallEvent::NewConnection { .. }));
    assert!(matches!(received[1], CallEvent::NewConnection { .. }));
    assert!(matches!(received[2], CallEvent::Established { .. }));
    assert_eq!(
        received[3],
        CallEvent::Cleared {
            call: call.token().to_string(),
            reason: CallEndReason::LocalUser,
        }
    );
}

#[tokio::test]
async fn clear_signals_sync_handle() {
    let a = endpoint("a", &["PCMU"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let call = m.set_up_call("a:alice", "a:bob").unwrap();

    let (tx, rx) = oneshot::channel();
    call.clear(CallEndReason::RemoteUser, Some(tx));
    assert_eq!(rx.await.unwrap(), CallEndReason::RemoteUser);

    // Already cleared: signalled at once with the latched reason.
    let (tx, rx) = oneshot::channel();
    call.clear(CallEndReason::LocalUser, Some(tx));
    assert_eq!(rx.await.unwrap(), CallEndReason::RemoteUser);
}

#[test]
fn hold_blocks_new_media_and_pauses_sinks() {
    let a = endpoint("a", &["PCMU"], true);
    let b = endpoint("b", &["PCMU"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);

    assert!(call.hold());
    assert!(call.is_on_hold());
    assert!(bob.sink_stream(1).unwrap().is_paused());
    assert!(matches!(
        call.open_source_media_streams(alice.as_ref(), MediaType::Audio, 1, None, None),
        Err(CallError::OnHold)
    ));

    assert!(call.retrieve());
    assert!(!call.is_on_hold());
    assert!(!bob.sink_stream(1).unwrap().is_paused());
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn user_input_reaches_other_parties() {
    let a = endpoint("a", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let call = m.set_up_call("a:alice", "a:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &a);

    alice.send_user_input("123#");
    call.on_user_input_tone(bob.as_ref(), '5', 100);
    assert_eq!(bob.user_input(), vec!["123#".to_string()]);
    assert_eq!(alice.user_input(), vec!["5".to_string()]);
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn transfer_within_endpoint_and_by_replacement() {
    let a = endpoint("a", &["PCMU"], false);
    let b = endpoint("b", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let bob: Arc<dyn Connection> = call.connections()[1].clone();

    call.transfer("*:robert", Some(&bob)).unwrap();
    assert_eq!(bob.remote_party_name(), "robert");

    call.transfer("a:carol", Some(&bob)).unwrap();
    assert_eq!(bob.phase(), ConnectionPhase::Released);
    assert_eq!(bob.call_end_reason(), Some(CallEndReason::CallForwarded));
    assert_eq!(call.connection_count(), 2);
    assert_eq!(call.party_b(), "carol");
    assert!(!call.is_clearing());
    // The forwarded connection leaving does not decide how the call ends
    assert_eq!(call.end_reason(), None);

    assert!(call.transfer("sip:nobody", None).is_err());
    assert_eq!(call.end_reason(), None);
    call.clear(CallEndReason::LocalUser, None);
    assert_eq!(call.end_reason(), Some(CallEndReason::LocalUser));
}

#[test]
fn recording_taps_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("call.sbr");
    let a = endpoint("a", &["PCMU"], true);
    let b = endpoint("b", &["PCMU"], true);
    let m = manager(TranscoderRegistry::new(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);

    call.start_recording(&path, &RecordingOptions::default()).unwrap();
    assert!(call.is_recording());

    alice
        .source_stream(1)
        .unwrap()
        .push(MediaFrame::new(0, 0, vec![1u8; 160]));
    bob.source_stream(1)
        .unwrap()
        .push(MediaFrame::new(0, 0, vec![2u8; 160]));
    assert!(bob.sink_stream(1).unwrap().wait_for_written(1, WAIT));
    assert!(alice.sink_stream(1).unwrap().wait_for_written(1, WAIT));

    call.stop_recording();
    assert!(!call.is_recording());

    let entries = read_raw_recording(&path).unwrap();
    let channels = entries
        .iter()
        .filter(|e| matches!(e, RecordEntry::Channel { .. }))
        .count();
    let audio: Vec<u8> = entries
        .iter()
        .filter_map(|e| match e {
            RecordEntry::Audio { frame, .. } => frame.payload.first().copied(),
            _ => None,
        })
        .collect();
    assert_eq!(channels, 2);
    assert_eq!(audio.len(), 2);
    assert!(audio.contains(&1) && audio.contains(&2));
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn recording_rejects_unknown_extension() {
    let a = endpoint("a", &["PCMU"], false);
    let m = manager(TranscoderRegistry::new(), &[a.clone()]);
    let call = m.set_up_call("a:alice", "a:bob").unwrap();
    let result = call.start_recording(
        std::path::Path::new("/tmp/call.unknown"),
        &RecordingOptions::default(),
    );
    assert!(matches!(result, Err(CallError::Recording(_))));
    assert!(!call.is_recording());
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn media_formats_include_transcodable() {
    let a = endpoint("a", &["H.264"], false);
    let b = endpoint("b", &["VP8"], false);
    let m = manager(video_registry(), &[a.clone(), b.clone()]);
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);

    // Bob offers VP8, reachable from H.264 and YUV420P.
    let towards_alice = call.media_formats(alice.as_ref(), false);
    assert_eq!(towards_alice.names(), vec!["VP8", "YUV420P", "H.264"]);

    let with_own = call.media_formats(bob.as_ref(), true);
    assert_eq!(with_own.names(), vec!["VP8", "YUV420P", "H.264"]);
    call.clear(CallEndReason::LocalUser, None);
}

#[test]
fn bypass_restricts_sink_formats_to_native() {
    let bypass = |prefix: &str, formats: &[&str]| {
        LocalEndpoint::new(LocalEndpointConfig {
            prefix: prefix.to_string(),
            formats: formats.iter().map(|f| f.to_string()).collect(),
            autostart: false,
            media_bypass: true,
            ..Default::default()
        })
        .unwrap()
    };
    let a = bypass("a", &["H.264"]);
    let b = bypass("b", &["VP8"]);
    let m = CallManager::new(
        ManagerConfig {
            allow_media_bypass: true,
            ..Default::default()
        },
        video_registry(),
    );
    m.attach_endpoint(a.clone());
    m.attach_endpoint(b.clone());
    let call = m.set_up_call("a:alice", "b:bob").unwrap();
    let (alice, bob) = parties(&call, &a, &b);

    assert!(m.is_media_bypass_possible(alice.as_ref(), bob.as_ref(), 2));
    // VP8 is not native to alice, so no sink format survives.
    assert!(call
        .open_source_media_streams(alice.as_ref(), MediaType::Video, 2, None, None)
        .is_err());
    call.clear(CallEndReason::LocalUser, None);
}
