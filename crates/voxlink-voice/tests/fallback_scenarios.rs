mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use voxlink_protocol::codec::{encode_fragment, to_transport};
use voxlink_protocol::{AudioCodec, PcmFrame, SignalMessage, UserId};
use voxlink_voice::{ChannelEventHandler, LocalBroadcastHub, VoiceEvent};

fn chunk(from: &str, seq: u64, audio_data: String) -> SignalMessage {
    SignalMessage::AudioChunk {
        audio_data,
        user_id: from.into(),
        timestamp: 1_700_000_000_000 + seq as i64 * 100,
        seq: Some(seq),
    }
}

fn fragment(marker: i16) -> String {
    let frame = PcmFrame::new(48000, 1, vec![marker; 480]);
    to_transport(&encode_fragment(&frame, AudioCodec::Pcm16))
}

#[tokio::test]
async fn test_corrupt_fragment_is_skipped() {
    let hub = LocalBroadcastHub::new();
    let devices = ScriptedDevices::granted();
    let connector = ScriptedConnector::new();
    let output = Arc::new(MemoryOutput::default());
    let sender = Observer::join(&hub, "audio-room").await;

    let (handler, mut events) = ChannelEventHandler::new();
    let x = client(&hub, &devices, &connector, "userX")
        .initialize_fallback(output.clone(), Arc::new(handler))
        .await
        .unwrap();

    sender.send(chunk("userY", 1, fragment(1))).await;
    // Valid transport text, but not a fragment
    sender.send(chunk("userY", 2, to_transport(b"not audio at all"))).await;
    sender.send(chunk("userY", 3, fragment(3))).await;

    let mut status = x.watch_status();
    wait_until(&mut status, |s| s.fragments_played == 2 && s.fragments_dropped == 1).await;

    let played = output.played.lock().unwrap().clone();
    let markers: Vec<i16> = played.iter().map(|(_, frame)| frame.samples[0]).collect();
    assert_eq!(markers, vec![1, 3]);
    assert!(played.iter().all(|(from, _)| from.as_str() == "userY"));

    let snapshot = x.status();
    assert_eq!(snapshot.fragments_received, 3);
    assert!(snapshot.participants.contains(&UserId::from("userY")));
    expect_event(&mut events, |e| {
        matches!(e, VoiceEvent::PeerJoined { peer } if peer.as_str() == "userY")
    })
    .await;

    x.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_transport_text_is_dropped() {
    let hub = LocalBroadcastHub::new();
    let devices = ScriptedDevices::granted();
    let connector = ScriptedConnector::new();
    let output = Arc::new(MemoryOutput::default());
    let sender = Observer::join(&hub, "audio-room").await;

    let (handler, _events) = ChannelEventHandler::new();
    let x = client(&hub, &devices, &connector, "userX")
        .initialize_fallback(output.clone(), Arc::new(handler))
        .await
        .unwrap();

    sender.send(chunk("userY", 1, "%%% not base64 %%%".into())).await;
    sender.send(chunk("userY", 2, fragment(2))).await;

    let mut status = x.watch_status();
    wait_until(&mut status, |s| s.fragments_played == 1 && s.fragments_dropped == 1).await;
    assert_eq!(output.played.lock().unwrap().len(), 1);

    x.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_transmission_reaches_other_participant() {
    let hub = LocalBroadcastHub::new();
    let connector = ScriptedConnector::new();
    let devices_a = ScriptedDevices::granted();
    let devices_b = ScriptedDevices::granted();
    let output_a = Arc::new(MemoryOutput::default());
    let output_b = Arc::new(MemoryOutput::default());
    let mut watcher = Observer::join(&hub, "audio-room").await;

    let (handler_a, _events_a) = ChannelEventHandler::new();
    let (handler_b, _events_b) = ChannelEventHandler::new();
    let a = client(&hub, &devices_a, &connector, "userA")
        .initialize_fallback(output_a.clone(), Arc::new(handler_a))
        .await
        .unwrap();
    let b = client(&hub, &devices_b, &connector, "userB")
        .initialize_fallback(output_b.clone(), Arc::new(handler_b))
        .await
        .unwrap();

    a.start_transmission().await.unwrap();
    let mut status_a = a.watch_status();
    wait_until(&mut status_a, |s| s.transmitting).await;

    // 150 ms of capture makes one 100 ms fragment plus a remainder
    devices_a.capture(PcmFrame::new(48000, 1, vec![1000; 7200]));

    match watcher
        .expect(|m| matches!(m, SignalMessage::AudioChunk { .. }))
        .await
    {
        SignalMessage::AudioChunk { user_id, seq, .. } => {
            assert_eq!(user_id.as_str(), "userA");
            assert_eq!(seq, Some(0));
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut status_b = b.watch_status();
    wait_until(&mut status_b, |s| s.fragments_played == 1).await;
    {
        let played = output_b.played.lock().unwrap();
        let (from, frame) = &played[0];
        assert_eq!(from.as_str(), "userA");
        assert_eq!(frame.sample_rate, 48000);
        assert_eq!(frame.samples.len(), 4800);
    }
    // Our own fragments are never played back to us
    assert!(output_a.played.lock().unwrap().is_empty());

    a.stop_transmission().await.unwrap();
    wait_until(&mut status_a, |s| !s.transmitting && s.fragments_sent == 1).await;

    devices_a.capture(PcmFrame::new(48000, 1, vec![1000; 9600]));
    let later = watcher.drain(Duration::from_millis(200)).await;
    assert!(!later
        .iter()
        .any(|m| matches!(m, SignalMessage::AudioChunk { .. })));

    a.disconnect().await.unwrap();
    b.disconnect().await.unwrap();
    assert_eq!(hub.subscriber_count("audio-room"), 1);
}

#[tokio::test]
async fn test_fallback_disconnect_releases_capture() {
    let hub = LocalBroadcastHub::new();
    let devices = ScriptedDevices::granted();
    let connector = ScriptedConnector::new();
    let output = Arc::new(MemoryOutput::default());
    let mut watcher = Observer::join(&hub, "audio-room").await;
    let client = client(&hub, &devices, &connector, "userX");

    let (handler, _events) = ChannelEventHandler::new();
    let handler = Arc::new(handler);
    let x = client
        .initialize_fallback(output.clone(), handler.clone())
        .await
        .unwrap();
    watcher
        .expect(|m| matches!(m, SignalMessage::UserJoined { user_id } if user_id.as_str() == "userX"))
        .await;

    // The fallback holds the microphone like a peer session does
    assert!(client.initialize_session(handler.clone()).await.is_err());

    x.start_transmission().await.unwrap();
    x.disconnect().await.unwrap();
    watcher
        .expect(|m| matches!(m, SignalMessage::UserLeft { user_id } if user_id.as_str() == "userX"))
        .await;

    assert_eq!(client.guard().held_count(), 0);
    assert_eq!(hub.subscriber_count("channel-room"), 0);
    assert_eq!(hub.subscriber_count("user-userX"), 0);
    x.disconnect().await.unwrap();

    let again = client.initialize_fallback(output, handler).await.unwrap();
    again.disconnect().await.unwrap();
}
