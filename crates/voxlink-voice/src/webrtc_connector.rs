//! Peer connector backed by the `webrtc` crate.
//!
//! Audio goes out as G.711 µ-law (PCMU) at 8 kHz, so no extra codec
//! dependency is needed on either side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use voxlink_protocol::codec::{mulaw_decode, mulaw_encode};
use voxlink_protocol::{IceCandidate, PcmFrame, SessionDescription, UserId};

use crate::config::VoiceConfig;
use crate::connector::{
    ConnectionEvent, ConnectionEvents, ConnectionId, MediaState, PeerConnection, PeerConnector,
};
use crate::error::NegotiationError;
use crate::media::{CaptureConstraints, LocalTrack};

const PCMU_RATE: u32 = 8000;

fn engine_error(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Engine(e.to_string())
}

pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(config: &VoiceConfig) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    fn capture_constraints(&self, _config: &VoiceConfig) -> CaptureConstraints {
        CaptureConstraints::voice(PCMU_RATE)
    }

    async fn create(
        &self,
        peer: &UserId,
        connection: ConnectionId,
        local: LocalTrack,
        events: ConnectionEvents,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_config())
                .await
                .map_err(engine_error)?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "voxlink".to_owned(),
        ));
        pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;

        let candidate_peer = peer.clone();
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let peer = candidate_peer.clone();
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Candidate gathering for {peer} complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(ConnectionEvent::LocalCandidate {
                            peer,
                            connection,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(e) => warn!("Unusable local candidate for {peer}: {e}"),
                }
            })
        }));

        let state_peer = peer.clone();
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::Connecting => Some(MediaState::Connecting),
                RTCPeerConnectionState::Connected => Some(MediaState::Connected),
                RTCPeerConnectionState::Disconnected => Some(MediaState::Disconnected),
                RTCPeerConnectionState::Failed => Some(MediaState::Failed),
                RTCPeerConnectionState::Closed => Some(MediaState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                let _ = state_events.send(ConnectionEvent::StateChanged {
                    peer: state_peer.clone(),
                    connection,
                    state,
                });
            }
            Box::pin(async {})
        }));

        let track_peer = peer.clone();
        let track_events = events;
        pc.on_track(Box::new(move |remote: Arc<TrackRemote>, _, _| {
            let peer = track_peer.clone();
            let events = track_events.clone();
            Box::pin(async move {
                info!("Remote {:?} track from {peer}", remote.kind());
                let _ = events.send(ConnectionEvent::RemoteTrack {
                    peer: peer.clone(),
                    connection,
                });
                read_remote_audio(remote, peer, connection, events).await;
            })
        }));

        let pump = tokio::spawn(write_local_audio(local, track, peer.clone()));

        Ok(Box::new(WebRtcPeer { pc, pump }))
    }
}

/// Encode captured frames onto the outbound track until the capture ends
async fn write_local_audio(
    mut local: LocalTrack,
    track: Arc<TrackLocalStaticSample>,
    peer: UserId,
) {
    while let Some(frame) = local.next_frame().await {
        let data: Vec<u8> = frame.samples.iter().map(|&s| mulaw_encode(s)).collect();
        let sample = Sample {
            data: Bytes::from(data),
            duration: Duration::from_millis(frame.duration_ms()),
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!("Writing audio for {peer} failed: {e}");
        }
    }
    debug!("Outbound audio to {peer} ended");
}

/// Decode inbound RTP until the track closes
async fn read_remote_audio(
    remote: Arc<TrackRemote>,
    peer: UserId,
    connection: ConnectionId,
    events: ConnectionEvents,
) {
    loop {
        match remote.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let samples = packet.payload.iter().map(|&b| mulaw_decode(b)).collect();
                let frame = PcmFrame::new(PCMU_RATE, 1, samples);
                if events
                    .send(ConnectionEvent::RemoteAudio {
                        peer: peer.clone(),
                        connection,
                        frame,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                debug!("Remote track from {peer} ended: {e}");
                break;
            }
        }
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    pump: JoinHandle<()>,
}

fn to_description(description: &RTCSessionDescription) -> SessionDescription {
    match description.sdp_type {
        webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Answer => {
            SessionDescription::answer(description.sdp.clone())
        }
        _ => SessionDescription::offer(description.sdp.clone()),
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(engine_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(engine_error)?;
        Ok(to_description(&offer))
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let remote = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;

        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(engine_error)?;
        Ok(to_description(&answer))
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let remote = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn close(&mut self) {
        self.pump.abort();
        if let Err(e) = self.pc.close().await {
            warn!("Closing peer connection failed: {e}");
        }
    }
}
