//! [`RtcEngine`] backed by webrtc-rs.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::AudioSink;
use crate::engine::{
    EngineEvent, EngineEvents, IceCandidate, RtcConnection, RtcEngine, SdpKind,
    SessionDescription, TransportState,
};
use crate::error::Result;
use crate::media::LocalTrack;
use crate::PeerId;

pub struct WebRtcEngine {
    api: API,
    config: RTCConfiguration,
    audio_sink: Option<Arc<dyn AudioSink>>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self {
            api,
            config,
            audio_sink: None,
        })
    }

    /// Remote audio payloads are handed to `sink`; without one they are only drained.
    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn new_connection(&self, events: EngineEvents) -> Result<Arc<dyn RtcConnection>> {
        let peer_id = events.peer_id().to_string();
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let ev = events.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let ev = ev.clone();
            Box::pin(async move {
                ev.emit(EngineEvent::NegotiationNeeded);
            })
        }));

        // Gathering is per connection, so every candidate knows its peer.
        let ev = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Candidate gathering complete for peer {}", ev.peer_id());
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        ev.emit(EngineEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Unserializable candidate for peer {}: {}", ev.peer_id(), e),
                }
            })
        }));

        let ev = events.clone();
        let sink = self.audio_sink.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let ev = ev.clone();
                let sink = sink.clone();
                Box::pin(async move {
                    let track_id = format!("ssrc-{}", track.ssrc());
                    ev.emit(EngineEvent::RemoteTrack {
                        track_id: track_id.clone(),
                    });
                    // Return right away; the read loop must not hold the handler.
                    let source = format!("{}/{}", ev.peer_id(), track_id);
                    tokio::spawn(drain_remote_track(track, source, sink));
                })
            },
        ));

        let ev = events;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let ev = ev.clone();
                Box::pin(async move {
                    debug!("Peer {} connection state has changed: {}", ev.peer_id(), s);
                    if let Some(state) = transport_state(s) {
                        ev.emit(EngineEvent::TransportChanged(state));
                    }
                })
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            peer_id,
            peer_connection,
        }))
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Reads remote RTP until the track ends, passing Opus payloads to the sink.
async fn drain_remote_track(
    track: Arc<TrackRemote>,
    source: String,
    sink: Option<Arc<dyn AudioSink>>,
) {
    let mut packets = 0u64;
    while let Ok((rtp, _)) = track.read_rtp().await {
        packets += 1;
        if packets % 500 == 0 {
            debug!("Received {} RTP packets from {}", packets, source);
        }
        if let Some(sink) = &sink {
            sink.play(&source, rtp.payload);
        }
    }
    if let Some(sink) = &sink {
        sink.end(&source);
    }
    info!("Remote track {} ended after {} packets", source, packets);
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

pub struct WebRtcConnection {
    peer_id: PeerId,
    peer_connection: Arc<RTCPeerConnection>,
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        let rtp_sender = self
            .peer_connection
            .add_track(track.sample_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors like NACK to work.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing peer connection to {}", self.peer_id);
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_state_is_not_reported() {
        assert_eq!(transport_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            transport_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
    }

    #[test]
    fn garbage_sdp_is_rejected() {
        assert!(to_rtc(SessionDescription::answer("not sdp")).is_err());
    }

    #[tokio::test]
    async fn engine_builds_with_default_ice_server() {
        let engine = WebRtcEngine::new(&[crate::config::DEFAULT_ICE_SERVER.to_string()]);
        assert!(engine.is_ok());
    }

    struct Discard;

    impl AudioSink for Discard {
        fn play(&self, _source: &str, _payload: bytes::Bytes) {}
        fn end(&self, _source: &str) {}
    }

    #[tokio::test]
    async fn engine_accepts_an_audio_sink() {
        let engine = WebRtcEngine::new(&[crate::config::DEFAULT_ICE_SERVER.to_string()])
            .unwrap()
            .with_audio_sink(Arc::new(Discard));
        assert!(engine.audio_sink.is_some());
    }
}
