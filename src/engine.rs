//! Seam between the mesh logic and the real-time media engine.
//!
//! The controller and the per-peer negotiation tasks only talk to
//! [`RtcEngine`] and [`RtcConnection`]. ICE, DTLS and RTP are the engine's
//! business; the production implementation lives in [`crate::webrtc`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::LocalTrack;
use crate::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the `{"type": ..., "sdp": ...}` shape browsers use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Transport-level state as reported by the engine, independent of
/// where the signaling exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "New"),
            TransportState::Connecting => write!(f, "Connecting"),
            TransportState::Connected => write!(f, "Connected"),
            TransportState::Disconnected => write!(f, "Disconnected"),
            TransportState::Failed => write!(f, "Failed"),
            TransportState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Edge-triggered; raised once local tracks change what must be negotiated.
    NegotiationNeeded,
    LocalCandidate(IceCandidate),
    RemoteTrack { track_id: String },
    TransportChanged(TransportState),
}

/// Per-connection handle the engine uses to report events, tagged with
/// the peer the connection belongs to.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<(PeerId, EngineEvent)>,
}

impl EngineEvents {
    pub fn new(peer_id: PeerId, tx: mpsc::UnboundedSender<(PeerId, EngineEvent)>) -> Self {
        Self { peer_id, tx }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Returns false once the controller has stopped listening.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx.send((self.peer_id.clone(), event)).is_ok()
    }
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Create a connection for one remote peer. Events for it flow through `events`.
    async fn new_connection(&self, events: EngineEvents) -> Result<Arc<dyn RtcConnection>>;
}
