use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::PeerId;

#[derive(Debug, Error)]
pub enum Error {
    /// Local audio could not be acquired. Fatal to joining.
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("remote description rejected for peer {peer}: {reason}")]
    RemoteDescription { peer: PeerId, reason: String },

    #[error("ice candidate rejected for peer {peer}: {reason}")]
    Candidate { peer: PeerId, reason: String },

    #[error("room is full")]
    RoomFull,

    #[error("no answer from peer {peer} after {attempts} offer(s)")]
    NegotiationTimeout { peer: PeerId, attempts: u32 },

    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),

    #[error("peer {0} is not in the call")]
    UnknownPeer(PeerId),

    #[error("only the room admin can mute other participants")]
    NotAdmin,

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Per-peer failures that leave the rest of the mesh untouched.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::RemoteDescription { .. }
                | Error::Candidate { .. }
                | Error::NegotiationTimeout { .. }
                | Error::DuplicatePeer(_)
                | Error::UnknownPeer(_)
                | Error::NotAdmin
                | Error::WebRTC(_)
                | Error::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
