//! Peer-to-peer mesh audio calls.
//!
//! Every participant in a room holds a direct WebRTC connection to every
//! other participant. A WebSocket relay carries only signaling: room
//! membership, offers and answers, and ICE candidates.

pub mod audio;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod presentation;
pub mod registry;
pub mod signaling;
pub mod webrtc;

/// Relay-assigned participant id.
pub type PeerId = String;

pub use crate::config::{CandidateRouting, Config};
pub use crate::controller::{
    MeshController, MeshExit, MeshHandle, MeshOptions, MeshSnapshot, ParticipantRole,
};
pub use crate::error::{Error, Result};
pub use crate::peer::{PeerState, PeerStatus, Role};
pub use crate::webrtc::WebRtcEngine;
