use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::engine::{IceCandidate, SessionDescription};
use crate::error::{Error, Result};
use crate::PeerId;

/// Messages the relay delivers to us. On the wire each one is
/// `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundSignal {
    OccupantList {
        peers: Vec<PeerId>,
    },
    NegotiationRequest {
        sdp: SessionDescription,
        caller: PeerId,
    },
    NegotiationAnswer {
        sdp: SessionDescription,
        answerer: PeerId,
    },
    #[serde(rename = "ice-candidate")]
    Candidate {
        candidate: IceCandidate,
        source: PeerId,
    },
    PeerLeft {
        peer: PeerId,
    },
    RoomFull,
    MuteDirective,
    UnmuteDirective,
}

impl InboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OccupantList { .. } => "occupant-list",
            Self::NegotiationRequest { .. } => "negotiation-request",
            Self::NegotiationAnswer { .. } => "negotiation-answer",
            Self::Candidate { .. } => "ice-candidate",
            Self::PeerLeft { .. } => "peer-left",
            Self::RoomFull => "room-full",
            Self::MuteDirective => "mute-directive",
            Self::UnmuteDirective => "unmute-directive",
        }
    }
}

/// Messages we hand to the relay; everything but `join-room` is addressed
/// to one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundSignal {
    JoinRoom {
        room_id: String,
    },
    NegotiationRequest {
        sdp: SessionDescription,
        target: PeerId,
    },
    NegotiationAnswer {
        sdp: SessionDescription,
        target: PeerId,
    },
    #[serde(rename = "ice-candidate")]
    Candidate {
        candidate: IceCandidate,
        target: PeerId,
    },
    MuteDirective {
        target: PeerId,
    },
    UnmuteDirective {
        target: PeerId,
    },
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::NegotiationRequest { .. } => "negotiation-request",
            Self::NegotiationAnswer { .. } => "negotiation-answer",
            Self::Candidate { .. } => "ice-candidate",
            Self::MuteDirective { .. } => "mute-directive",
            Self::UnmuteDirective { .. } => "unmute-directive",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { .. } => None,
            Self::NegotiationRequest { target, .. }
            | Self::NegotiationAnswer { target, .. }
            | Self::Candidate { target, .. }
            | Self::MuteDirective { target }
            | Self::UnmuteDirective { target } => Some(target),
        }
    }
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, signal: OutboundSignal) -> Result<()>;
}

/// JSON-over-WebSocket signaling client.
pub struct WsSignalingChannel {
    tx: mpsc::Sender<OutboundSignal>,
}

impl WsSignalingChannel {
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<InboundSignal>)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<OutboundSignal>(100);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(signal) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&signal) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Dropping unserializable {} message: {}", signal.name(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Signaling read failed: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<InboundSignal>(&text) {
                    Ok(signal) => {
                        if incoming_tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Ignoring unrecognized signaling message: {}", e),
                }
            }
            info!("Signaling connection closed");
        });

        Ok((Self { tx: outgoing_tx }, incoming_rx))
    }

    /// Connect, retrying up to `attempts` times with a fixed delay.
    pub async fn connect_with_retry(
        url: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<(Self, mpsc::Receiver<InboundSignal>)> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(url).await {
                Ok(connected) => {
                    info!("Connected to signaling server {}", url);
                    return Ok(connected);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Signaling connection attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    return Err(Error::Signaling(format!(
                        "Max connection attempts reached: {}",
                        e
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to send message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn occupant_list_parses() {
        let raw = json!({"event": "occupant-list", "data": {"peers": ["p2", "p3"]}});
        let signal: InboundSignal = serde_json::from_value(raw).unwrap();
        assert_eq!(
            signal,
            InboundSignal::OccupantList {
                peers: vec!["p2".into(), "p3".into()]
            }
        );
    }

    #[test]
    fn payloadless_events_parse_without_data() {
        let signal: InboundSignal = serde_json::from_str(r#"{"event":"room-full"}"#).unwrap();
        assert_eq!(signal, InboundSignal::RoomFull);
        let signal: InboundSignal = serde_json::from_str(r#"{"event":"mute-directive"}"#).unwrap();
        assert_eq!(signal.name(), "mute-directive");
    }

    #[test]
    fn inbound_offer_names_the_caller() {
        let raw = json!({
            "event": "negotiation-request",
            "data": {"sdp": {"type": "offer", "sdp": "v=0"}, "caller": "p9"}
        });
        match serde_json::from_value::<InboundSignal>(raw).unwrap() {
            InboundSignal::NegotiationRequest { sdp, caller } => {
                assert_eq!(caller, "p9");
                assert_eq!(sdp, SessionDescription::offer("v=0"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn outbound_candidate_is_addressed() {
        let signal = OutboundSignal::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 4000 typ host".into(),
                sdp_mid: Some("0".into()),
                ..Default::default()
            },
            target: "p2".into(),
        };
        assert_eq!(signal.target(), Some("p2"));
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["event"], "ice-candidate");
        assert_eq!(json["data"]["target"], "p2");
        assert_eq!(json["data"]["candidate"]["sdpMid"], "0");
    }

    #[test]
    fn join_has_no_target() {
        let join = OutboundSignal::JoinRoom {
            room_id: "r1".into(),
        };
        assert_eq!(join.target(), None);
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"event": "join-room", "data": {"room_id": "r1"}})
        );
    }
}
