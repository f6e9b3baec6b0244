use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::engine::TransportState;
use crate::PeerId;

/// Where the signaling exchange with one peer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    New,
    Negotiating,
    OfferSent,
    Answering,
    Connected,
    Closed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::New => write!(f, "New"),
            PeerState::Negotiating => write!(f, "Negotiating"),
            PeerState::OfferSent => write!(f, "OfferSent"),
            PeerState::Answering => write!(f, "Answering"),
            PeerState::Connected => write!(f, "Connected"),
            PeerState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// We called them: we send the offer.
    Caller,
    /// They called us: we answer.
    Callee,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub role: Role,
    pub state: PeerState,
    pub transport: TransportState,
    pub offers_sent: u32,
    pub last_error: Option<String>,
}

impl PeerStatus {
    pub fn new(peer_id: PeerId, role: Role) -> Self {
        Self {
            peer_id,
            role,
            state: PeerState::New,
            transport: TransportState::New,
            offers_sent: 0,
            last_error: None,
        }
    }
}

/// Single-writer view of a peer's status; the negotiation task owns it and
/// anyone may subscribe.
#[derive(Clone)]
pub struct StatusMonitor {
    status: Arc<watch::Sender<PeerStatus>>,
    receiver: watch::Receiver<PeerStatus>,
}

impl StatusMonitor {
    pub fn new(peer_id: PeerId, role: Role) -> Self {
        let (status, receiver) = watch::channel(PeerStatus::new(peer_id, role));
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn state(&self) -> PeerState {
        self.receiver.borrow().state
    }

    pub fn current(&self) -> PeerStatus {
        self.receiver.borrow().clone()
    }

    pub fn update_state(&self, state: PeerState) {
        self.status.send_modify(|status| {
            status.state = state;
        });
    }

    pub fn update_transport(&self, transport: TransportState) {
        self.status.send_modify(|status| {
            status.transport = transport;
        });
    }

    pub fn record_offer(&self) {
        self.status.send_modify(|status| {
            status.offers_sent += 1;
        });
    }

    /// Recoverable failures only: the state is left where it was.
    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_do_not_move_the_state() {
        let monitor = StatusMonitor::new("p2".into(), Role::Caller);
        monitor.update_state(PeerState::OfferSent);
        monitor.set_error("stale answer".into());

        let status = monitor.current();
        assert_eq!(status.state, PeerState::OfferSent);
        assert_eq!(status.last_error.as_deref(), Some("stale answer"));
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let monitor = StatusMonitor::new("p3".into(), Role::Callee);
        let mut rx = monitor.subscribe();

        monitor.update_state(PeerState::Answering);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, PeerState::Answering);
        assert_eq!(rx.borrow().role, Role::Callee);
    }
}
