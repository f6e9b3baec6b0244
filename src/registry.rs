use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::negotiation::PeerHandle;
use crate::presentation::Presenter;
use crate::PeerId;

/// Who we are connected to. Owned by the controller's event loop, which is
/// the only place it is mutated.
pub struct Registry {
    peers: HashMap<PeerId, PeerHandle>,
    departed: HashSet<PeerId>,
    presenter: Arc<dyn Presenter>,
}

impl Registry {
    pub fn new(presenter: Arc<dyn Presenter>) -> Self {
        Self {
            peers: HashMap::new(),
            departed: HashSet::new(),
            presenter,
        }
    }

    pub fn register(&mut self, peer_id: PeerId, handle: PeerHandle) -> Result<()> {
        if self.peers.contains_key(&peer_id) {
            return Err(Error::DuplicatePeer(peer_id));
        }
        self.peers.insert(peer_id, handle);
        Ok(())
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerHandle> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Ids that left the room. They are never registered again.
    pub fn is_departed(&self, peer_id: &str) -> bool {
        self.departed.contains(peer_id)
    }

    /// Idempotent. Releases the peer's presentation when an entry is removed.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerHandle> {
        let handle = self.peers.remove(peer_id);
        match handle {
            Some(_) => {
                self.departed.insert(peer_id.to_string());
                self.presenter.release(peer_id);
            }
            None => debug!("Peer {} not registered, nothing to remove", peer_id),
        }
        handle
    }

    /// Empties the registry without marking anyone departed (we are the one leaving).
    pub fn drain(&mut self) -> Vec<(PeerId, PeerHandle)> {
        let drained: Vec<_> = self.peers.drain().collect();
        for (peer_id, _) in &drained {
            self.presenter.release(peer_id);
        }
        drained
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerHandle)> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
