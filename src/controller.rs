//! Mesh membership.
//!
//! [`MeshController`] runs the client's single event loop. It reacts to
//! relay messages, engine events and operator commands, and is the only
//! owner of the [`Registry`]. Negotiation itself happens in the per-peer
//! tasks from [`crate::negotiation`].

use futures::future::join_all;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::CandidateRouting;
use crate::engine::{EngineEvent, EngineEvents, IceCandidate, RtcEngine, TransportState};
use crate::error::{Error, Result};
use crate::media::{LocalStream, MediaSource};
use crate::negotiation::{spawn_peer, NegotiationPolicy, PeerCommand};
use crate::peer::{PeerStatus, Role};
use crate::presentation::{Presenter, UserNotice};
use crate::registry::Registry;
use crate::signaling::{InboundSignal, OutboundSignal, SignalingChannel};
use crate::PeerId;

/// Decided once, from the occupant list received on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    /// First into the room; may mute others.
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshOptions {
    pub candidate_routing: CandidateRouting,
    pub negotiation: NegotiationPolicy,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            candidate_routing: CandidateRouting::Scoped,
            negotiation: NegotiationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeshSnapshot {
    pub role: Option<ParticipantRole>,
    pub audio_enabled: bool,
    /// Sorted by peer id.
    pub peers: Vec<PeerStatus>,
}

impl MeshSnapshot {
    pub fn is_admin(&self) -> bool {
        self.role == Some(ParticipantRole::Admin)
    }
}

/// Why [`MeshController::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshExit {
    Left,
    RoomFull,
    SignalingClosed,
}

enum MeshCommand {
    SetLocalAudio {
        enabled: Option<bool>,
        reply: oneshot::Sender<bool>,
    },
    MutePeer {
        peer_id: PeerId,
        muted: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot(oneshot::Sender<MeshSnapshot>),
    Subscribe {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<watch::Receiver<PeerStatus>>>,
    },
    Leave(oneshot::Sender<()>),
}

/// Cloneable remote control for a running controller.
#[derive(Clone)]
pub struct MeshHandle {
    tx: mpsc::Sender<MeshCommand>,
}

impl MeshHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> MeshCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Error::ChannelClosed("mesh controller"))?;
        rx.await.map_err(|_| Error::ChannelClosed("mesh controller"))
    }

    /// Returns whether local audio is now enabled.
    pub async fn set_local_audio(&self, enabled: bool) -> Result<bool> {
        self.request(|reply| MeshCommand::SetLocalAudio {
            enabled: Some(enabled),
            reply,
        })
        .await
    }

    /// Returns whether local audio is now enabled.
    pub async fn toggle_local_audio(&self) -> Result<bool> {
        self.request(|reply| MeshCommand::SetLocalAudio {
            enabled: None,
            reply,
        })
        .await
    }

    /// Admin only: ask `peer_id` to mute (or unmute) their microphone.
    pub async fn mute_peer(&self, peer_id: &str, muted: bool) -> Result<()> {
        let peer_id = peer_id.to_string();
        self.request(|reply| MeshCommand::MutePeer {
            peer_id,
            muted,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot> {
        self.request(MeshCommand::Snapshot).await
    }

    /// Status updates for one peer, or `None` if it is not registered.
    pub async fn subscribe(&self, peer_id: &str) -> Result<Option<watch::Receiver<PeerStatus>>> {
        let peer_id = peer_id.to_string();
        self.request(|reply| MeshCommand::Subscribe { peer_id, reply })
            .await
    }

    /// Close every connection and stop the controller.
    pub async fn leave(&self) -> Result<()> {
        self.request(MeshCommand::Leave).await
    }
}

pub struct MeshController {
    options: MeshOptions,
    registry: Registry,
    signaling: Arc<dyn SignalingChannel>,
    engine: Arc<dyn RtcEngine>,
    presenter: Arc<dyn Presenter>,
    local: Option<LocalStream>,
    role: OnceLock<ParticipantRole>,
    engine_tx: mpsc::UnboundedSender<(PeerId, EngineEvent)>,
    engine_rx: mpsc::UnboundedReceiver<(PeerId, EngineEvent)>,
    commands: mpsc::Receiver<MeshCommand>,
}

impl MeshController {
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        engine: Arc<dyn RtcEngine>,
        presenter: Arc<dyn Presenter>,
        options: MeshOptions,
    ) -> (Self, MeshHandle) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (tx, commands) = mpsc::channel(32);
        let controller = Self {
            options,
            registry: Registry::new(Arc::clone(&presenter)),
            signaling,
            engine,
            presenter,
            local: None,
            role: OnceLock::new(),
            engine_tx,
            engine_rx,
            commands,
        };
        (controller, MeshHandle { tx })
    }

    /// Acquire local audio and announce ourselves. A media failure is fatal:
    /// the user is told and nothing is sent.
    pub async fn join(&mut self, room_id: &str, media: &dyn MediaSource) -> Result<()> {
        let stream = match media.acquire().await {
            Ok(stream) => stream,
            Err(e) => {
                let reason = match e {
                    Error::MediaAcquisition(reason) => reason,
                    other => other.to_string(),
                };
                self.presenter
                    .notify(UserNotice::MediaUnavailable(reason.clone()));
                return Err(Error::MediaAcquisition(reason));
            }
        };
        self.local = Some(stream);

        self.signaling
            .send(OutboundSignal::JoinRoom {
                room_id: room_id.to_string(),
            })
            .await?;
        info!("Joining room {}", room_id);
        Ok(())
    }

    pub fn role(&self) -> Option<ParticipantRole> {
        self.role.get().copied()
    }

    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundSignal>) -> Result<MeshExit> {
        let mut commands_open = true;
        let exit = loop {
            tokio::select! {
                signal = inbound.recv() => match signal {
                    Some(signal) => {
                        if let Some(exit) = self.handle_signal(signal).await {
                            break exit;
                        }
                    }
                    None => {
                        warn!("Signaling channel closed");
                        break MeshExit::SignalingClosed;
                    }
                },
                Some((peer_id, event)) = self.engine_rx.recv() => {
                    self.handle_engine_event(peer_id, event).await;
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => {
                        if self.handle_command(command).await {
                            return Ok(MeshExit::Left);
                        }
                    }
                    None => commands_open = false,
                },
            }
        };
        self.shutdown().await;
        Ok(exit)
    }

    /// Returns `Some` when the signal ends the session.
    pub async fn handle_signal(&mut self, signal: InboundSignal) -> Option<MeshExit> {
        debug!("Received {}", signal.name());
        match signal {
            InboundSignal::OccupantList { peers } => self.on_occupant_list(peers).await,
            InboundSignal::NegotiationRequest { sdp, caller } => {
                if let Some(handle) = self.registry.get(&caller) {
                    handle.send(PeerCommand::RemoteOffer(sdp));
                } else if self.registry.is_departed(&caller) {
                    debug!("Dropping offer from departed peer {}", caller);
                } else if self.create_peer(caller.clone(), Role::Callee).await {
                    self.route(&caller, PeerCommand::RemoteOffer(sdp));
                }
            }
            InboundSignal::NegotiationAnswer { sdp, answerer } => {
                self.route(&answerer, PeerCommand::RemoteAnswer(sdp));
            }
            InboundSignal::Candidate { candidate, source } => {
                self.route(&source, PeerCommand::RemoteCandidate(candidate));
            }
            InboundSignal::PeerLeft { peer } => self.disconnect(&peer),
            InboundSignal::RoomFull => {
                warn!("Join rejected: room is full");
                self.presenter.notify(UserNotice::RoomFull);
                return Some(MeshExit::RoomFull);
            }
            InboundSignal::MuteDirective => {
                self.set_local_audio(Some(false));
            }
            InboundSignal::UnmuteDirective => {
                self.set_local_audio(Some(true));
            }
        }
        None
    }

    async fn on_occupant_list(&mut self, peers: Vec<PeerId>) {
        let role = if peers.is_empty() {
            ParticipantRole::Admin
        } else {
            ParticipantRole::Member
        };
        match self.role.set(role) {
            Ok(()) => info!("Joined as {:?} with {} other participant(s)", role, peers.len()),
            Err(_) => debug!("Role already assigned; ignoring repeated occupant list"),
        }

        for peer_id in peers {
            if self.registry.contains(&peer_id) || self.registry.is_departed(&peer_id) {
                debug!("Not calling peer {}: already known", peer_id);
                continue;
            }
            if self.create_peer(peer_id.clone(), Role::Caller).await {
                // Attaching tracks makes the engine ask for negotiation.
                self.route(&peer_id, PeerCommand::AttachLocalTracks);
            }
        }
    }

    /// Returns false if the peer could not be set up; other peers are unaffected.
    async fn create_peer(&mut self, peer_id: PeerId, role: Role) -> bool {
        let events = EngineEvents::new(peer_id.clone(), self.engine_tx.clone());
        let connection = match self.engine.new_connection(events).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Could not create connection for peer {}: {}", peer_id, e);
                self.presenter.notify(UserNotice::PeerProblem {
                    peer_id,
                    message: e.to_string(),
                });
                return false;
            }
        };

        let tracks = self
            .local
            .as_ref()
            .map(|stream| stream.tracks().to_vec())
            .unwrap_or_default();
        let handle = spawn_peer(
            peer_id.clone(),
            role,
            connection,
            tracks,
            Arc::clone(&self.signaling),
            self.options.negotiation,
        );
        match self.registry.register(peer_id.clone(), handle) {
            Ok(()) => {
                info!("Created {:?} connection for peer {}", role, peer_id);
                true
            }
            Err(e) => {
                // The rejected handle was dropped; its task closes the connection.
                warn!("{}", e);
                false
            }
        }
    }

    /// Late or orphan messages for unknown peers are dropped here.
    fn route(&self, peer_id: &str, command: PeerCommand) {
        match self.registry.get(peer_id) {
            Some(handle) => {
                if !handle.send(command) {
                    debug!("Peer {} task already finished", peer_id);
                }
            }
            None => debug!("Dropping message for unknown peer {}", peer_id),
        }
    }

    fn disconnect(&mut self, peer_id: &str) {
        match self.registry.remove(peer_id) {
            Some(handle) => {
                handle.send(PeerCommand::Close(None));
                info!("Peer {} left", peer_id);
            }
            None => debug!("Disconnect for unknown peer {}", peer_id),
        }
    }

    async fn handle_engine_event(&mut self, peer_id: PeerId, event: EngineEvent) {
        if !self.registry.contains(&peer_id) {
            debug!("Dropping engine event for closed peer {}", peer_id);
            return;
        }
        match event {
            EngineEvent::NegotiationNeeded => self.route(&peer_id, PeerCommand::NegotiationNeeded),
            EngineEvent::LocalCandidate(candidate) => {
                self.relay_local_candidate(&peer_id, candidate).await
            }
            EngineEvent::RemoteTrack { track_id } => {
                debug!("Remote track {} from peer {}", track_id, peer_id);
                let mute_control = self.role() == Some(ParticipantRole::Admin);
                self.presenter.show_participant(&peer_id, mute_control);
            }
            EngineEvent::TransportChanged(state) => {
                if state == TransportState::Failed {
                    self.presenter.notify(UserNotice::PeerProblem {
                        peer_id: peer_id.clone(),
                        message: "connection failed".to_string(),
                    });
                }
                self.route(&peer_id, PeerCommand::TransportChanged(state));
            }
        }
    }

    async fn relay_local_candidate(&self, source: &str, candidate: IceCandidate) {
        let targets = match self.options.candidate_routing {
            CandidateRouting::Scoped => vec![source.to_string()],
            CandidateRouting::Broadcast => self.registry.ids(),
        };
        for target in targets {
            let signal = OutboundSignal::Candidate {
                candidate: candidate.clone(),
                target,
            };
            if let Err(e) = self.signaling.send(signal).await {
                warn!("Failed to relay candidate from peer {}: {}", source, e);
            }
        }
    }

    /// `None` toggles. Returns whether audio is now enabled. Never signals.
    fn set_local_audio(&self, enabled: Option<bool>) -> bool {
        let Some(stream) = &self.local else {
            debug!("No local stream to mute");
            return false;
        };
        let target = enabled.unwrap_or(!stream.is_audio_enabled());
        stream.set_audio_enabled(target);
        info!("Local audio {}", if target { "unmuted" } else { "muted" });
        target
    }

    async fn mute_peer(&self, peer_id: PeerId, muted: bool) -> Result<()> {
        if self.role() != Some(ParticipantRole::Admin) {
            return Err(Error::NotAdmin);
        }
        if !self.registry.contains(&peer_id) {
            return Err(Error::UnknownPeer(peer_id));
        }
        let signal = if muted {
            OutboundSignal::MuteDirective { target: peer_id }
        } else {
            OutboundSignal::UnmuteDirective { target: peer_id }
        };
        self.signaling.send(signal).await
    }

    fn snapshot(&self) -> MeshSnapshot {
        let mut peers: Vec<PeerStatus> = self.registry.iter().map(|(_, h)| h.status()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        MeshSnapshot {
            role: self.role(),
            audio_enabled: self
                .local
                .as_ref()
                .map(LocalStream::is_audio_enabled)
                .unwrap_or(false),
            peers,
        }
    }

    /// Returns true once the operator has left.
    async fn handle_command(&mut self, command: MeshCommand) -> bool {
        match command {
            MeshCommand::SetLocalAudio { enabled, reply } => {
                let _ = reply.send(self.set_local_audio(enabled));
            }
            MeshCommand::MutePeer {
                peer_id,
                muted,
                reply,
            } => {
                let _ = reply.send(self.mute_peer(peer_id, muted).await);
            }
            MeshCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            MeshCommand::Subscribe { peer_id, reply } => {
                let _ = reply.send(self.registry.get(&peer_id).map(|h| h.subscribe()));
            }
            MeshCommand::Leave(ack) => {
                self.shutdown().await;
                let _ = ack.send(());
                return true;
            }
        }
        false
    }

    async fn shutdown(&mut self) {
        let peers = self.registry.drain();
        if !peers.is_empty() {
            info!("Closing {} peer connection(s)", peers.len());
        }
        join_all(peers.iter().map(|(_, handle)| handle.close())).await;
    }
}
