//! Per-peer negotiation.
//!
//! Every peer connection gets one task that owns its [`RtcConnection`] and
//! consumes [`PeerCommand`]s in arrival order. That queue is what keeps a
//! peer to a single offer/answer round at a time, while tasks for different
//! peers run independently of each other.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::engine::{IceCandidate, RtcConnection, SessionDescription, TransportState};
use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::peer::{PeerState, PeerStatus, Role, StatusMonitor};
use crate::signaling::{OutboundSignal, SignalingChannel};
use crate::PeerId;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum PeerCommand {
    AttachLocalTracks,
    NegotiationNeeded,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    TransportChanged(TransportState),
    Close(Option<oneshot::Sender<()>>),
}

/// How long to wait for an answer and how often to re-offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// `None` waits forever, leaving the peer in `OfferSent`.
    pub answer_timeout: Option<Duration>,
    pub max_offer_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            answer_timeout: None,
            max_offer_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl NegotiationPolicy {
    /// Exponential in the attempt number, capped, plus up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .retry_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(MAX_BACKOFF);
        let jitter_ms = (base.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        base + Duration::from_millis(jitter)
    }
}

/// The controller's handle on one peer task.
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
    monitor: StatusMonitor,
}

impl PeerHandle {
    /// A handle with no task behind it; commands go nowhere.
    #[cfg(test)]
    pub(crate) fn detached(peer_id: PeerId, role: Role) -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            commands,
            monitor: StatusMonitor::new(peer_id, role),
        }
    }

    /// Returns false if the task has already finished.
    pub fn send(&self, command: PeerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn state(&self) -> PeerState {
        self.monitor.state()
    }

    pub fn status(&self) -> PeerStatus {
        self.monitor.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.monitor.subscribe()
    }

    /// Ask the task to close and wait until it has.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.send(PeerCommand::Close(Some(ack_tx))) {
            let _ = ack_rx.await;
        }
    }
}

pub fn spawn_peer(
    peer_id: PeerId,
    role: Role,
    connection: Arc<dyn RtcConnection>,
    tracks: Vec<LocalTrack>,
    signaling: Arc<dyn SignalingChannel>,
    policy: NegotiationPolicy,
) -> PeerHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let monitor = StatusMonitor::new(peer_id.clone(), role);

    let negotiator = Negotiator {
        peer_id,
        role,
        connection,
        tracks,
        signaling,
        policy,
        monitor: monitor.clone(),
        tracks_attached: false,
        renegotiate: false,
        offer_attempts: 0,
        timer: None,
    };
    tokio::spawn(negotiator.run(rx));

    PeerHandle { commands, monitor }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    AnswerTimeout,
    RetryOffer,
}

struct Negotiator {
    peer_id: PeerId,
    role: Role,
    connection: Arc<dyn RtcConnection>,
    tracks: Vec<LocalTrack>,
    signaling: Arc<dyn SignalingChannel>,
    policy: NegotiationPolicy,
    monitor: StatusMonitor,
    tracks_attached: bool,
    /// Negotiation was requested while a round was outstanding.
    renegotiate: bool,
    /// Offers sent in the current round, retries included.
    offer_attempts: u32,
    timer: Option<(Instant, Timer)>,
}

impl Negotiator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        loop {
            let command = match self.timer {
                Some((deadline, timer)) => tokio::select! {
                    command = commands.recv() => command,
                    _ = sleep_until(deadline) => {
                        self.timer = None;
                        self.on_timer(timer).await;
                        continue;
                    }
                },
                None => commands.recv().await,
            };

            let Some(command) = command else {
                // The controller is gone; nobody will ever address this peer again.
                self.close(None).await;
                break;
            };
            if !self.handle(command).await {
                break;
            }
        }
        debug!("Negotiation task for peer {} finished", self.peer_id);
    }

    /// Returns false once the connection is closed.
    async fn handle(&mut self, command: PeerCommand) -> bool {
        if self.monitor.state() == PeerState::Closed {
            if let PeerCommand::Close(Some(ack)) = command {
                let _ = ack.send(());
            }
            return false;
        }

        match command {
            PeerCommand::AttachLocalTracks => {
                if let Err(e) = self.attach_local_tracks().await {
                    self.recoverable(e);
                }
            }
            PeerCommand::NegotiationNeeded => self.on_negotiation_needed().await,
            PeerCommand::RemoteOffer(offer) => self.on_remote_offer(offer).await,
            PeerCommand::RemoteAnswer(answer) => self.on_remote_answer(answer).await,
            PeerCommand::RemoteCandidate(candidate) => self.on_remote_candidate(candidate).await,
            PeerCommand::TransportChanged(transport) => {
                debug!("Peer {} transport is now {}", self.peer_id, transport);
                self.monitor.update_transport(transport);
            }
            PeerCommand::Close(ack) => {
                self.close(ack).await;
                return false;
            }
        }
        true
    }

    async fn attach_local_tracks(&mut self) -> Result<()> {
        if self.tracks_attached {
            return Ok(());
        }
        // Flag first: a half-failed attach must not be repeated on this connection.
        self.tracks_attached = true;
        for track in &self.tracks {
            self.connection.add_local_track(track).await?;
        }
        debug!("Attached {} local track(s) for peer {}", self.tracks.len(), self.peer_id);
        Ok(())
    }

    async fn on_negotiation_needed(&mut self) {
        match (self.role, self.monitor.state()) {
            (Role::Callee, PeerState::New | PeerState::Answering) => {
                debug!("Peer {} is calling us; not offering", self.peer_id);
            }
            (_, PeerState::Negotiating | PeerState::OfferSent | PeerState::Answering) => {
                debug!(
                    "Negotiation with peer {} already outstanding; deferring",
                    self.peer_id
                );
                self.renegotiate = true;
            }
            _ => self.start_offer_round().await,
        }
    }

    async fn start_offer_round(&mut self) {
        let previous = self.monitor.state();
        self.renegotiate = false;
        self.offer_attempts = 0;
        self.monitor.update_state(PeerState::Negotiating);

        if let Err(e) = self.send_offer().await {
            self.monitor.update_state(previous);
            self.recoverable(e);
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.signaling
            .send(OutboundSignal::NegotiationRequest {
                sdp: offer,
                target: self.peer_id.clone(),
            })
            .await?;

        self.offer_attempts += 1;
        self.monitor.record_offer();
        self.monitor.update_state(PeerState::OfferSent);
        info!("Sent offer to peer {} (attempt {})", self.peer_id, self.offer_attempts);

        self.timer = self
            .policy
            .answer_timeout
            .map(|timeout| (Instant::now() + timeout, Timer::AnswerTimeout));
        Ok(())
    }

    async fn on_timer(&mut self, timer: Timer) {
        if self.monitor.state() != PeerState::OfferSent {
            return;
        }
        match timer {
            Timer::AnswerTimeout if self.offer_attempts <= self.policy.max_offer_retries => {
                let delay = self.policy.backoff(self.offer_attempts);
                warn!(
                    "No answer from peer {}; re-offering in {:?}",
                    self.peer_id, delay
                );
                self.timer = Some((Instant::now() + delay, Timer::RetryOffer));
            }
            Timer::AnswerTimeout => {
                self.recoverable(Error::NegotiationTimeout {
                    peer: self.peer_id.clone(),
                    attempts: self.offer_attempts,
                });
            }
            Timer::RetryOffer => {
                // Replaces the unanswered offer; still one in flight.
                if let Err(e) = self.send_offer().await {
                    self.recoverable(e);
                }
            }
        }
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) {
        if self.monitor.state() != PeerState::OfferSent {
            self.recoverable(Error::RemoteDescription {
                peer: self.peer_id.clone(),
                reason: format!("stale answer while {}", self.monitor.state()),
            });
            return;
        }

        match self.connection.set_remote_description(answer).await {
            Ok(()) => {
                self.timer = None;
                self.monitor.update_state(PeerState::Connected);
                info!("Negotiation with peer {} complete", self.peer_id);
                if self.renegotiate {
                    self.start_offer_round().await;
                }
            }
            Err(e) => self.recoverable(Error::RemoteDescription {
                peer: self.peer_id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) {
        match self.monitor.state() {
            PeerState::Negotiating | PeerState::OfferSent => {
                self.recoverable(Error::RemoteDescription {
                    peer: self.peer_id.clone(),
                    reason: "offer collided with our own outstanding offer".to_string(),
                });
                return;
            }
            _ => {}
        }

        let previous = self.monitor.state();
        self.monitor.update_state(PeerState::Answering);
        match self.answer(offer).await {
            Ok(()) => {
                self.monitor.update_state(PeerState::Connected);
                info!("Answered peer {}", self.peer_id);
                if self.renegotiate {
                    self.start_offer_round().await;
                }
            }
            Err(e) => {
                self.monitor.update_state(previous);
                self.recoverable(e);
            }
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<()> {
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::RemoteDescription {
                peer: self.peer_id.clone(),
                reason: e.to_string(),
            })?;
        self.attach_local_tracks().await?;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.signaling
            .send(OutboundSignal::NegotiationAnswer {
                sdp: answer,
                target: self.peer_id.clone(),
            })
            .await
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            self.recoverable(Error::Candidate {
                peer: self.peer_id.clone(),
                reason: e.to_string(),
            });
        }
    }

    async fn close(&mut self, ack: Option<oneshot::Sender<()>>) {
        self.timer = None;
        if let Err(e) = self.connection.close().await {
            debug!("Closing connection to peer {} failed: {}", self.peer_id, e);
        }
        self.monitor.update_transport(TransportState::Closed);
        self.monitor.update_state(PeerState::Closed);
        info!("Connection to peer {} closed", self.peer_id);
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    /// Logged and recorded; the state stays where it is.
    fn recoverable(&self, error: Error) {
        warn!("Peer {}: {}", self.peer_id, error);
        self.monitor.set_error(error.to_string());
    }
}
