#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use mesh_call::engine::{
    EngineEvent, EngineEvents, IceCandidate, RtcConnection, RtcEngine, SessionDescription,
};
use mesh_call::media::{LocalStream, LocalTrack, MediaSource, SilentSource};
use mesh_call::presentation::{Presenter, UserNotice};
use mesh_call::signaling::{InboundSignal, OutboundSignal, SignalingChannel};
use mesh_call::{
    Error, MeshController, MeshExit, MeshHandle, MeshOptions, MeshSnapshot, PeerState,
    PeerStatus, Result,
};

/// Connection that answers instantly and reports what was asked of it.
pub struct FakeConnection {
    events: EngineEvents,
    calls: Mutex<Vec<String>>,
    applied_candidates: Mutex<Vec<IceCandidate>>,
    reject_remote: AtomicBool,
    has_remote: AtomicBool,
}

impl FakeConnection {
    fn new(events: EngineEvents) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            applied_candidates: Mutex::new(Vec::new()),
            reject_remote: AtomicBool::new(false),
            has_remote: AtomicBool::new(false),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().unwrap().clone()
    }

    pub fn reject_remote_descriptions(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }
}

#[async_trait]
impl RtcConnection for FakeConnection {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        self.record(format!("add_track:{}", track.id()));
        // Tracks added while answering ride along in the answer.
        if !self.has_remote.load(Ordering::SeqCst) {
            self.events.emit(EngineEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record("create_offer");
        Ok(SessionDescription::offer(format!("offer-for-{}", self.events.peer_id())))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record("create_answer");
        Ok(SessionDescription::answer(format!("answer-for-{}", self.events.peer_id())))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.record("set_local");
        let local = candidate(&format!("local-{}", self.events.peer_id()));
        self.events.emit(EngineEvent::LocalCandidate(local));
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        self.record("set_remote");
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(Error::Signaling("malformed description".to_string()));
        }
        self.has_remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.applied_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeEngine {
    connections: Mutex<HashMap<String, Arc<FakeConnection>>>,
    refuse: Mutex<HashSet<String>>,
    created: Mutex<usize>,
}

impl FakeEngine {
    pub fn refuse(&self, peer_id: &str) {
        self.refuse.lock().unwrap().insert(peer_id.to_string());
    }

    pub fn connection(&self, peer_id: &str) -> Arc<FakeConnection> {
        self.connections
            .lock()
            .unwrap()
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no connection for {}", peer_id))
    }

    pub fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    async fn new_connection(&self, events: EngineEvents) -> Result<Arc<dyn RtcConnection>> {
        let peer_id = events.peer_id().to_string();
        if self.refuse.lock().unwrap().contains(&peer_id) {
            return Err(Error::Signaling(format!("engine refused {}", peer_id)));
        }
        let connection = Arc::new(FakeConnection::new(events));
        self.connections
            .lock()
            .unwrap()
            .insert(peer_id, Arc::clone(&connection));
        *self.created.lock().unwrap() += 1;
        Ok(connection)
    }
}

#[derive(Default)]
pub struct FakeSignaling {
    sent: Mutex<Vec<OutboundSignal>>,
}

impl FakeSignaling {
    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.sent().iter().filter(|s| s.name() == event).count()
    }

    pub fn count_to(&self, event: &str, target: &str) -> usize {
        self.sent()
            .iter()
            .filter(|s| s.name() == event && s.target() == Some(target))
            .count()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    shown: Mutex<Vec<(String, bool)>>,
    released: Mutex<Vec<String>>,
    notices: Mutex<Vec<UserNotice>>,
}

impl RecordingPresenter {
    pub fn shown(&self) -> Vec<(String, bool)> {
        self.shown.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<UserNotice> {
        self.notices.lock().unwrap().clone()
    }
}

impl Presenter for RecordingPresenter {
    fn show_participant(&self, peer_id: &str, mute_control: bool) {
        self.shown
            .lock()
            .unwrap()
            .push((peer_id.to_string(), mute_control));
    }

    fn release(&self, peer_id: &str) {
        self.released.lock().unwrap().push(peer_id.to_string());
    }

    fn notify(&self, notice: UserNotice) {
        self.notices.lock().unwrap().push(notice);
    }
}

pub struct BrokenMicrophone;

#[async_trait]
impl MediaSource for BrokenMicrophone {
    async fn acquire(&self) -> Result<LocalStream> {
        Err(Error::MediaAcquisition("permission denied".to_string()))
    }
}

pub struct Harness {
    pub handle: MeshHandle,
    pub inbound: mpsc::Sender<InboundSignal>,
    pub engine: Arc<FakeEngine>,
    pub signaling: Arc<FakeSignaling>,
    pub presenter: Arc<RecordingPresenter>,
    pub task: JoinHandle<Result<MeshExit>>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(MeshOptions::default()).await
    }

    pub async fn start_with(options: MeshOptions) -> Self {
        let engine = Arc::new(FakeEngine::default());
        let signaling = Arc::new(FakeSignaling::default());
        let presenter = Arc::new(RecordingPresenter::default());
        let (mut controller, handle) = MeshController::new(
            signaling.clone(),
            engine.clone(),
            presenter.clone(),
            options,
        );
        controller.join("r1", &SilentSource).await.unwrap();

        let (inbound, rx) = mpsc::channel(64);
        let task = tokio::spawn(controller.run(rx));
        Self {
            handle,
            inbound,
            engine,
            signaling,
            presenter,
            task,
        }
    }

    pub async fn deliver(&self, signal: InboundSignal) {
        self.inbound.send(signal).await.unwrap();
    }

    pub async fn snapshot_where(
        &self,
        what: &str,
        pred: impl Fn(&MeshSnapshot) -> bool,
    ) -> MeshSnapshot {
        timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = self.handle.snapshot().await.unwrap();
                if pred(&snapshot) {
                    return snapshot;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
    }

    pub async fn peer_where(
        &self,
        peer_id: &str,
        pred: impl Fn(&PeerStatus) -> bool,
    ) -> PeerStatus {
        self.snapshot_where(peer_id, |s| s.peers.iter().any(|p| p.peer_id == peer_id))
            .await;
        let mut rx = self.handle.subscribe(peer_id).await.unwrap().unwrap();
        let status = timeout(Duration::from_secs(2), rx.wait_for(|s| pred(s)))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting on peer {}", peer_id))
            .unwrap()
            .clone();
        status
    }

    /// Inbound signals are handled in order: once the trailing unmute has
    /// taken effect, everything delivered earlier has been processed too.
    /// Leaves local audio enabled.
    pub async fn flush_inbound(&self) {
        self.deliver(InboundSignal::MuteDirective).await;
        self.snapshot_where("flush mute", |s| !s.audio_enabled).await;
        self.deliver(InboundSignal::UnmuteDirective).await;
        self.snapshot_where("flush unmute", |s| s.audio_enabled).await;
    }

    pub async fn wait_for_state(&self, peer_id: &str, state: PeerState) -> PeerStatus {
        self.peer_where(peer_id, |s| s.state == state).await
    }
}

pub async fn eventually(what: &str, pred: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !pred() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

pub fn candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2130706431 10.0.0.1 50000 typ host", tag),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
