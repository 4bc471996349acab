#![allow(dead_code)]

use async_trait::async_trait;
use meshcall::client::media::{LocalTrack, MediaDevices, OutgoingTracks, SyntheticDevices, TrackKind, UserMedia};
use meshcall::client::transport::{
    IceCandidate, PeerTransport, RemoteTrack, SessionDescription, TransportEvent, TransportEvents, TransportFactory,
};
use meshcall::client::{MeshCoordinator, MeshEvent};
use meshcall::room::RosterStore;
use meshcall::signaling::{ClientMessage, MessageHandler, SignalCodec, SignalingRelay};
use meshcall::types::ConnectionId;
use meshcall::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const ROOM: &str = "standup";
pub const KEY: &str = "shared-test-key";

/// Polls an async condition until it holds or five seconds pass.
#[macro_export]
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

/// What one scripted transport was asked to do.
pub struct Probe {
    pub peer_id: ConnectionId,
    pub calls: Mutex<Vec<String>>,
    pub video: Mutex<Option<Arc<LocalTrack>>>,
    pub attempted: Mutex<Vec<Option<Arc<LocalTrack>>>>,
    pub fail_replace: AtomicBool,
    pub hang_offer: bool,
    pub closes: AtomicUsize,
}

impl Probe {
    pub fn video_id(&self) -> Option<String> {
        self.video.lock().as_ref().map(|t| t.id().to_string())
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }
}

/// Transport that completes negotiation as soon as offer and answer have
/// crossed the relay.
struct ScriptedTransport {
    local: String,
    probe: Arc<Probe>,
    events: TransportEvents,
}

impl ScriptedTransport {
    /// Candidates only appear once a local description is installed.
    fn gather(&self) {
        let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{}", self.local),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
    }

    fn connect(&self) {
        let _ = self.events.send(TransportEvent::RemoteTrack(RemoteTrack {
            id: format!("{}-video", self.probe.peer_id),
            stream_id: self.probe.peer_id.clone(),
            kind: TrackKind::Video,
        }));
        let _ = self.events.send(TransportEvent::Connected);
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.probe.calls.lock().push("create-offer".into());
        if self.probe.hang_offer {
            std::future::pending::<()>().await;
        }
        self.gather();
        Ok(SessionDescription::offer(format!("offer from {}", self.local)))
    }

    async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.probe.calls.lock().push(format!("accept-offer:{}", offer.sdp));
        self.gather();
        self.connect();
        Ok(SessionDescription::answer(format!("answer from {}", self.local)))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<()> {
        self.probe.calls.lock().push(format!("accept-answer:{}", answer.sdp));
        self.connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.probe.calls.lock().push(format!("ice:{}", candidate.candidate));
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        self.probe.attempted.lock().push(track.clone());
        if self.probe.fail_replace.load(Ordering::SeqCst) {
            return Err(Error::Media("scripted replace failure".into()));
        }
        *self.probe.video.lock() = track;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedFactory {
    local: String,
    probes: Mutex<HashMap<ConnectionId, Arc<Probe>>>,
    failing: Mutex<HashSet<ConnectionId>>,
    hang_offers: AtomicBool,
}

impl ScriptedFactory {
    pub fn new(local: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            local: local.into(),
            probes: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            hang_offers: AtomicBool::new(false),
        })
    }

    pub fn probe(&self, peer_id: &str) -> Arc<Probe> {
        self.probes
            .lock()
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no transport towards {}", peer_id))
    }

    /// Transports created from now on never finish producing an offer.
    pub fn hang_offers(&self) {
        self.hang_offers.store(true, Ordering::SeqCst);
    }

    pub fn fail_replace_towards(&self, peer_id: &str) {
        self.failing.lock().insert(peer_id.to_string());
        if let Some(probe) = self.probes.lock().get(peer_id) {
            probe.fail_replace.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(
        &self,
        peer_id: &str,
        tracks: OutgoingTracks,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>> {
        let probe = Arc::new(Probe {
            peer_id: peer_id.to_string(),
            calls: Mutex::new(Vec::new()),
            video: Mutex::new(tracks.video),
            attempted: Mutex::new(Vec::new()),
            fail_replace: AtomicBool::new(self.failing.lock().contains(peer_id)),
            hang_offer: self.hang_offers.load(Ordering::SeqCst),
            closes: AtomicUsize::new(0),
        });
        self.probes.lock().insert(peer_id.to_string(), probe.clone());
        Ok(Box::new(ScriptedTransport {
            local: self.local.clone(),
            probe,
            events,
        }))
    }
}

/// Devices whose camera and microphone are always denied.
pub struct DeniedDevices;

#[async_trait]
impl MediaDevices for DeniedDevices {
    async fn user_media(&self) -> Result<UserMedia> {
        Err(Error::MediaAcquisition("permission denied".into()))
    }

    async fn display_media(&self) -> Result<Arc<LocalTrack>> {
        Err(Error::MediaAcquisition("permission denied".into()))
    }
}

pub fn relay() -> Arc<MessageHandler> {
    Arc::new(MessageHandler::new(Arc::new(SignalingRelay::new(Arc::new(RosterStore::new())))))
}

/// A participant wired to an in-process relay.
pub struct TestClient {
    pub id: ConnectionId,
    pub coordinator: Arc<MeshCoordinator>,
    pub factory: Arc<ScriptedFactory>,
    pub events: broadcast::Receiver<MeshEvent>,
    handler: Arc<MessageHandler>,
    pump: JoinHandle<()>,
    driver: JoinHandle<()>,
}

impl TestClient {
    pub async fn connect(handler: &Arc<MessageHandler>, name: &str) -> Self {
        Self::connect_with(handler, name, KEY, Arc::new(SyntheticDevices::new(name, true))).await
    }

    pub async fn connect_with(
        handler: &Arc<MessageHandler>,
        name: &str,
        key: &str,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (id, server_rx) = handler.relay().connect();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let factory = ScriptedFactory::new(name);
        let (coordinator, session_events) = MeshCoordinator::new(
            name,
            Arc::new(SignalCodec::from_passphrase(key)),
            factory.clone(),
            devices,
            outbound,
        );
        let events = coordinator.subscribe();

        let pump_handler = handler.clone();
        let pump_id = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let _ = pump_handler.handle_message(&pump_id, message);
            }
        });
        let driver = tokio::spawn(coordinator.clone().run(server_rx, session_events));

        let client = Self {
            id,
            coordinator,
            factory,
            events,
            handler: handler.clone(),
            pump,
            driver,
        };
        eventually!("welcome", client.coordinator.local_id().as_deref() == Some(client.id.as_str()));
        client
    }

    pub async fn join(&self) {
        self.coordinator.join(ROOM).await.unwrap();
        eventually!(
            "relay to roster the join",
            self.handler.relay().roster().snapshot(ROOM).iter().any(|p| p.id == self.id)
        );
    }

    /// Drops the connection without leaving first.
    pub fn disconnect(&self) {
        self.pump.abort();
        self.driver.abort();
        self.handler.handle_disconnect(&self.id);
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.pump.abort();
        self.driver.abort();
    }
}
