//! Client side of the mesh: one [`PeerSession`] per other participant,
//! driven by relay messages.

use crate::client::media::{LocalTrack, MediaDevices, MediaTrackSet};
use crate::client::session::{PeerSession, PeerState, Role, SessionContext, SessionEvent, VideoSwitch};
use crate::client::transport::{RemoteTrack, TransportFactory};
use crate::signaling::codec::SignalCodec;
use crate::signaling::messages::{ClientMessage, ServerMessage};
use crate::types::{BroadcastKind, ConnectionId, Participant, RoomKey, SignalKind};
use crate::utils::{Error, Result};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

const EVENT_CAPACITY: usize = 256;

/// What presentation layers observe.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Welcomed { local_id: ConnectionId },
    RosterUpdated { participants: Vec<Participant> },
    PeerState { peer_id: ConnectionId, state: PeerState },
    RemoteTrack { peer_id: ConnectionId, track: RemoteTrack },
    PeerClosed { peer_id: ConnectionId },
    Broadcast {
        kind: BroadcastKind,
        sender_id: ConnectionId,
        payload: serde_json::Value,
    },
    ScreenShare { active: bool },
    MediaUnavailable { reason: String },
    RelayError { message: String },
}

#[derive(Default)]
struct MeshState {
    sessions: HashMap<ConnectionId, PeerSession>,
    media: MediaTrackSet,
    roster: Vec<Participant>,
    muted: bool,
}

pub struct MeshCoordinator {
    display_name: String,
    local_id: RwLock<Option<ConnectionId>>,
    room: RwLock<Option<RoomKey>>,
    codec: Arc<SignalCodec>,
    factory: Arc<dyn TransportFactory>,
    devices: Arc<dyn MediaDevices>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<MeshState>,
    /// Serializes screen share changes. Never held together with a wait on
    /// `state`, so teardown cannot queue behind a swap.
    share: Mutex<()>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshCoordinator {
    /// Returns the coordinator and the receiver its sessions report into;
    /// hand both to [`MeshCoordinator::run`].
    pub fn new(
        display_name: impl Into<String>,
        codec: Arc<SignalCodec>,
        factory: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session_events, session_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let coordinator = Arc::new(Self {
            display_name: display_name.into(),
            local_id: RwLock::new(None),
            room: RwLock::new(None),
            codec,
            factory,
            devices,
            outbound,
            session_events,
            state: Mutex::new(MeshState::default()),
            share: Mutex::new(()),
            events,
        });
        (coordinator, session_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn local_id(&self) -> Option<ConnectionId> {
        self.local_id.read().clone()
    }

    pub fn room(&self) -> Option<RoomKey> {
        self.room.read().clone()
    }

    /// Processes relay messages and session reports until the signaling
    /// connection goes away, then leaves.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_server_message(message).await,
                    None => {
                        info!("Relay connection lost");
                        break;
                    }
                },
                Some(event) = session_events.recv() => self.handle_session_event(event).await,
            }
        }
        self.leave().await;
    }

    pub async fn join(&self, room_key: &str) -> Result<()> {
        let muted = match self.devices.user_media().await {
            Ok(user_media) => {
                let mut state = self.state.lock().await;
                state.media.camera = user_media.camera;
                state.media.microphone = user_media.microphone;
                if let Some(microphone) = &state.media.microphone {
                    microphone.set_enabled(!state.muted);
                }
                state.muted
            }
            Err(e) => {
                warn!("Joining {} without local media: {}", room_key, e);
                self.emit(MeshEvent::MediaUnavailable { reason: e.to_string() });
                self.state.lock().await.muted
            }
        };

        *self.room.write() = Some(room_key.to_string());
        self.send(ClientMessage::JoinRoom {
            room_key: room_key.to_string(),
            display_name: self.display_name.clone(),
        })?;
        // The relay drops mute reports from connections outside a room.
        if muted {
            self.send(ClientMessage::SetMuted { muted })?;
        }
        info!("Joining room {} as {}", room_key, self.display_name);
        Ok(())
    }

    pub async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { id } => {
                info!("Relay assigned id {}", id);
                *self.local_id.write() = Some(id.clone());
                self.emit(MeshEvent::Welcomed { local_id: id });
            }
            ServerMessage::ParticipantJoined { id, display_name } => {
                if self.is_self(&id) {
                    return;
                }
                let mut state = self.state.lock().await;
                if state.sessions.get(&id).map_or(false, |s| !s.is_closed()) {
                    debug!("Already connected to {}", id);
                    return;
                }
                info!("{} ({}) joined; sending offer", display_name, id);
                self.open_session(&mut state, id, Role::Initiator).await;
            }
            ServerMessage::ParticipantLeft { id } => {
                let mut state = self.state.lock().await;
                if let Some(session) = state.sessions.remove(&id) {
                    info!("{} left; closing session", id);
                    session.close();
                }
            }
            ServerMessage::Roster { participants } => {
                let mut state = self.state.lock().await;
                let stale: Vec<ConnectionId> = state
                    .sessions
                    .keys()
                    .filter(|peer_id| !participants.iter().any(|p| &p.id == *peer_id))
                    .cloned()
                    .collect();
                for peer_id in stale {
                    if let Some(session) = state.sessions.remove(&peer_id) {
                        debug!("{} no longer rostered; closing session", peer_id);
                        session.close();
                    }
                }
                state.roster = participants.clone();
                drop(state);
                self.emit(MeshEvent::RosterUpdated { participants });
            }
            ServerMessage::Signal { kind, sender_id, ciphertext } => {
                let mut state = self.state.lock().await;
                let live = state.sessions.get(&sender_id).filter(|s| !s.is_closed()).is_some();
                if !live {
                    if kind != SignalKind::Offer {
                        debug!("Dropping {:?} from {} without a session", kind, sender_id);
                        return;
                    }
                    self.open_session(&mut state, sender_id.clone(), Role::Responder).await;
                }
                if let Some(session) = state.sessions.get(&sender_id) {
                    session.deliver_signal(kind, ciphertext);
                }
            }
            ServerMessage::Broadcast { kind, sender_id, payload } => {
                self.emit(MeshEvent::Broadcast { kind, sender_id, payload });
            }
            ServerMessage::Error { message } => {
                warn!("Relay rejected a message: {}", message);
                self.emit(MeshEvent::RelayError { message });
            }
        }
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged { peer_id, state } => {
                self.emit(MeshEvent::PeerState { peer_id, state });
            }
            SessionEvent::RemoteTrack { peer_id, track } => {
                self.emit(MeshEvent::RemoteTrack { peer_id, track });
            }
            SessionEvent::Closed { peer_id } => {
                let mut state = self.state.lock().await;
                if state.sessions.get(&peer_id).map_or(false, |s| s.is_closed()) {
                    state.sessions.remove(&peer_id);
                }
                drop(state);
                self.emit(MeshEvent::PeerClosed { peer_id });
            }
        }
    }

    async fn open_session(&self, state: &mut MeshState, peer_id: ConnectionId, role: Role) {
        let (transport_events, transport_rx) = mpsc::unbounded_channel();
        let transport = match self
            .factory
            .create(&peer_id, state.media.outgoing(), transport_events)
            .await
        {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Could not create transport towards {}: {}", peer_id, e);
                return;
            }
        };

        let session = PeerSession::spawn(peer_id.clone(), role, transport, transport_rx, self.session_context());
        session.start();
        if let Some(previous) = state.sessions.insert(peer_id, session) {
            previous.close();
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            codec: self.codec.clone(),
            outbound: self.outbound.clone(),
            events: self.session_events.clone(),
        }
    }

    /// Flips the microphone and reports the new state to the room.
    /// Returns whether the local participant is now muted. Outside a room
    /// the state is kept locally and reported on join.
    pub async fn toggle_mute(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let muted = !state.muted;
        if self.room.read().is_some() {
            self.send(ClientMessage::SetMuted { muted })?;
        }
        state.muted = muted;
        if let Some(microphone) = &state.media.microphone {
            microphone.set_enabled(!muted);
        }
        Ok(muted)
    }

    /// Captures the screen and puts it on every connected session in place
    /// of the camera. Either every connected session switches or none does.
    /// Sessions still negotiating follow on a best-effort basis, and sessions
    /// opened while sharing start on the screen.
    pub async fn start_screen_share(&self) -> Result<()> {
        let _share = self.share.lock().await;
        if self.room.read().is_none() {
            return Err(Error::Room("not in a room".to_string()));
        }
        if self.is_screen_sharing().await {
            return Ok(());
        }
        let screen = match self.devices.display_media().await {
            Ok(screen) => screen,
            Err(e) => {
                self.emit(MeshEvent::MediaUnavailable { reason: e.to_string() });
                return Err(e);
            }
        };

        let (targets, previous) = {
            let mut state = self.state.lock().await;
            if self.room.read().is_none() {
                screen.stop();
                return Err(Error::Room("left the room during capture".to_string()));
            }
            let previous = state.media.outgoing_video();
            state.media.screen = Some(screen.clone());
            (partition(&state), previous)
        };
        if let Err(e) = self.swap_video(targets, Some(screen.clone()), previous).await {
            let mut state = self.state.lock().await;
            if state.media.screen.as_ref().map_or(false, |s| s.id() == screen.id()) {
                state.media.screen = None;
            }
            drop(state);
            screen.stop();
            return Err(e);
        }
        info!("Screen share started");
        self.emit(MeshEvent::ScreenShare { active: true });
        Ok(())
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        let _share = self.share.lock().await;
        let (targets, screen, camera) = {
            let state = self.state.lock().await;
            let screen = match state.media.screen.clone() {
                Some(screen) => screen,
                None => return Ok(()),
            };
            (partition(&state), screen, state.media.camera.clone())
        };
        self.swap_video(targets, camera, Some(screen.clone())).await?;
        self.state.lock().await.media.screen = None;
        screen.stop();
        info!("Screen share stopped");
        self.emit(MeshEvent::ScreenShare { active: false });
        Ok(())
    }

    /// Replaces the outgoing video on the connected `targets`. On the first
    /// failure every live session goes back to `previous`, including any
    /// opened meanwhile. Pending sessions are switched afterwards and their
    /// failures only logged.
    async fn swap_video(
        &self,
        targets: SwapTargets,
        next: Option<Arc<LocalTrack>>,
        previous: Option<Arc<LocalTrack>>,
    ) -> Result<()> {
        for target in &targets.connected {
            match target.replace(next.clone()).await {
                Ok(()) => {}
                // A session that closed meanwhile has nothing to swap.
                Err(_) if target.state() == PeerState::Closed => {}
                Err(e) => {
                    warn!("Track swap failed on {}: {}; reverting", target.peer_id(), e);
                    let live: Vec<VideoSwitch> = {
                        let state = self.state.lock().await;
                        state
                            .sessions
                            .values()
                            .filter(|s| !s.is_closed() && s.peer_id() != target.peer_id())
                            .map(|s| s.video_switch())
                            .collect()
                    };
                    for session in live {
                        if let Err(revert) = session.replace(previous.clone()).await {
                            warn!("Could not revert video on {}: {}", session.peer_id(), revert);
                        }
                    }
                    return Err(e);
                }
            }
        }
        for session in &targets.pending {
            if let Err(e) = session.replace(next.clone()).await {
                debug!("Pending session {} kept its video: {}", session.peer_id(), e);
            }
        }
        Ok(())
    }

    /// Sends a chat message, file or drawing stroke to everyone else in the room.
    pub fn broadcast(&self, kind: BroadcastKind, payload: serde_json::Value) -> Result<()> {
        if self.room.read().is_none() {
            return Err(Error::Room("not in a room".to_string()));
        }
        self.send(ClientMessage::Broadcast { kind, payload })
    }

    /// Closes every session, releases local media and leaves the room.
    /// Safe to call at any point and more than once.
    pub async fn leave(&self) {
        let mut state = self.state.lock().await;
        for (peer_id, session) in state.sessions.drain() {
            if session.state() == PeerState::Negotiating {
                warn!("{}", Error::NegotiationStalled(peer_id));
            }
            session.close();
        }
        state.media.stop_all();
        state.roster.clear();
        drop(state);

        if let Some(room_key) = self.room.write().take() {
            info!("Leaving room {}", room_key);
            let _ = self.outbound.send(ClientMessage::LeaveRoom);
        }
    }

    pub async fn peer_ids(&self) -> Vec<ConnectionId> {
        let state = self.state.lock().await;
        let mut ids: Vec<_> = state.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn session_state(&self, peer_id: &str) -> Option<PeerState> {
        self.state.lock().await.sessions.get(peer_id).map(|s| s.state())
    }

    pub async fn session_role(&self, peer_id: &str) -> Option<Role> {
        self.state.lock().await.sessions.get(peer_id).map(|s| s.role())
    }

    pub async fn remote_stream(&self, peer_id: &str) -> Vec<RemoteTrack> {
        self.state
            .lock()
            .await
            .sessions
            .get(peer_id)
            .map(|s| s.remote_stream())
            .unwrap_or_default()
    }

    pub async fn roster(&self) -> Vec<Participant> {
        self.state.lock().await.roster.clone()
    }

    pub async fn outgoing_video(&self) -> Option<Arc<LocalTrack>> {
        self.state.lock().await.media.outgoing_video()
    }

    pub async fn microphone(&self) -> Option<Arc<LocalTrack>> {
        self.state.lock().await.media.microphone.clone()
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.state.lock().await.media.is_screen_sharing()
    }

    fn is_self(&self, id: &str) -> bool {
        self.local_id.read().as_deref() == Some(id)
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| Error::Room("signaling connection closed".to_string()))
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

struct SwapTargets {
    connected: Vec<VideoSwitch>,
    pending: Vec<VideoSwitch>,
}

fn partition(state: &MeshState) -> SwapTargets {
    let mut targets = SwapTargets {
        connected: Vec::new(),
        pending: Vec::new(),
    };
    for session in state.sessions.values() {
        match session.state() {
            PeerState::Connected => targets.connected.push(session.video_switch()),
            PeerState::Idle | PeerState::Negotiating => targets.pending.push(session.video_switch()),
            PeerState::Closed => {}
        }
    }
    targets
}
