//! One direct connection to one remote participant.
//!
//! A session is a task that owns its transport and consumes two queues: the
//! commands sent through its [`PeerSession`] handle and the events its
//! transport reports. Video swaps travel on a separate queue that is served
//! even while an offer or answer is being produced. Every state change goes
//! through [`PeerState::can_transition_to`].

use crate::client::media::LocalTrack;
use crate::client::transport::{IceCandidate, PeerTransport, RemoteTrack, SessionDescription, TransportEvent};
use crate::signaling::codec::SignalCodec;
use crate::signaling::messages::ClientMessage;
use crate::types::{ConnectionId, SignalKind};
use crate::utils::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

impl PeerState {
    pub fn can_transition_to(self, next: PeerState) -> bool {
        match (self, next) {
            (PeerState::Closed, _) => false,
            (_, PeerState::Closed) => true,
            (PeerState::Idle, PeerState::Negotiating) => true,
            (PeerState::Negotiating, PeerState::Connected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Was in the room first and sends the offer.
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub timestamp: DateTime<Utc>,
    pub from_state: PeerState,
    pub to_state: PeerState,
}

/// Notifications from a session to whoever owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { peer_id: ConnectionId, state: PeerState },
    RemoteTrack { peer_id: ConnectionId, track: RemoteTrack },
    Closed { peer_id: ConnectionId },
}

/// Shared plumbing every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub codec: Arc<SignalCodec>,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

enum Command {
    Start,
    Remote { kind: SignalKind, ciphertext: String },
}

struct VideoRequest {
    track: Option<Arc<LocalTrack>>,
    ack: oneshot::Sender<Result<()>>,
}

/// Cloneable handle that swaps the outgoing video of one session without
/// holding the session itself.
#[derive(Clone)]
pub struct VideoSwitch {
    peer_id: ConnectionId,
    requests: mpsc::UnboundedSender<VideoRequest>,
    state: watch::Receiver<PeerState>,
}

impl VideoSwitch {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub async fn replace(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let closed = || Error::Peer(format!("session with {} is closed", self.peer_id));
        let (ack, reply) = oneshot::channel();
        self.requests
            .send(VideoRequest { track, ack })
            .map_err(|_| closed())?;
        reply.await.map_err(|_| closed())?
    }
}

enum Step {
    Continue,
    Stop(String),
}

pub struct PeerSession {
    peer_id: ConnectionId,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    video: VideoSwitch,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<PeerState>,
    history: Arc<Mutex<Vec<StateTransition>>>,
    remote_stream: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl PeerSession {
    pub fn spawn(
        peer_id: impl Into<ConnectionId>,
        role: Role,
        transport: Box<dyn PeerTransport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        context: SessionContext,
    ) -> Self {
        let peer_id = peer_id.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (video_tx, video_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(PeerState::Idle);
        let history = Arc::new(Mutex::new(Vec::new()));
        let remote_stream = Arc::new(RwLock::new(Vec::new()));

        let task = SessionTask {
            peer_id: peer_id.clone(),
            role,
            transport,
            context,
            state_tx,
            history: history.clone(),
            remote_stream: remote_stream.clone(),
        };
        tokio::spawn(task.run(command_rx, video_rx, transport_events, shutdown_rx));

        let video = VideoSwitch {
            peer_id: peer_id.clone(),
            requests: video_tx,
            state: state.clone(),
        };
        Self {
            peer_id,
            role,
            commands,
            video,
            shutdown,
            state,
            history,
            remote_stream,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == PeerState::Closed
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.history.lock().clone()
    }

    pub fn remote_stream(&self) -> Vec<RemoteTrack> {
        self.remote_stream.read().clone()
    }

    /// Kicks off the offer. Ignored unless this side is the initiator.
    pub fn start(&self) {
        let _ = self.commands.send(Command::Start);
    }

    pub fn deliver_signal(&self, kind: SignalKind, ciphertext: String) {
        let _ = self.commands.send(Command::Remote { kind, ciphertext });
    }

    pub async fn replace_video(&self, track: Option<Arc<LocalTrack>>) -> Result<()> {
        self.video.replace(track).await
    }

    pub fn video_switch(&self) -> VideoSwitch {
        self.video.clone()
    }

    /// Tears the session down, cancelling any negotiation step in flight.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn closed(&self) {
        let mut state = self.state.clone();
        while *state.borrow() != PeerState::Closed {
            if state.changed().await.is_err() {
                break;
            }
        }
    }
}

struct SessionTask {
    peer_id: ConnectionId,
    role: Role,
    transport: Box<dyn PeerTransport>,
    context: SessionContext,
    state_tx: watch::Sender<PeerState>,
    history: Arc<Mutex<Vec<StateTransition>>>,
    remote_stream: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut video: mpsc::UnboundedReceiver<VideoRequest>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let reason = loop {
            if *shutdown.borrow() {
                break "closed locally".to_string();
            }
            let step = tokio::select! {
                biased;
                _ = shutdown.changed() => Step::Stop("closed locally".to_string()),
                step = self.next_step(&mut commands, &mut video, &mut transport_events) => step,
            };
            if let Step::Stop(reason) = step {
                break reason;
            }
        };
        self.teardown(&reason).await;
    }

    async fn next_step(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        video: &mut mpsc::UnboundedReceiver<VideoRequest>,
        transport_events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Step {
        let work = async {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => Step::Stop("session handle dropped".to_string()),
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
            }
        };
        tokio::pin!(work);

        // Swaps must not wait behind an offer or answer that never completes.
        loop {
            tokio::select! {
                biased;
                step = &mut work => return step,
                Some(request) = video.recv() => {
                    let result = self.transport.replace_video_track(request.track).await;
                    let _ = request.ack.send(result);
                }
            }
        }
    }

    async fn handle_command(&self, command: Command) -> Step {
        match command {
            Command::Start => {
                if self.role != Role::Initiator || self.state() != PeerState::Idle {
                    debug!("Ignoring start for {} in {:?}", self.peer_id, self.state());
                    return Step::Continue;
                }
                self.transition(PeerState::Negotiating);
                match self.transport.create_offer().await {
                    Ok(offer) => {
                        self.send_signal(SignalKind::Offer, &offer);
                        Step::Continue
                    }
                    Err(e) => Step::Stop(format!("creating offer failed: {}", e)),
                }
            }
            Command::Remote { kind, ciphertext } => self.handle_remote(kind, &ciphertext).await,
        }
    }

    async fn handle_remote(&self, kind: SignalKind, ciphertext: &str) -> Step {
        match kind {
            SignalKind::Offer => {
                let offer: SessionDescription = match self.open(kind, ciphertext) {
                    Some(offer) => offer,
                    None => return Step::Continue,
                };
                if self.state() == PeerState::Idle {
                    self.transition(PeerState::Negotiating);
                }
                match self.transport.accept_offer(offer).await {
                    Ok(answer) => {
                        self.send_signal(SignalKind::Answer, &answer);
                        Step::Continue
                    }
                    Err(e) => Step::Stop(format!("answering offer failed: {}", e)),
                }
            }
            SignalKind::Answer => {
                let answer: SessionDescription = match self.open(kind, ciphertext) {
                    Some(answer) => answer,
                    None => return Step::Continue,
                };
                if self.role != Role::Initiator {
                    warn!("Unexpected answer from {}; this side did not offer", self.peer_id);
                    return Step::Continue;
                }
                match self.transport.accept_answer(answer).await {
                    Ok(()) => Step::Continue,
                    Err(e) => Step::Stop(format!("applying answer failed: {}", e)),
                }
            }
            SignalKind::IceCandidate => {
                if let Some(candidate) = self.open::<IceCandidate>(kind, ciphertext) {
                    if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                        warn!("Could not add ICE candidate from {}: {}", self.peer_id, e);
                    }
                }
                Step::Continue
            }
        }
    }

    async fn handle_transport_event(&self, event: TransportEvent) -> Step {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalKind::IceCandidate, &candidate);
                Step::Continue
            }
            TransportEvent::Connected => {
                if self.state() == PeerState::Negotiating {
                    self.transition(PeerState::Connected);
                }
                Step::Continue
            }
            TransportEvent::Failed(reason) => Step::Stop(reason),
            TransportEvent::RemoteTrack(track) => {
                debug!("{:?} track {} from {}", track.kind, track.id, self.peer_id);
                self.remote_stream.write().push(track.clone());
                let _ = self.context.events.send(SessionEvent::RemoteTrack {
                    peer_id: self.peer_id.clone(),
                    track,
                });
                Step::Continue
            }
        }
    }

    fn open<T: serde::de::DeserializeOwned>(&self, kind: SignalKind, ciphertext: &str) -> Option<T> {
        match self.context.codec.open(ciphertext) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Dropping {:?} from {}: {}", kind, self.peer_id, e);
                None
            }
        }
    }

    fn send_signal<T: Serialize>(&self, kind: SignalKind, payload: &T) {
        let ciphertext = match self.context.codec.seal(payload) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!("Could not seal {:?} for {}: {}", kind, self.peer_id, e);
                return;
            }
        };
        let message = ClientMessage::Signal {
            kind,
            recipient_id: self.peer_id.clone(),
            ciphertext,
        };
        if self.context.outbound.send(message).is_err() {
            warn!("Signaling channel closed; {:?} for {} not sent", kind, self.peer_id);
        }
    }

    fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: PeerState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            debug!("Rejected transition {:?} -> {:?} for {}", current, next, self.peer_id);
            return false;
        }

        self.history.lock().push(StateTransition {
            timestamp: Utc::now(),
            from_state: current,
            to_state: next,
        });
        self.state_tx.send_replace(next);
        info!("Session with {}: {:?} -> {:?}", self.peer_id, current, next);
        let _ = self.context.events.send(SessionEvent::StateChanged {
            peer_id: self.peer_id.clone(),
            state: next,
        });
        true
    }

    async fn teardown(&mut self, reason: &str) {
        info!("Closing session with {}: {}", self.peer_id, reason);
        if let Err(e) = self.transport.close().await {
            warn!("Error closing transport to {}: {}", self.peer_id, e);
        }
        self.remote_stream.write().clear();
        self.transition(PeerState::Closed);
        let _ = self.context.events.send(SessionEvent::Closed {
            peer_id: self.peer_id.clone(),
        });
    }
}
