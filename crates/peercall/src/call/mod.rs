//! Call coordination.
//!
//! A [`Coordinator`] is one task owning everything about a call: presence,
//! the signal router, the pending candidate queue, the peer connection and
//! the negotiation round. It takes one input at a time from three sources
//! (user commands, signaling transport events, engine events) and runs each
//! to completion before looking at the next, so a remote description and the
//! drain that follows it can never interleave with another candidate.
//!
//! The rest of the application talks to it through a [`CoordinatorHandle`]
//! and listens to [`CallEvent`]s.

pub mod candidates;
pub mod lifecycle;
pub mod negotiation;
pub mod presence;
pub mod router;

use std::ops::ControlFlow;
use std::sync::Arc;

use protocol::{IceCandidateData, PeerId, ProtocolError, SdpType, SessionDescription, SignalPayload};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CallError, CallResult, NegotiationStep};
use crate::media::{MediaCapture, MediaConstraints, MediaStream, MediaTrack, RemoteTrack};
use crate::network::{
    ConnectionEvent, ConnectionState, EngineConnection, EngineEvent, IceConfig, PeerEngine,
    SignalingTransport, TransportEvent, TransportState,
};

pub use candidates::{CandidateBuffer, CandidateOutcome, DrainReport};
pub use lifecycle::{ConnectionManager, PeerConnection};
pub use negotiation::{Negotiation, NegotiationPhase};
pub use presence::PresenceTracker;
pub use router::{Classified, SignalRouter};

/// Label of the data channel opened by the calling side.
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "chat";

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Settings a coordinator is started with.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub ice: IceConfig,
    pub constraints: MediaConstraints,
    pub data_channel_label: String,
    /// Select the sender of an incoming offer when no peer is selected yet.
    pub select_caller: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            constraints: MediaConstraints::default(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            select_caller: false,
        }
    }
}

/// Events for the rendering side.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// The signaling server assigned this endpoint its id.
    LocalId(PeerId),
    /// Peers available to call, this endpoint excluded.
    Roster(Vec<PeerId>),
    /// A remote peer sent an offer.
    OfferReceived { from: PeerId },
    /// Local media is ready to preview.
    LocalStream(MediaStream),
    /// The remote peer added a track.
    RemoteTrack(RemoteTrack),
    /// The negotiation round moved to a new phase.
    Phase(NegotiationPhase),
    /// The engine reported a connection state.
    ConnectionState(ConnectionState),
    /// The signaling transport connected or dropped.
    Transport(TransportState),
    DataChannelOpen { label: String },
    DataChannelMessage { label: String, data: Vec<u8> },
}

/// Point-in-time view of the live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub epoch: u64,
    pub state: ConnectionState,
    pub local_description: Option<SdpType>,
    pub remote_description: Option<SdpType>,
    pub local_tracks: Vec<String>,
    pub has_data_channel: bool,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub local_id: Option<PeerId>,
    /// Roster without this endpoint.
    pub peers: Vec<PeerId>,
    pub selected: Option<PeerId>,
    pub phase: NegotiationPhase,
    /// Remote peer of the current negotiation round.
    pub round_peer: Option<PeerId>,
    pub connection: Option<ConnectionSnapshot>,
    pub pending_candidates: usize,
    pub local_stream: Option<MediaStream>,
    pub transport: TransportState,
}

enum Command {
    StartCamera {
        reply: oneshot::Sender<CallResult<MediaStream>>,
    },
    StartCall {
        peer: Option<PeerId>,
        reply: oneshot::Sender<CallResult<()>>,
    },
    SelectPeer {
        peer: Option<PeerId>,
        reply: oneshot::Sender<()>,
    },
    Hangup {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    cancel: watch::Receiver<CancellationToken>,
}

impl CoordinatorHandle {
    async fn request<R>(&self, command: impl FnOnce(oneshot::Sender<R>) -> Command) -> CallResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::Stopped)?;
        response.await.map_err(|_| CallError::Stopped)
    }

    /// Acquires local media and attaches it to the connection, if any.
    pub async fn start_camera(&self) -> CallResult<MediaStream> {
        self.request(|reply| Command::StartCamera { reply }).await?
    }

    /// Selects `peer` and sends it an offer.
    pub async fn start_call(&self, peer: impl Into<PeerId>) -> CallResult<()> {
        let peer = peer.into();
        self.request(|reply| Command::StartCall {
            peer: Some(peer),
            reply,
        })
        .await?
    }

    /// Sends an offer to the already selected peer.
    pub async fn call_selected(&self) -> CallResult<()> {
        self.request(|reply| Command::StartCall { peer: None, reply })
            .await?
    }

    /// Chooses the peer that local candidates and calls are addressed to.
    pub async fn select_peer(&self, peer: Option<PeerId>) -> CallResult<()> {
        self.request(|reply| Command::SelectPeer { peer, reply }).await
    }

    /// Closes the connection. An engine step in flight is abandoned first.
    pub async fn hangup(&self) -> CallResult<()> {
        self.cancel.borrow().cancel();
        self.request(|reply| Command::Hangup { reply }).await
    }

    pub async fn snapshot(&self) -> CallResult<CallSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Closes the connection, disconnects the transport and stops the task.
    pub async fn shutdown(&self) -> CallResult<()> {
        self.cancel.borrow().cancel();
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// The call coordinator task.
pub struct Coordinator<E: PeerEngine, T: SignalingTransport> {
    transport: Arc<T>,
    capture: Arc<dyn MediaCapture>,
    options: CoordinatorOptions,
    presence: PresenceTracker,
    router: SignalRouter<T>,
    candidates: CandidateBuffer,
    connections: ConnectionManager<E>,
    negotiation: Negotiation,
    last_phase: NegotiationPhase,
    local_stream: Option<MediaStream>,
    transport_state: TransportState,
    events_tx: broadcast::Sender<CallEvent>,
    engine_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl<E: PeerEngine, T: SignalingTransport> Coordinator<E, T> {
    /// Starts a coordinator on the current runtime.
    ///
    /// The coordinator owns the transport's lifecycle: it connects on start
    /// and disconnects on shutdown. Fails if the transport's event stream was
    /// already taken.
    pub fn spawn(
        engine: E,
        transport: Arc<T>,
        capture: Arc<dyn MediaCapture>,
        options: CoordinatorOptions,
    ) -> CallResult<CoordinatorHandle> {
        let transport_rx = transport.events().ok_or_else(|| {
            CallError::Transport(ProtocolError::ConnectionClosed(
                "transport event stream already taken".to_string(),
            ))
        })?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let connections = ConnectionManager::new(engine, options.ice.clone(), engine_tx);
        let handle = CoordinatorHandle {
            commands: command_tx,
            events: events_tx.clone(),
            cancel: connections.cancel_watch(),
        };

        let coordinator = Coordinator {
            router: SignalRouter::new(Arc::clone(&transport)),
            transport,
            capture,
            options,
            presence: PresenceTracker::new(),
            candidates: CandidateBuffer::new(),
            connections,
            negotiation: Negotiation::new(),
            last_phase: NegotiationPhase::Idle,
            local_stream: None,
            transport_state: TransportState::Disconnected,
            events_tx,
            engine_rx,
        };
        tokio::spawn(coordinator.run(command_rx, transport_rx));

        Ok(handle)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        info!("call coordinator started");
        self.transport_state = TransportState::Connecting;
        if let Err(e) = self.transport.connect().await {
            error!(error = %e, "failed to connect to signaling server");
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).await.is_break() {
                            info!("call coordinator stopped");
                            return;
                        }
                    }
                    None => break,
                },
                Some(event) = transport_rx.recv() => self.handle_transport_event(event).await,
                Some(event) = self.engine_rx.recv() => self.handle_engine_event(event).await,
            }
        }

        // Every handle is gone.
        self.teardown().await;
        info!("call coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::StartCamera { reply } => {
                let _ = reply.send(self.start_camera().await);
            }
            Command::StartCall { peer, reply } => {
                if let Some(peer) = peer {
                    self.presence.select(Some(peer));
                }
                let _ = reply.send(self.start_call().await);
            }
            Command::SelectPeer { peer, reply } => {
                match &peer {
                    Some(peer) => info!(peer = %peer, "remote peer selected"),
                    None => info!("remote peer selection cleared"),
                }
                self.presence.select(peer);
                let _ = reply.send(());
            }
            Command::Hangup { reply } => {
                self.close_connection().await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start_camera(&mut self) -> CallResult<MediaStream> {
        let stream = self
            .capture
            .acquire_local_media(self.options.constraints)
            .await
            .map_err(|e| {
                warn!(error = %e, "failed to acquire local media");
                CallError::from(e)
            })?;

        info!(stream = %stream.id, tracks = stream.tracks.len(), "local media ready");
        self.local_stream = Some(stream.clone());
        self.emit(CallEvent::LocalStream(stream.clone()));

        if let Err(e) = self.connections.attach_tracks(&stream.tracks).await {
            warn!(error = %e, "failed to attach local tracks to the live connection");
        }
        Ok(stream)
    }

    async fn start_call(&mut self) -> CallResult<()> {
        let peer = self
            .presence
            .selected()
            .cloned()
            .ok_or(CallError::NoRemoteSelected)?;
        if !self.presence.contains(&peer) {
            debug!(peer = %peer, "calling a peer that is not in the roster");
        }

        let tracks = self.local_tracks();
        let label = self.options.data_channel_label.clone();
        let connection = self.connections.ensure_connection(&tracks).await?;

        if !connection.has_data_channel() {
            match connection
                .until_closed(connection.handle().create_data_channel(label.clone()))
                .await
            {
                Some(Ok(())) => {
                    connection.has_data_channel = true;
                    debug!(label = %label, "data channel created");
                }
                Some(Err(e)) => warn!(label = %label, error = %e, "failed to create data channel"),
                None => return Err(CallError::Cancelled(NegotiationStep::CreateOffer)),
            }
        }

        let offer = match self.negotiation.create_offer(connection).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer = %peer, error = %e, "abandoning call attempt");
                return Err(e);
            }
        };

        self.router.send_offer(&peer, offer).await?;
        info!(peer = %peer, "offer sent");
        self.negotiation.offer_sent(peer);
        self.emit_phase();
        Ok(())
    }

    async fn close_connection(&mut self) {
        let dropped = self.candidates.clear();
        if dropped > 0 {
            info!(dropped, "discarded pending remote candidates");
        }
        if self.connections.close().await.is_some() {
            self.negotiation.close();
            self.emit(CallEvent::ConnectionState(ConnectionState::Closed));
            self.emit_phase();
        }
    }

    async fn teardown(&mut self) {
        self.close_connection().await;
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "failed to disconnect from signaling server");
        }
        self.transport_state = TransportState::Disconnected;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect => {
                info!("connected to signaling server");
                self.set_transport_state(TransportState::Connected);
            }
            TransportEvent::Connected(id) => {
                info!(id = %id, "signaling server assigned local id");
                self.presence.set_local_id(id.clone());
                self.emit(CallEvent::LocalId(id));
                self.emit(CallEvent::Roster(self.presence.visible_peers()));
            }
            TransportEvent::Signal(value) => self.handle_inbound(value).await,
            TransportEvent::Roster(peers) => {
                self.presence.replace_roster(peers);
                let visible = self.presence.visible_peers();
                debug!(peers = visible.len(), "roster updated");
                self.emit(CallEvent::Roster(visible));
            }
            TransportEvent::Disconnected => {
                warn!("signaling connection lost");
                self.set_transport_state(TransportState::Disconnected);
            }
        }
    }

    async fn handle_inbound(&mut self, value: Value) {
        let signal = match SignalRouter::<T>::classify(value) {
            Classified::Signal(signal) => signal,
            Classified::Unknown { kind } => {
                warn!(kind = %kind, "ignoring signal of unknown kind");
                return;
            }
            Classified::Malformed(e) => {
                warn!(error = %e, "ignoring malformed signal");
                return;
            }
        };

        if let (Some(to), Some(local)) = (&signal.to, self.presence.local_id()) {
            if to != local {
                warn!(to = %to, "ignoring signal addressed to another peer");
                return;
            }
        }

        debug!(peer = %signal.from, kind = %signal.kind(), "received signal");
        let tracks = self.local_tracks();
        if let Err(e) = self.connections.ensure_connection(&tracks).await {
            error!(error = %e, "cannot handle signal without a connection");
            return;
        }

        let from = signal.from;
        match signal.data {
            SignalPayload::Offer { offer } => self.on_remote_offer(from, offer).await,
            SignalPayload::Answer { answer } => self.on_remote_answer(from, answer).await,
            SignalPayload::Ice { candidate } => self.on_remote_candidate(from, candidate).await,
        }
        self.emit_phase();
    }

    async fn on_remote_offer(&mut self, from: PeerId, offer: SessionDescription) {
        self.emit(CallEvent::OfferReceived { from: from.clone() });
        if self.options.select_caller && self.presence.selected().is_none() {
            info!(peer = %from, "selecting caller");
            self.presence.select(Some(from.clone()));
        }
        let Some(connection) = self.connections.current_mut() else {
            return;
        };

        let answer = match self
            .negotiation
            .answer_offer(connection, &mut self.candidates, &from, offer)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(peer = %from, error = %e, "abandoning negotiation round");
                return;
            }
        };

        if let Err(e) = self.router.send_answer(&from, answer).await {
            error!(peer = %from, error = %e, "failed to send answer");
            return;
        }
        self.negotiation.answer_sent();
        info!(peer = %from, "answer sent");
    }

    async fn on_remote_answer(&mut self, from: PeerId, answer: SessionDescription) {
        let Some(connection) = self.connections.current_mut() else {
            return;
        };

        match self
            .negotiation
            .accept_answer(connection, &mut self.candidates, &from, answer)
            .await
        {
            Ok(Some(_)) => info!(peer = %from, "answer applied"),
            Ok(None) => {}
            Err(e) => warn!(peer = %from, error = %e, "abandoning negotiation round"),
        }
    }

    async fn on_remote_candidate(&mut self, from: PeerId, candidate: IceCandidateData) {
        let Some(connection) = self.connections.current() else {
            return;
        };

        let outcome = connection
            .until_closed(self.candidates.offer(
                connection.handle(),
                connection.remote_settled(),
                candidate,
            ))
            .await;
        match outcome {
            Some(CandidateOutcome::Applied) => debug!(peer = %from, "remote candidate applied"),
            Some(CandidateOutcome::Queued { pending }) => {
                debug!(peer = %from, pending, "remote candidate queued until a remote description is applied")
            }
            Some(CandidateOutcome::Rejected(e)) => {
                warn!(peer = %from, error = %e, "remote candidate rejected")
            }
            None => debug!(peer = %from, "connection closed while applying candidate"),
        }
    }

    async fn handle_engine_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent { epoch, event } = event;
        if !self.connections.is_current(epoch) {
            debug!(epoch, "dropping event from a closed connection");
            return;
        }

        match event {
            EngineEvent::RemoteTrack(track) => {
                info!(track = %track.id, kind = track.kind.as_str(), "remote track arrived");
                self.emit(CallEvent::RemoteTrack(track));
            }
            EngineEvent::LocalCandidate(candidate) => match self.presence.selected().cloned() {
                Some(peer) => {
                    if let Err(e) = self.router.send_candidate(&peer, candidate).await {
                        error!(peer = %peer, error = %e, "failed to send local candidate");
                    }
                }
                None => warn!(
                    candidate = %candidate.candidate,
                    "no remote peer selected, dropping local candidate"
                ),
            },
            EngineEvent::StateChanged(state) => {
                if let Some(connection) = self.connections.current_mut() {
                    connection.state = state;
                }
                info!(epoch, state = ?state, "connection state changed");
                self.negotiation.on_connection_state(state);
                self.emit(CallEvent::ConnectionState(state));
                self.emit_phase();
            }
            EngineEvent::DataChannelOpen { label } => {
                info!(label = %label, "data channel open");
                self.emit(CallEvent::DataChannelOpen { label });
            }
            EngineEvent::DataChannelMessage { label, data } => {
                debug!(label = %label, bytes = data.len(), "data channel message");
                self.emit(CallEvent::DataChannelMessage { label, data });
            }
        }
    }

    fn local_tracks(&self) -> Vec<MediaTrack> {
        self.local_stream
            .as_ref()
            .map(|stream| stream.tracks.clone())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            local_id: self.presence.local_id().cloned(),
            peers: self.presence.visible_peers(),
            selected: self.presence.selected().cloned(),
            phase: self.negotiation.phase(),
            round_peer: self.negotiation.peer().cloned(),
            connection: self.connections.current().map(|c| ConnectionSnapshot {
                epoch: c.epoch(),
                state: c.state(),
                local_description: c.local_description(),
                remote_description: c.remote_description(),
                local_tracks: c.local_tracks().iter().map(|t| t.id.clone()).collect(),
                has_data_channel: c.has_data_channel(),
            }),
            pending_candidates: self.candidates.len(),
            local_stream: self.local_stream.clone(),
            transport: self.transport_state,
        }
    }

    fn set_transport_state(&mut self, state: TransportState) {
        if self.transport_state != state {
            self.transport_state = state;
            self.emit(CallEvent::Transport(state));
        }
    }

    fn emit_phase(&mut self) {
        let phase = self.negotiation.phase();
        if phase != self.last_phase {
            debug!(from = %self.last_phase, to = %phase, "negotiation phase changed");
            self.last_phase = phase;
            self.emit(CallEvent::Phase(phase));
        }
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
