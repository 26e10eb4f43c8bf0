//! In-process collaborators.
//!
//! [`MemoryEngine`] behaves like a strict peer-connection engine without any
//! networking: it tracks the signaling state of each connection, rejects
//! descriptions that do not fit it (glare, answers without an offer,
//! malformed SDP), refuses candidates before a remote description exists,
//! and records every call it receives. [`MemoryHub`] relays signals between
//! [`MemoryTransport`]s the way a signaling server would.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use protocol::{
    ClientEvent, IceCandidateData, PeerId, ProtocolError, Result, SdpType, SessionDescription,
};
use tokio::sync::{mpsc, Mutex};

use super::engine::{
    ConnectionState, EngineConnection, EngineError, EngineEvent, EngineEventSink, IceConfig,
    PeerEngine,
};
use super::transport::{SignalingTransport, TransportEvent, TransportState};
use super::BoxFuture;
use crate::media::MediaTrack;

// ============================================================================
// Engine
// ============================================================================

/// A call received by the memory engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateConnection { epoch: u64 },
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SdpType),
    SetRemoteDescription(SdpType),
    AddIceCandidate(String),
    AddTrack(String),
    CreateDataChannel(String),
    Close { epoch: u64 },
}

#[derive(Default)]
struct EngineShared {
    calls: Vec<EngineCall>,
    sinks: Vec<EngineEventSink>,
    failing_candidates: HashSet<String>,
    open_connections: usize,
    stall_answers: bool,
    no_gathering: bool,
}

/// Scripted peer-connection engine.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<Mutex<EngineShared>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `add_ice_candidate` fail for this candidate string.
    pub async fn fail_candidate(&self, candidate: impl Into<String>) {
        self.shared
            .lock()
            .await
            .failing_candidates
            .insert(candidate.into());
    }

    /// Makes `create_answer` never complete, like an engine that has hung.
    pub async fn stall_answers(&self) {
        self.shared.lock().await.stall_answers = true;
    }

    /// Stops the engine from gathering a local candidate when a local
    /// description is applied.
    pub async fn disable_gathering(&self) {
        self.shared.lock().await.no_gathering = true;
    }

    /// Every call received so far, in order.
    pub async fn calls(&self) -> Vec<EngineCall> {
        self.shared.lock().await.calls.clone()
    }

    /// Candidate strings passed to `add_ice_candidate`, in order.
    pub async fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::AddIceCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Connections created and not yet closed.
    pub async fn open_connections(&self) -> usize {
        self.shared.lock().await.open_connections
    }

    /// The observer sinks handed to each created connection, oldest first.
    /// Emitting on an old sink replays a late callback from that connection.
    pub async fn sinks(&self) -> Vec<EngineEventSink> {
        self.shared.lock().await.sinks.clone()
    }
}

impl PeerEngine for MemoryEngine {
    type Connection = MemoryConnection;

    fn create_connection(
        &self,
        _ice: IceConfig,
        sink: EngineEventSink,
    ) -> BoxFuture<'_, std::result::Result<MemoryConnection, EngineError>> {
        Box::pin(async move {
            let mut shared = self.shared.lock().await;
            shared.calls.push(EngineCall::CreateConnection {
                epoch: sink.epoch(),
            });
            shared.sinks.push(sink.clone());
            shared.open_connections += 1;

            Ok(MemoryConnection {
                shared: Arc::clone(&self.shared),
                next_session: Arc::clone(&self.next_session),
                sink,
                state: Mutex::new(NegotiationState::default()),
                closed: AtomicBool::new(false),
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Default)]
struct NegotiationState {
    signaling: SignalingState,
    has_remote: bool,
    negotiated: bool,
    connected: bool,
}

/// Connection created by [`MemoryEngine`].
pub struct MemoryConnection {
    shared: Arc<Mutex<EngineShared>>,
    next_session: Arc<AtomicU64>,
    sink: EngineEventSink,
    state: Mutex<NegotiationState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    async fn record(&self, call: EngineCall) {
        self.shared.lock().await.calls.push(call);
    }

    fn check_open(&self) -> std::result::Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::new("connection closed"))
        } else {
            Ok(())
        }
    }

    fn check_sdp(desc: &SessionDescription) -> std::result::Result<(), EngineError> {
        if desc.sdp.starts_with("v=0") {
            Ok(())
        } else {
            Err(EngineError::new("malformed SDP: missing version line"))
        }
    }

    fn generate_sdp(&self) -> String {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n",
            session
        )
    }

    async fn gather(&self) {
        if self.shared.lock().await.no_gathering {
            return;
        }
        let port = 50000 + self.sink.epoch();
        self.sink.emit(EngineEvent::LocalCandidate(IceCandidateData::new(format!(
            "candidate:1 1 udp 2122260223 127.0.0.1 {} typ host",
            port
        ))));
    }

    fn mark_negotiated(&self, state: &mut NegotiationState) {
        state.signaling = SignalingState::Stable;
        if !state.negotiated {
            state.negotiated = true;
            self.sink
                .emit(EngineEvent::StateChanged(ConnectionState::Connecting));
        }
    }
}

impl EngineConnection for MemoryConnection {
    fn create_offer(&self) -> BoxFuture<'_, std::result::Result<SessionDescription, EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::CreateOffer).await;
            self.check_open()?;
            let state = self.state.lock().await;
            if state.signaling == SignalingState::HaveRemoteOffer {
                return Err(EngineError::new(
                    "cannot create offer in have-remote-offer state",
                ));
            }
            Ok(SessionDescription::offer(self.generate_sdp()))
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, std::result::Result<SessionDescription, EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::CreateAnswer).await;
            self.check_open()?;
            if self.shared.lock().await.stall_answers {
                std::future::pending::<()>().await;
            }
            let state = self.state.lock().await;
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(EngineError::new("cannot create answer without a remote offer"));
            }
            Ok(SessionDescription::answer(self.generate_sdp()))
        })
    }

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, std::result::Result<(), EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::SetLocalDescription(desc.sdp_type))
                .await;
            self.check_open()?;
            Self::check_sdp(&desc)?;
            {
                let mut state = self.state.lock().await;
                match (desc.sdp_type, state.signaling) {
                    (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                        state.signaling = SignalingState::HaveLocalOffer;
                    }
                    (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                        self.mark_negotiated(&mut state);
                    }
                    (sdp_type, signaling) => {
                        return Err(EngineError::new(format!(
                            "cannot set local {} in {:?} state",
                            sdp_type.as_str(),
                            signaling
                        )));
                    }
                }
            }
            self.gather().await;
            Ok(())
        })
    }

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, std::result::Result<(), EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::SetRemoteDescription(desc.sdp_type))
                .await;
            self.check_open()?;
            Self::check_sdp(&desc)?;
            let mut state = self.state.lock().await;
            match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    return Err(EngineError::new(
                        "glare: remote offer while a local offer is pending",
                    ));
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    self.mark_negotiated(&mut state);
                }
                (sdp_type, signaling) => {
                    return Err(EngineError::new(format!(
                        "cannot set remote {} in {:?} state",
                        sdp_type.as_str(),
                        signaling
                    )));
                }
            }
            state.has_remote = true;
            Ok(())
        })
    }

    fn add_ice_candidate(
        &self,
        candidate: IceCandidateData,
    ) -> BoxFuture<'_, std::result::Result<(), EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::AddIceCandidate(candidate.candidate.clone()))
                .await;
            self.check_open()?;
            if self
                .shared
                .lock()
                .await
                .failing_candidates
                .contains(&candidate.candidate)
            {
                return Err(EngineError::new("candidate unreachable"));
            }
            let mut state = self.state.lock().await;
            if !state.has_remote {
                return Err(EngineError::new(
                    "remote description must be set before adding candidates",
                ));
            }
            if state.negotiated && !state.connected {
                state.connected = true;
                self.sink
                    .emit(EngineEvent::StateChanged(ConnectionState::Connected));
            }
            Ok(())
        })
    }

    fn add_track(&self, track: MediaTrack) -> BoxFuture<'_, std::result::Result<(), EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::AddTrack(track.id)).await;
            self.check_open()
        })
    }

    fn create_data_channel(
        &self,
        label: String,
    ) -> BoxFuture<'_, std::result::Result<(), EngineError>> {
        Box::pin(async move {
            self.record(EngineCall::CreateDataChannel(label)).await;
            self.check_open()
        })
    }

    fn close(&self) -> BoxFuture<'_, std::result::Result<(), EngineError>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let mut shared = self.shared.lock().await;
            shared.calls.push(EngineCall::Close {
                epoch: self.sink.epoch(),
            });
            shared.open_connections = shared.open_connections.saturating_sub(1);
            Ok(())
        })
    }
}

// ============================================================================
// Transport
// ============================================================================

/// In-process signaling server relaying between [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<Mutex<BTreeMap<PeerId, mpsc::Sender<TransportEvent>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that will register as `id` when connected.
    pub fn transport(&self, id: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport::build(id.into(), Some(self.clone()))
    }

    async fn join(&self, id: PeerId, tx: mpsc::Sender<TransportEvent>) {
        self.peers.lock().await.insert(id, tx);
        self.broadcast_roster().await;
    }

    async fn leave(&self, id: &PeerId) {
        self.peers.lock().await.remove(id);
        self.broadcast_roster().await;
    }

    async fn broadcast_roster(&self) {
        let peers = self.peers.lock().await;
        let roster: Vec<PeerId> = peers.keys().cloned().collect();
        for tx in peers.values() {
            let _ = tx.send(TransportEvent::Roster(roster.clone())).await;
        }
    }

    async fn relay(&self, from: &PeerId, event: ClientEvent) {
        let ClientEvent::Signal(signal) = event;
        let target = self.peers.lock().await.get(&signal.to).cloned();
        match target {
            Some(tx) => {
                let value = serde_json::json!({
                    "from": from,
                    "to": signal.to,
                    "data": signal.data,
                });
                let _ = tx.send(TransportEvent::Signal(value)).await;
            }
            None => {
                tracing::debug!(to = %signal.to, "memory hub: no such peer, dropping signal");
            }
        }
    }
}

/// Transport backed by a [`MemoryHub`], or detached and only recording.
pub struct MemoryTransport {
    id: PeerId,
    hub: Option<MemoryHub>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    emitted: Arc<Mutex<Vec<ClientEvent>>>,
    connected: AtomicBool,
}

impl MemoryTransport {
    /// A transport not attached to any hub. Emitted frames are only recorded.
    pub fn detached(id: impl Into<PeerId>) -> Self {
        Self::build(id.into(), None)
    }

    fn build(id: PeerId, hub: Option<MemoryHub>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            id,
            hub,
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            emitted: Arc::new(Mutex::new(Vec::new())),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Every frame passed to `emit`, in order.
    pub async fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().await.clone()
    }

    /// Delivers an event as if the server had sent it.
    pub async fn inject(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

impl SignalingTransport for MemoryTransport {
    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.connected.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let _ = self.event_tx.send(TransportEvent::Connect).await;
            let _ = self
                .event_tx
                .send(TransportEvent::Connected(self.id.clone()))
                .await;
            if let Some(hub) = &self.hub {
                hub.join(self.id.clone(), self.event_tx.clone()).await;
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.connected.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(hub) = &self.hub {
                hub.leave(&self.id).await;
            }
            let _ = self.event_tx.send(TransportEvent::Disconnected).await;
            Ok(())
        })
    }

    fn emit(&self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.emitted.lock().await.push(event.clone());
            if !self.connected.load(Ordering::SeqCst) && self.hub.is_some() {
                return Err(ProtocolError::ConnectionClosed(
                    "not connected to signaling server".to_string(),
                ));
            }
            if let Some(hub) = &self.hub {
                hub.relay(&self.id, event).await;
            }
            Ok(())
        })
    }

    fn state(&self) -> TransportState {
        if self.connected.load(Ordering::SeqCst) {
            TransportState::Connected
        } else {
            TransportState::Disconnected
        }
    }

    fn events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        match self.event_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}
