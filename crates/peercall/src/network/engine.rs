//! Peer-connection engine seam.
//!
//! The engine owns everything below signaling: SDP generation, codec
//! negotiation, ICE transport. The coordinator drives it through
//! [`EngineConnection`] and hears back through a single ordered stream of
//! [`ConnectionEvent`]s. Each connection is handed an [`EngineEventSink`]
//! stamped with the connection's epoch, so events fired by a connection that
//! has since been closed can be recognised and dropped.

use protocol::{IceCandidateData, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use super::BoxFuture;
use crate::media::{MediaTrack, RemoteTrack};

/// Default STUN servers for ICE connectivity.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Error reported by the engine for any operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    /// STUN/TURN server URLs.
    pub urls: Vec<String>,
    /// Username for TURN authentication (optional for STUN).
    pub username: Option<String>,
    /// Credential for TURN authentication (optional for STUN).
    pub credential: Option<String>,
}

impl IceServer {
    /// Creates a new STUN server configuration.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Creates a new TURN server configuration with authentication.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// ICE configuration passed to the engine when a connection is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|&url| IceServer::stun(url))
                .collect(),
        }
    }
}

/// Observer callbacks of a connection, as events.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The remote peer added a track.
    RemoteTrack(RemoteTrack),
    /// A local candidate was gathered and should be sent to the remote peer.
    LocalCandidate(IceCandidateData),
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// A data channel finished opening.
    DataChannelOpen { label: String },
    /// A data channel delivered a message.
    DataChannelMessage { label: String, data: Vec<u8> },
}

/// An engine event tagged with the epoch of the connection that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub epoch: u64,
    pub event: EngineEvent,
}

/// Where an engine connection reports its observer events.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EngineEventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queues an event for the coordinator. Never blocks.
    pub fn emit(&self, event: EngineEvent) {
        if self
            .tx
            .send(ConnectionEvent {
                epoch: self.epoch,
                event,
            })
            .is_err()
        {
            tracing::debug!(epoch = self.epoch, "coordinator gone, dropping engine event");
        }
    }
}

/// Factory for peer connections.
pub trait PeerEngine: Send + Sync + 'static {
    type Connection: EngineConnection;

    /// Creates a connection whose observers report to `sink`.
    fn create_connection(
        &self,
        ice: IceConfig,
        sink: EngineEventSink,
    ) -> BoxFuture<'_, Result<Self::Connection, EngineError>>;
}

/// A single peer connection owned by the engine.
pub trait EngineConnection: Send + Sync + 'static {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, EngineError>>;

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, EngineError>>;

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), EngineError>>;

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), EngineError>>;

    fn add_ice_candidate(
        &self,
        candidate: IceCandidateData,
    ) -> BoxFuture<'_, Result<(), EngineError>>;

    fn add_track(&self, track: MediaTrack) -> BoxFuture<'_, Result<(), EngineError>>;

    /// Creates a data channel. Its open/message callbacks go to the sink.
    fn create_data_channel(&self, label: String) -> BoxFuture<'_, Result<(), EngineError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), EngineError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_config_default() {
        let config = IceConfig::default();
        assert_eq!(config.ice_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert!(config.ice_servers.iter().all(|s| s.username.is_none()));
    }

    #[test]
    fn test_ice_server_turn() {
        let server = IceServer::turn("turn:example.com:3478", "user", "pass");
        assert_eq!(server.urls, vec!["turn:example.com:3478"]);
        assert_eq!(server.username, Some("user".to_string()));
        assert_eq!(server.credential, Some("pass".to_string()));
    }

    #[test]
    fn test_sink_stamps_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EngineEventSink::new(7, tx);
        sink.emit(EngineEvent::StateChanged(ConnectionState::Connecting));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.epoch, 7);
        assert_eq!(
            event.event,
            EngineEvent::StateChanged(ConnectionState::Connecting)
        );
    }

    #[test]
    fn test_sink_emit_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EngineEventSink::new(1, tx);
        drop(rx);
        // Must not panic.
        sink.emit(EngineEvent::StateChanged(ConnectionState::Closed));
    }
}
