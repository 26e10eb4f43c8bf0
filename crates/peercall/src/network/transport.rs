//! Signaling transport seam.
//!
//! A transport relays signals between this endpoint and the signaling server.
//! It owns its own reconnection policy; the coordinator only reacts to the
//! events it reports.

use protocol::{ClientEvent, PeerId, Result};
use serde_json::Value;
use tokio::sync::mpsc;

use super::BoxFuture;

/// Connection state of the signaling transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not connected to the signaling server.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Reconnecting after a disconnect.
    Reconnecting,
}

/// Events reported by a signaling transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket opened; no peer id has been assigned yet.
    Connect,
    /// The server assigned this endpoint its peer id.
    Connected(PeerId),
    /// A raw signal relayed from another peer, not yet validated.
    Signal(Value),
    /// The full roster of connected peers.
    Roster(Vec<PeerId>),
    /// The socket closed. The transport may reconnect on its own.
    Disconnected,
}

/// Trait for signaling transports.
///
/// Abstracts the signaling channel so the coordinator can run over a
/// WebSocket in production and over an in-memory hub in tests.
pub trait SignalingTransport: Send + Sync + 'static {
    /// Starts connecting to the signaling server.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Disconnects and stops any reconnection.
    fn disconnect(&self) -> BoxFuture<'_, Result<()>>;

    /// Sends a frame to the server.
    fn emit(&self, event: ClientEvent) -> BoxFuture<'_, Result<()>>;

    /// Returns the current connection state.
    fn state(&self) -> TransportState;

    /// Returns the receiver for transport events.
    /// Returns None if the receiver has already been taken.
    fn events(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}
