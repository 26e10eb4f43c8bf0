//! Network collaborators of the call coordinator.
//!
//! This module provides the two seams the coordinator drives:
//! - the signaling transport (WebSocket in production, in-memory hub in tests)
//! - the peer-connection engine (webrtc-rs in production, scripted in tests)

pub mod engine;
pub mod memory;
pub mod transport;
pub mod webrtc;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export key types
pub use engine::{
    ConnectionEvent, ConnectionState, EngineConnection, EngineError, EngineEvent, EngineEventSink,
    IceConfig, IceServer, PeerEngine, DEFAULT_STUN_SERVERS,
};
pub use memory::{EngineCall, MemoryConnection, MemoryEngine, MemoryHub, MemoryTransport};
pub use transport::{SignalingTransport, TransportEvent, TransportState};
pub use self::webrtc::{WebRtcConnection, WebRtcEngine};
pub use websocket::{WebSocketConfig, WebSocketTransport};
