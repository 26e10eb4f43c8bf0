//! # PeerCall Library
//!
//! This crate coordinates peer-to-peer calls: it brings up a single peer
//! connection, exchanges session descriptions and ICE candidates through a
//! signaling server, and tracks which peers are online.
//!
//! ## Overview
//!
//! - **Presence**: local id assignment, roster broadcasts, peer selection
//! - **Negotiation**: offer/answer rounds with ordered remote description application
//! - **Candidate buffering**: remote candidates held until the remote description lands
//! - **Connection lifecycle**: lazy creation, epoch-stamped observers, teardown
//! - **Collaborators**: WebSocket signaling and a webrtc-rs engine, with
//!   in-memory stand-ins for tests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Call Coordinator                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Presence   │  │  Negotiation │  │   Candidate Buffer   │  │
//! │  │   Tracker    │  │    Round     │  │                      │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │          Signal Router  /  Connection Manager              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌───────────────────┐  ┌───────────────────────────────────┐  │
//! │  │ WebSocket Signals │  │        WebRTC Engine              │  │
//! │  └───────────────────┘  └───────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use peercall::{Config, Coordinator, SyntheticCapture, WebRtcEngine, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let handle = Coordinator::spawn(
//!         WebRtcEngine::new()?,
//!         Arc::new(WebSocketTransport::new(config.websocket())),
//!         Arc::new(SyntheticCapture::new()),
//!         config.coordinator_options(),
//!     )?;
//!
//!     handle.start_call("peer-b").await?;
//!     handle.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`call`]: The coordinator and its parts
//! - [`network`]: Signaling transports and peer-connection engines
//! - [`media`]: Local media capture
//! - [`error`]: Error types

pub mod call;
pub mod config;
pub mod error;
pub mod media;
pub mod network;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use error::{CallError, CallResult, NegotiationStep};

pub use call::{
    CallEvent, CallSnapshot, ConnectionSnapshot, Coordinator, CoordinatorHandle,
    CoordinatorOptions, NegotiationPhase,
};

pub use media::{
    MediaCapture, MediaConstraints, MediaError, MediaStream, MediaTrack, RemoteTrack,
    SyntheticCapture, TrackKind,
};

pub use network::{
    ConnectionState, IceConfig, IceServer, MemoryEngine, MemoryHub, MemoryTransport, PeerEngine,
    SignalingTransport, TransportState, WebRtcEngine, WebSocketConfig, WebSocketTransport,
};
