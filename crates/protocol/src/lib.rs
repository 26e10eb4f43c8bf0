//! # PeerCall Protocol Library
//!
//! This crate defines the signaling wire model for PeerCall: the messages two
//! endpoints exchange through a signaling server to negotiate a direct
//! peer-to-peer media session.
//!
//! ## Overview
//!
//! - **Signals**: `offer`, `answer` and `ice` messages, addressed to a peer
//! - **Transport frames**: the `{event, payload}` JSON frames carried over the
//!   signaling WebSocket (peer id assignment, roster broadcasts, signals)
//! - **Errors**: a single error type for encoding, decoding and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Signal {to/from, data: {type, ...}}   │  offer / answer / ice
//! ├─────────────────────────────────────────┤
//! │   Frame {event, payload}                │  connected / roster / signal
//! ├─────────────────────────────────────────┤
//! │   WebSocket text (JSON)                 │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientEvent, OutboundSignal, PeerId, SessionDescription, SignalPayload};
//!
//! let frame = ClientEvent::Signal(OutboundSignal {
//!     to: PeerId::from("B"),
//!     data: SignalPayload::Offer {
//!         offer: SessionDescription::offer("v=0\r\n"),
//!     },
//! });
//! let json = frame.to_json().unwrap();
//! assert!(json.contains("\"type\":\"offer\""));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Signal and frame definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientEvent, IceCandidateData, InboundSignal, OutboundSignal, PeerId, SdpType, ServerEvent,
    SessionDescription, SignalKind, SignalPayload,
};
