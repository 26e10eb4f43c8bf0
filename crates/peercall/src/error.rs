//! Error types for the call coordinator.

use protocol::ProtocolError;
use thiserror::Error;

use crate::media::MediaError;

/// Result type for coordinator operations.
pub type CallResult<T> = Result<T, CallError>;

/// Negotiation step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

impl std::fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationStep::CreateOffer => "create offer",
            NegotiationStep::CreateAnswer => "create answer",
            NegotiationStep::SetLocalDescription => "set local description",
            NegotiationStep::SetRemoteDescription => "set remote description",
            NegotiationStep::AddIceCandidate => "add ICE candidate",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while coordinating a call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The peer-connection engine failed outside a negotiation step.
    #[error("engine error: {0}")]
    Engine(String),

    /// The engine rejected a description or candidate.
    #[error("{step} failed: {reason}")]
    Negotiation {
        step: NegotiationStep,
        reason: String,
    },

    /// Local media could not be acquired.
    #[error("media error: {0}")]
    Media(#[from] MediaError),

    /// The signaling transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),

    /// A call was requested with no remote peer chosen.
    #[error("no remote peer selected")]
    NoRemoteSelected,

    /// An operation needed a connection and none exists.
    #[error("no active peer connection")]
    NoConnection,

    /// The step was abandoned because the connection was hung up.
    #[error("cancelled: connection closed while {0} was in flight")]
    Cancelled(NegotiationStep),

    /// The coordinator task is no longer running.
    #[error("coordinator stopped")]
    Stopped,
}

impl CallError {
    pub(crate) fn negotiation(step: NegotiationStep, reason: impl std::fmt::Display) -> Self {
        CallError::Negotiation {
            step,
            reason: reason.to_string(),
        }
    }
}
