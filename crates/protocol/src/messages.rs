//! Signaling message definitions for PeerCall.
//!
//! Two layers live here:
//! - the signal itself (`offer`, `answer`, `ice`), addressed `to` a peer and,
//!   when relayed back by the server, stamped with `from`;
//! - the transport frame that carries signals, roster updates and the
//!   server-assigned peer id over a WebSocket as JSON text.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Opaque peer identifier assigned by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty identifier, which never names a peer.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Session descriptions and candidates
// ============================================================================

/// Type of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    /// Offers and answers are settled: once one is applied as the remote
    /// description, remote candidates may be added.
    pub fn is_settled(self) -> bool {
        matches!(self, SdpType::Offer | SdpType::Answer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        }
    }
}

/// Session description produced by the peer-connection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate, using the browser `RTCIceCandidateInit` field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateData {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateData {
    /// Creates a candidate for the first media section.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Kind of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    /// Returns the wire name used in the `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
        }
    }

    /// Parses a wire name. Returns `None` for kinds this protocol does not define.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice" => Some(SignalKind::Ice),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `data` part of a signal: a closed union over the three signal kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
    Ice { candidate: IceCandidateData },
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::Ice { .. } => SignalKind::Ice,
        }
    }
}

/// Signal sent by this endpoint, addressed to a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundSignal {
    pub to: PeerId,
    pub data: SignalPayload,
}

/// Signal relayed by the server from another peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSignal {
    pub from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,
    pub data: SignalPayload,
}

impl InboundSignal {
    pub fn kind(&self) -> SignalKind {
        self.data.kind()
    }

    /// Validates a raw inbound signal.
    ///
    /// An unrecognised `data.type` yields [`ProtocolError::UnknownSignalKind`];
    /// any other shape problem (missing sender, missing payload field, wrong
    /// types) yields [`ProtocolError::MalformedSignal`].
    pub fn from_value(value: Value) -> Result<Self> {
        let kind = value
            .get("data")
            .and_then(|data| data.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedSignal("missing data.type".to_string()))?;

        if SignalKind::from_wire(kind).is_none() {
            return Err(ProtocolError::UnknownSignalKind {
                kind: kind.to_string(),
            });
        }

        let signal: InboundSignal = serde_json::from_value(value)
            .map_err(|e| ProtocolError::MalformedSignal(e.to_string()))?;

        if signal.from.is_empty() {
            return Err(ProtocolError::MalformedSignal("empty sender id".to_string()));
        }

        let mismatched = match &signal.data {
            SignalPayload::Offer { offer } => Some(offer.sdp_type).filter(|t| *t != SdpType::Offer),
            SignalPayload::Answer { answer } => Some(answer.sdp_type)
                .filter(|t| !matches!(t, SdpType::Answer | SdpType::Pranswer)),
            SignalPayload::Ice { .. } => None,
        };
        if let Some(sdp_type) = mismatched {
            return Err(ProtocolError::MalformedSignal(format!(
                "{} signal carries a description of type {}",
                signal.kind().as_str(),
                sdp_type.as_str()
            )));
        }

        Ok(signal)
    }
}

// ============================================================================
// Transport frames
// ============================================================================

/// Frames sent by the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum ServerEvent {
    /// The server assigned this connection its peer id.
    Connected(PeerId),
    /// A signal relayed from another peer. Left raw so that unknown kinds can
    /// be diagnosed instead of failing the whole frame.
    Signal(Value),
    /// Full list of connected peers, including this endpoint.
    #[serde(alias = "users")]
    Roster(Vec<PeerId>),
}

/// Frames sent to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "lowercase")]
pub enum ClientEvent {
    Signal(OutboundSignal),
}

impl ClientEvent {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEvent {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_offer_wire_shape() {
        let signal = OutboundSignal {
            to: PeerId::from("B"),
            data: SignalPayload::Offer {
                offer: SessionDescription::offer("v=0\r\n"),
            },
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(
            value,
            json!({
                "to": "B",
                "data": {"type": "offer", "offer": {"type": "offer", "sdp": "v=0\r\n"}}
            })
        );
    }

    #[test]
    fn test_outbound_ice_wire_shape() {
        let signal = OutboundSignal {
            to: PeerId::from("A"),
            data: SignalPayload::Ice {
                candidate: IceCandidateData::new("candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host"),
            },
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["data"]["type"], "ice");
        assert_eq!(value["data"]["candidate"]["sdpMid"], "0");
        assert_eq!(value["data"]["candidate"]["sdpMLineIndex"], 0);
        assert!(value["data"]["candidate"].get("usernameFragment").is_none());
    }

    #[test]
    fn test_inbound_answer_from_value() {
        let value = json!({
            "from": "B",
            "data": {"type": "answer", "answer": {"type": "answer", "sdp": "v=0"}}
        });
        let signal = InboundSignal::from_value(value).unwrap();
        assert_eq!(signal.from, PeerId::from("B"));
        assert_eq!(signal.kind(), SignalKind::Answer);
        assert_eq!(signal.to, None);
    }

    #[test]
    fn test_inbound_candidate_without_optional_fields() {
        let value = json!({
            "from": "A",
            "to": "B",
            "data": {"type": "ice", "candidate": {"candidate": "candidate:2"}}
        });
        let signal = InboundSignal::from_value(value).unwrap();
        match signal.data {
            SignalPayload::Ice { candidate } => {
                assert_eq!(candidate.candidate, "candidate:2");
                assert_eq!(candidate.sdp_mid, None);
                assert_eq!(candidate.sdp_mline_index, None);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_inbound_unknown_kind() {
        let value = json!({"from": "A", "data": {"type": "bye"}});
        let err = InboundSignal::from_value(value).unwrap_err();
        match err {
            ProtocolError::UnknownSignalKind { kind } => assert_eq!(kind, "bye"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_inbound_missing_payload_is_malformed() {
        let value = json!({"from": "A", "data": {"type": "offer"}});
        let err = InboundSignal::from_value(value).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedSignal(_)));
    }

    #[test]
    fn test_inbound_missing_sender_is_malformed() {
        let value = json!({"data": {"type": "ice", "candidate": {"candidate": "c"}}});
        assert!(matches!(
            InboundSignal::from_value(value),
            Err(ProtocolError::MalformedSignal(_))
        ));

        let value = json!({"from": "", "data": {"type": "ice", "candidate": {"candidate": "c"}}});
        assert!(matches!(
            InboundSignal::from_value(value),
            Err(ProtocolError::MalformedSignal(_))
        ));
    }

    #[test]
    fn test_inbound_description_type_must_match_kind() {
        let offer_with_answer = json!({
            "from": "A",
            "data": {"type": "offer", "offer": {"type": "answer", "sdp": "v=0"}}
        });
        let answer_with_rollback = json!({
            "from": "B",
            "data": {"type": "answer", "answer": {"type": "rollback", "sdp": ""}}
        });
        let provisional_answer = json!({
            "from": "B",
            "data": {"type": "answer", "answer": {"type": "pranswer", "sdp": "v=0"}}
        });

        match InboundSignal::from_value(offer_with_answer) {
            Err(ProtocolError::MalformedSignal(msg)) => {
                assert!(msg.contains("offer signal carries a description of type answer"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            InboundSignal::from_value(answer_with_rollback),
            Err(ProtocolError::MalformedSignal(_))
        ));
        assert!(InboundSignal::from_value(provisional_answer).is_ok());
    }

    #[test]
    fn test_inbound_missing_type_is_malformed() {
        let value = json!({"from": "A", "data": {"offer": {}}});
        assert!(matches!(
            InboundSignal::from_value(value),
            Err(ProtocolError::MalformedSignal(_))
        ));
    }

    #[test]
    fn test_server_event_deserialization() {
        let event = ServerEvent::from_json(r#"{"event":"connected","payload":"abc"}"#).unwrap();
        assert_eq!(event, ServerEvent::Connected(PeerId::from("abc")));

        let event = ServerEvent::from_json(r#"{"event":"roster","payload":["a","b"]}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::Roster(vec![PeerId::from("a"), PeerId::from("b")])
        );

        // The server names the roster broadcast `users`.
        let event = ServerEvent::from_json(r#"{"event":"users","payload":["c"]}"#).unwrap();
        assert_eq!(event, ServerEvent::Roster(vec![PeerId::from("c")]));

        let event = ServerEvent::from_json(
            r#"{"event":"signal","payload":{"from":"a","data":{"type":"ice","candidate":{"candidate":"x"}}}}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerEvent::Signal(_)));
    }

    #[test]
    fn test_client_event_serialization() {
        let event = ClientEvent::Signal(OutboundSignal {
            to: PeerId::from("B"),
            data: SignalPayload::Answer {
                answer: SessionDescription::answer("v=0"),
            },
        });
        let json = event.to_json().unwrap();
        assert!(json.contains("\"event\":\"signal\""));
        assert!(json.contains("\"payload\":{\"to\":\"B\""));
        assert!(json.contains("\"type\":\"answer\""));
    }

    #[test]
    fn test_sdp_type_settled() {
        assert!(SdpType::Offer.is_settled());
        assert!(SdpType::Answer.is_settled());
        assert!(!SdpType::Pranswer.is_settled());
        assert!(!SdpType::Rollback.is_settled());
    }

    #[test]
    fn test_signal_kind_wire_names() {
        for kind in [SignalKind::Offer, SignalKind::Answer, SignalKind::Ice] {
            assert_eq!(SignalKind::from_wire(kind.as_str()), Some(kind));
        }
        assert_eq!(SignalKind::from_wire("candidate"), None);
    }
}
