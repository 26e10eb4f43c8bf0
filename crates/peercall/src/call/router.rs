//! Inbound classification and outbound addressing of signals.

use std::sync::Arc;

use protocol::{
    ClientEvent, IceCandidateData, InboundSignal, OutboundSignal, PeerId, ProtocolError,
    SessionDescription, SignalPayload,
};
use serde_json::Value;
use tracing::debug;

use crate::error::CallResult;
use crate::network::SignalingTransport;

/// Outcome of classifying a raw inbound signal.
#[derive(Debug)]
pub enum Classified {
    /// A well-formed offer, answer or candidate.
    Signal(InboundSignal),
    /// A signal whose `data.type` is not one we handle.
    Unknown { kind: String },
    /// Anything else that fails validation.
    Malformed(ProtocolError),
}

/// Formats outgoing signals and hands them to the transport.
pub struct SignalRouter<T: SignalingTransport> {
    transport: Arc<T>,
}

impl<T: SignalingTransport> SignalRouter<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Validates a raw signal from the transport.
    pub fn classify(value: Value) -> Classified {
        match InboundSignal::from_value(value) {
            Ok(signal) => Classified::Signal(signal),
            Err(ProtocolError::UnknownSignalKind { kind }) => Classified::Unknown { kind },
            Err(e) => Classified::Malformed(e),
        }
    }

    pub async fn send_offer(&self, to: &PeerId, offer: SessionDescription) -> CallResult<()> {
        self.send(to, SignalPayload::Offer { offer }).await
    }

    pub async fn send_answer(&self, to: &PeerId, answer: SessionDescription) -> CallResult<()> {
        self.send(to, SignalPayload::Answer { answer }).await
    }

    pub async fn send_candidate(
        &self,
        to: &PeerId,
        candidate: IceCandidateData,
    ) -> CallResult<()> {
        self.send(to, SignalPayload::Ice { candidate }).await
    }

    async fn send(&self, to: &PeerId, data: SignalPayload) -> CallResult<()> {
        debug!(peer = %to, kind = %data.kind(), "sending signal");
        self.transport
            .emit(ClientEvent::Signal(OutboundSignal {
                to: to.clone(),
                data,
            }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryTransport;
    use serde_json::json;

    #[test]
    fn test_classify_known_kinds() {
        let offer = json!({
            "from": "A",
            "data": {"type": "offer", "offer": {"type": "offer", "sdp": "v=0"}}
        });
        let ice = json!({
            "from": "A",
            "data": {"type": "ice", "candidate": {"candidate": "candidate:1", "sdpMid": "0"}}
        });

        assert!(matches!(
            SignalRouter::<MemoryTransport>::classify(offer),
            Classified::Signal(_)
        ));
        match SignalRouter::<MemoryTransport>::classify(ice) {
            Classified::Signal(signal) => assert_eq!(signal.from, PeerId::from("A")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_unknown_kind() {
        let value = json!({"from": "A", "data": {"type": "bye"}});
        match SignalRouter::<MemoryTransport>::classify(value) {
            Classified::Unknown { kind } => assert_eq!(kind, "bye"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_malformed() {
        let missing_payload = json!({"from": "A", "data": {"type": "answer"}});
        let missing_sender = json!({"data": {"type": "ice", "candidate": {"candidate": "c"}}});

        assert!(matches!(
            SignalRouter::<MemoryTransport>::classify(missing_payload),
            Classified::Malformed(_)
        ));
        assert!(matches!(
            SignalRouter::<MemoryTransport>::classify(missing_sender),
            Classified::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn test_outbound_envelopes() {
        let transport = Arc::new(MemoryTransport::detached("A"));
        let router = SignalRouter::new(Arc::clone(&transport));
        let peer = PeerId::from("B");

        router
            .send_offer(&peer, SessionDescription::offer("v=0"))
            .await
            .unwrap();
        router
            .send_candidate(&peer, IceCandidateData::new("candidate:1"))
            .await
            .unwrap();

        let frames = transport.emitted().await;
        assert_eq!(frames.len(), 2);
        let json: Value = serde_json::from_str(&frames[0].to_json().unwrap()).unwrap();
        assert_eq!(json["payload"]["to"], "B");
        assert_eq!(json["payload"]["data"]["type"], "offer");
        assert_eq!(json["payload"]["data"]["offer"]["sdp"], "v=0");

        let ClientEvent::Signal(second) = &frames[1];
        assert_eq!(
            second.data,
            SignalPayload::Ice {
                candidate: IceCandidateData::new("candidate:1")
            }
        );
    }
}
