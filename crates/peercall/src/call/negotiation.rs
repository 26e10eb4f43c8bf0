//! Offer/answer exchange.
//!
//! The role is decided per round by whichever comes first: a local call
//! (initiator) or a remote offer (responder). Applying a remote description
//! is always followed by draining the candidate buffer within the same step.

use protocol::{PeerId, SdpType, SessionDescription};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::candidates::{CandidateBuffer, DrainReport};
use super::lifecycle::PeerConnection;
use crate::error::{CallError, CallResult, NegotiationStep};
use crate::network::{ConnectionState, EngineConnection};

/// Where the current negotiation round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    Idle,
    LocalOfferSent,
    RemoteOfferApplied,
    DescriptionsExchanged,
    Connected,
    Failed,
    Closed,
}

impl NegotiationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationPhase::Idle => "idle",
            NegotiationPhase::LocalOfferSent => "local-offer-sent",
            NegotiationPhase::RemoteOfferApplied => "remote-offer-applied",
            NegotiationPhase::DescriptionsExchanged => "descriptions-exchanged",
            NegotiationPhase::Connected => "connected",
            NegotiationPhase::Failed => "failed",
            NegotiationPhase::Closed => "closed",
        }
    }
}

impl std::fmt::Display for NegotiationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the current negotiation round.
#[derive(Debug)]
pub struct Negotiation {
    phase: NegotiationPhase,
    peer: Option<PeerId>,
}

impl Default for Negotiation {
    fn default() -> Self {
        Self {
            phase: NegotiationPhase::Idle,
            peer: None,
        }
    }
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// The remote peer of the current round.
    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    /// Initiator path, first half: create an offer and apply it locally.
    /// The caller sends it and then reports [`Negotiation::offer_sent`].
    pub async fn create_offer<C: EngineConnection>(
        &mut self,
        connection: &mut PeerConnection<C>,
    ) -> CallResult<SessionDescription> {
        let offer = connection
            .guarded(NegotiationStep::CreateOffer, connection.handle().create_offer())
            .await?;
        connection
            .guarded(
                NegotiationStep::SetLocalDescription,
                connection.handle().set_local_description(offer.clone()),
            )
            .await?;
        connection.local_description = Some(SdpType::Offer);
        Ok(offer)
    }

    pub fn offer_sent(&mut self, to: PeerId) {
        self.phase = NegotiationPhase::LocalOfferSent;
        self.peer = Some(to);
    }

    /// Whether an answer from `from` completes the current round.
    pub fn expects_answer_from(&self, from: &PeerId) -> bool {
        self.phase == NegotiationPhase::LocalOfferSent && self.peer.as_ref() == Some(from)
    }

    /// Initiator path, second half: apply the remote answer and drain.
    ///
    /// Returns `Ok(None)` when the answer does not belong to the current
    /// round; it is ignored without touching the connection.
    pub async fn accept_answer<C: EngineConnection>(
        &mut self,
        connection: &mut PeerConnection<C>,
        buffer: &mut CandidateBuffer,
        from: &PeerId,
        answer: SessionDescription,
    ) -> CallResult<Option<DrainReport>> {
        if !self.expects_answer_from(from) {
            warn!(
                peer = %from,
                phase = %self.phase,
                "ignoring answer outside an outstanding offer"
            );
            return Ok(None);
        }

        let report = apply_remote(connection, buffer, answer).await?;
        self.phase = NegotiationPhase::DescriptionsExchanged;
        Ok(Some(report))
    }

    /// Responder path: apply the remote offer, drain, then create and apply
    /// the answer. The caller sends it and then reports
    /// [`Negotiation::answer_sent`].
    pub async fn answer_offer<C: EngineConnection>(
        &mut self,
        connection: &mut PeerConnection<C>,
        buffer: &mut CandidateBuffer,
        from: &PeerId,
        offer: SessionDescription,
    ) -> CallResult<SessionDescription> {
        apply_remote(connection, buffer, offer).await?;
        self.phase = NegotiationPhase::RemoteOfferApplied;
        self.peer = Some(from.clone());

        let answer = connection
            .guarded(NegotiationStep::CreateAnswer, connection.handle().create_answer())
            .await?;
        connection
            .guarded(
                NegotiationStep::SetLocalDescription,
                connection.handle().set_local_description(answer.clone()),
            )
            .await?;
        connection.local_description = Some(SdpType::Answer);
        Ok(answer)
    }

    pub fn answer_sent(&mut self) {
        self.phase = NegotiationPhase::DescriptionsExchanged;
    }

    /// Folds an engine-reported state into the phase.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }
        match state {
            ConnectionState::Connected => self.phase = NegotiationPhase::Connected,
            ConnectionState::Failed => self.phase = NegotiationPhase::Failed,
            _ => {}
        }
    }

    /// Ends the round because the connection was closed.
    pub fn close(&mut self) {
        self.phase = NegotiationPhase::Closed;
        self.peer = None;
    }
}

/// Applies a remote description and drains the buffer in one step.
async fn apply_remote<C: EngineConnection>(
    connection: &mut PeerConnection<C>,
    buffer: &mut CandidateBuffer,
    desc: SessionDescription,
) -> CallResult<DrainReport> {
    let sdp_type = desc.sdp_type;
    connection
        .guarded(
            NegotiationStep::SetRemoteDescription,
            connection.handle().set_remote_description(desc),
        )
        .await?;
    connection.remote_description = Some(sdp_type);

    if !sdp_type.is_settled() {
        return Ok(DrainReport::default());
    }

    let report = connection
        .until_closed(buffer.drain(connection.handle()))
        .await
        .ok_or(CallError::Cancelled(NegotiationStep::AddIceCandidate))?;
    if report.total() > 0 {
        debug!(
            epoch = connection.epoch(),
            applied = report.applied,
            failed = report.failed,
            "drained queued candidates"
        );
    }
    Ok(report)
}
