//! Pending ICE candidate queue.
//!
//! Candidates relayed by the remote peer may overtake the description they
//! belong to. Until a settled remote description is applied they wait here,
//! and they are applied in arrival order as soon as one is.

use std::collections::VecDeque;

use protocol::IceCandidateData;
use tracing::{debug, warn};

use crate::network::{EngineConnection, EngineError};

/// What happened to a candidate handed to [`CandidateBuffer::offer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Applied to the connection right away.
    Applied,
    /// Queued until a remote description is applied.
    Queued { pending: usize },
    /// Applied right away and rejected by the engine.
    Rejected(EngineError),
}

/// Result of draining the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.applied + self.failed
    }
}

/// FIFO queue of candidates waiting for a remote description.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidateData>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Applies `candidate` if the connection already has a settled remote
    /// description, queues it otherwise.
    pub async fn offer<C: EngineConnection>(
        &mut self,
        connection: &C,
        remote_settled: bool,
        candidate: IceCandidateData,
    ) -> CandidateOutcome {
        if !remote_settled {
            self.pending.push_back(candidate);
            debug!(pending = self.pending.len(), "queued remote candidate");
            return CandidateOutcome::Queued {
                pending: self.pending.len(),
            };
        }

        // Every drain runs in the same step as the description it follows.
        debug_assert!(
            self.pending.is_empty(),
            "candidates still pending after a settled remote description was applied"
        );

        match connection.add_ice_candidate(candidate).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(e) => CandidateOutcome::Rejected(e),
        }
    }

    /// Applies every queued candidate in arrival order and empties the queue.
    ///
    /// A rejected candidate is logged and skipped; the rest are still applied.
    pub async fn drain<C: EngineConnection>(&mut self, connection: &C) -> DrainReport {
        let mut report = DrainReport::default();
        if self.pending.is_empty() {
            return report;
        }

        debug!(pending = self.pending.len(), "draining queued candidates");
        while let Some(candidate) = self.pending.pop_front() {
            let line = candidate.candidate.clone();
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(candidate = %line, error = %e, "queued candidate rejected");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Discards every queued candidate. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{
        EngineCall, EngineEventSink, IceConfig, MemoryConnection, MemoryEngine, PeerEngine,
    };
    use protocol::SessionDescription;
    use tokio::sync::mpsc;

    async fn connection(engine: &MemoryEngine) -> MemoryConnection {
        let (tx, _rx) = mpsc::unbounded_channel();
        engine
            .create_connection(IceConfig::default(), EngineEventSink::new(1, tx))
            .await
            .unwrap()
    }

    async fn with_remote_offer(engine: &MemoryEngine) -> MemoryConnection {
        let conn = connection(engine).await;
        conn.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_drain_empty_is_noop() {
        let engine = MemoryEngine::new();
        let conn = with_remote_offer(&engine).await;
        let before = engine.calls().await.len();

        let mut buffer = CandidateBuffer::new();
        let report = buffer.drain(&conn).await;
        let report_again = buffer.drain(&conn).await;

        assert_eq!(report, DrainReport::default());
        assert_eq!(report_again, DrainReport::default());
        assert_eq!(engine.calls().await.len(), before);
    }

    #[tokio::test]
    async fn test_offer_queues_without_remote_description() {
        let engine = MemoryEngine::new();
        let conn = connection(&engine).await;
        let mut buffer = CandidateBuffer::new();

        let outcome = buffer
            .offer(&conn, false, IceCandidateData::new("candidate:a"))
            .await;
        assert_eq!(outcome, CandidateOutcome::Queued { pending: 1 });
        let outcome = buffer
            .offer(&conn, false, IceCandidateData::new("candidate:b"))
            .await;
        assert_eq!(outcome, CandidateOutcome::Queued { pending: 2 });

        assert!(engine.applied_candidates().await.is_empty());
    }

    #[tokio::test]
    async fn test_offer_applies_when_settled() {
        let engine = MemoryEngine::new();
        let conn = with_remote_offer(&engine).await;
        let mut buffer = CandidateBuffer::new();

        let outcome = buffer
            .offer(&conn, true, IceCandidateData::new("candidate:a"))
            .await;
        assert_eq!(outcome, CandidateOutcome::Applied);
        assert!(buffer.is_empty());
        assert_eq!(engine.applied_candidates().await, vec!["candidate:a"]);
    }

    #[tokio::test]
    async fn test_offer_reports_rejection() {
        let engine = MemoryEngine::new();
        engine.fail_candidate("candidate:bad").await;
        let conn = with_remote_offer(&engine).await;
        let mut buffer = CandidateBuffer::new();

        let outcome = buffer
            .offer(&conn, true, IceCandidateData::new("candidate:bad"))
            .await;
        assert!(matches!(outcome, CandidateOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn test_drain_fifo_and_tolerates_failure() {
        let engine = MemoryEngine::new();
        engine.fail_candidate("candidate:2").await;
        let conn = connection(&engine).await;
        let mut buffer = CandidateBuffer::new();

        for n in 1..=4 {
            buffer
                .offer(&conn, false, IceCandidateData::new(format!("candidate:{}", n)))
                .await;
        }
        conn.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();

        let report = buffer.drain(&conn).await;
        assert_eq!(report, DrainReport { applied: 3, failed: 1 });
        assert_eq!(report.total(), 4);
        assert!(buffer.is_empty());
        assert_eq!(
            engine.applied_candidates().await,
            vec!["candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );

        let add_calls = engine
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, EngineCall::AddIceCandidate(_)))
            .count();
        assert_eq!(add_calls, 4);
    }

    #[tokio::test]
    async fn test_clear_discards() {
        let engine = MemoryEngine::new();
        let conn = connection(&engine).await;
        let mut buffer = CandidateBuffer::new();
        buffer
            .offer(&conn, false, IceCandidateData::new("candidate:a"))
            .await;

        assert_eq!(buffer.clear(), 1);
        assert_eq!(buffer.clear(), 0);
        assert_eq!(buffer.drain(&conn).await, DrainReport::default());
    }
}
