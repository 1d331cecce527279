use super::transport::PeerTransport;
use super::types::{CandidateKind, IceCandidate};
use crate::error::CandidateApplyError;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// What `push` did with a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    Queued,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
}

/// Remote candidates that arrived before the remote description.
///
/// Holds candidates only while the remote description is unset; once it
/// is set they are drained in arrival order and later ones go straight
/// to the transport.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_set: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(
        &mut self,
        candidate: IceCandidate,
        transport: &dyn PeerTransport,
    ) -> Result<PushOutcome, CandidateApplyError> {
        if self.remote_set {
            transport.add_ice_candidate(candidate).await?;
            debug!("remote candidate applied");
            Ok(PushOutcome::Applied)
        } else {
            debug!(queued = self.pending.len() + 1, "remote description not set yet, queuing candidate");
            self.pending.push_back(candidate);
            Ok(PushOutcome::Queued)
        }
    }

    /// Marks the remote description as set and applies everything queued.
    /// A rejected candidate is logged and skipped.
    pub async fn drain(&mut self, transport: &dyn PeerTransport) -> DrainReport {
        self.remote_set = true;
        let mut report = DrainReport::default();
        while let Some(candidate) = self.pending.pop_front() {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(error = %e, "failed to apply pending candidate");
                    report.failed += 1;
                }
            }
        }
        if report.applied + report.failed > 0 {
            debug!(applied = report.applied, failed = report.failed, "pending candidates drained");
        }
        report
    }

    /// Drops everything and forgets the remote description.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.remote_set = false;
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_set
    }
}

/// Tally of local candidate types gathered for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateStats {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match candidate.kind() {
            CandidateKind::Host => self.host += 1,
            CandidateKind::ServerReflexive => self.srflx += 1,
            CandidateKind::Relay => self.relay += 1,
            CandidateKind::PeerReflexive | CandidateKind::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    /// Logs the tally; warns when NAT traversal has nothing but host paths.
    pub fn log_summary(&self) {
        debug!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate analysis"
        );
        if self.total() > 0 && self.srflx == 0 && self.relay == 0 {
            warn!("no srflx or relay candidates gathered, connection through NAT may fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NegotiationError;
    use crate::media::LocalTrack;
    use crate::peer::types::SessionDescription;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<String>>,
        reject: Option<&'static str>,
    }

    #[async_trait]
    impl PeerTransport for Recorder {
        async fn add_track(&self, _: &LocalTrack) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn set_local_description(&self, _: SessionDescription) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn set_remote_description(&self, _: SessionDescription) -> Result<(), NegotiationError> {
            Ok(())
        }
        async fn add_ice_candidate(&self, c: IceCandidate) -> Result<(), CandidateApplyError> {
            if Some(c.candidate.as_str()) == self.reject {
                return Err(CandidateApplyError("rejected".into()));
            }
            self.applied.lock().push(c.candidate);
            Ok(())
        }
        fn clear_handlers(&self) {}
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn queues_until_remote_description_then_drains_in_order() {
        let t = Recorder::default();
        let mut buf = CandidateBuffer::new();
        for c in ["a", "b", "c"] {
            assert_eq!(buf.push(IceCandidate::new(c), &t).await.unwrap(), PushOutcome::Queued);
        }
        assert!(t.applied.lock().is_empty());

        let report = buf.drain(&t).await;
        assert_eq!(report, DrainReport { applied: 3, failed: 0 });
        assert_eq!(*t.applied.lock(), vec!["a", "b", "c"]);
        assert!(buf.is_empty());

        assert_eq!(buf.push(IceCandidate::new("d"), &t).await.unwrap(), PushOutcome::Applied);
        assert_eq!(t.applied.lock().last().map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn failed_candidate_does_not_abort_drain() {
        let t = Recorder {
            reject: Some("b"),
            ..Default::default()
        };
        let mut buf = CandidateBuffer::new();
        for c in ["a", "b", "c"] {
            buf.push(IceCandidate::new(c), &t).await.unwrap();
        }
        let report = buf.drain(&t).await;
        assert_eq!(report, DrainReport { applied: 2, failed: 1 });
        assert_eq!(*t.applied.lock(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn clear_forgets_everything() {
        let t = Recorder::default();
        let mut buf = CandidateBuffer::new();
        buf.push(IceCandidate::new("a"), &t).await.unwrap();
        assert_eq!(buf.clear(), 1);
        assert!(!buf.remote_description_set());

        buf.drain(&t).await;
        assert!(buf.remote_description_set());
        buf.clear();
        assert_eq!(buf.push(IceCandidate::new("b"), &t).await.unwrap(), PushOutcome::Queued);
        assert!(t.applied.lock().is_empty());
    }

    #[test]
    fn stats_tally() {
        let mut stats = CandidateStats::default();
        stats.record(&IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 1 typ host"));
        stats.record(&IceCandidate::new("candidate:2 1 udp 1 1.2.3.4 1 typ srflx"));
        stats.record(&IceCandidate::new("candidate:3 1 udp 1 5.6.7.8 1 typ relay"));
        assert_eq!(stats, CandidateStats { host: 1, srflx: 1, relay: 1, other: 0 });
        assert_eq!(stats.total(), 3);
    }
}
