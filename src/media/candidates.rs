use std::collections::VecDeque;

use crate::models::NetworkCandidate;

/// What to do with an inbound candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Remote description is in place; apply now.
    Apply(NetworkCandidate),
    /// Held until the remote description lands. Carries the queue length.
    Buffered(usize),
}

/// Per-peer FIFO of candidates that arrived before the remote description.
///
/// The queue is only ever non-empty while `remote_ready` is false, and it is
/// drained exactly once, by the call that flips `remote_ready`.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<NetworkCandidate>,
    remote_ready: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn admit(&mut self, candidate: NetworkCandidate) -> Admission {
        if self.remote_ready {
            Admission::Apply(candidate)
        } else {
            self.pending.push_back(candidate);
            Admission::Buffered(self.pending.len())
        }
    }

    /// Record that a remote description was applied and hand back everything
    /// buffered so far, oldest first. Later calls return nothing.
    pub fn mark_remote_ready(&mut self) -> Vec<NetworkCandidate> {
        self.remote_ready = true;
        self.pending.drain(..).collect()
    }

    /// Drop everything on session close. Returns how many were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
