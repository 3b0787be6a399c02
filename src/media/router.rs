use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::{ProtocolViolation, TransportError};
use crate::media::connection::MediaStream;
use crate::media::peer::{CandidateOutcome, PeerSessions};
use crate::models::{Identity, SdpKind, SignalKind, SignalPayload, SignalingEnvelope};

/// Why an envelope was skipped without being looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotAddressed,
    SelfEcho,
    /// Sent before this subscription, minus the tolerance window.
    Stale,
    /// An offer from a peer whose session was closed after it was sent.
    Superseded,
}

/// Result of routing one inbound envelope.
#[derive(Debug)]
pub enum Dispatch {
    /// An offer was applied; this answer must be published.
    Answered(SignalingEnvelope),
    Applied,
    Buffered(usize),
    Dropped(ProtocolViolation),
    Ignored(IgnoreReason),
    /// The session for `peer` hit a transport error and must be closed.
    Failed(Identity, TransportError),
}

/// Routes envelopes from the channel's signaling stream to peer sessions.
#[derive(Debug, Clone)]
pub struct SignalingRouter {
    local: Identity,
    subscribed_at: DateTime<Utc>,
    stale_window: Duration,
}

impl SignalingRouter {
    pub fn new(local: Identity, subscribed_at: DateTime<Utc>, stale_window_ms: i64) -> Self {
        Self {
            local,
            subscribed_at,
            stale_window: Duration::milliseconds(stale_window_ms),
        }
    }

    pub fn screen(&self, env: &SignalingEnvelope, sessions: &PeerSessions) -> Option<IgnoreReason> {
        if env.to != self.local {
            return Some(IgnoreReason::NotAddressed);
        }
        if env.from == self.local {
            return Some(IgnoreReason::SelfEcho);
        }
        if env.sent_at < self.subscribed_at - self.stale_window {
            return Some(IgnoreReason::Stale);
        }
        if env.kind == SignalKind::Offer && !sessions.contains(&env.from) {
            if let Some(closed_at) = sessions.tombstoned_at(&env.from) {
                if env.sent_at <= closed_at {
                    return Some(IgnoreReason::Superseded);
                }
            }
        }
        None
    }

    /// Apply `env` to the matching session. `media` is what a session created
    /// by an inbound offer gets attached.
    pub async fn dispatch(
        &self,
        env: SignalingEnvelope,
        sessions: &mut PeerSessions,
        media: &[&MediaStream],
    ) -> Dispatch {
        if let Some(reason) = self.screen(&env, sessions) {
            debug!("Ignoring {:?} from {}: {:?}", env.kind, env.from, reason);
            return Dispatch::Ignored(reason);
        }

        let SignalingEnvelope { kind, from, payload, .. } = env;
        match (kind, payload) {
            (SignalKind::Offer, SignalPayload::Description(desc)) if desc.kind == SdpKind::Offer => {
                let session = match sessions.open(&from, media).await {
                    Ok(session) => session,
                    Err(e) => return Dispatch::Failed(from, e),
                };
                match session.accept_offer(desc).await {
                    Ok(answer) => Dispatch::Answered(SignalingEnvelope::description(
                        self.local.clone(),
                        from,
                        answer,
                    )),
                    Err(e) => Dispatch::Failed(from, e),
                }
            }
            (SignalKind::Answer, SignalPayload::Description(desc)) if desc.kind == SdpKind::Answer => {
                let Some(session) = sessions.get_mut(&from) else {
                    return violation(ProtocolViolation::UnknownSession { kind, from });
                };
                match session.accept_answer(desc).await {
                    Ok(()) => Dispatch::Applied,
                    Err(e) => Dispatch::Failed(from, e),
                }
            }
            (SignalKind::Candidate, SignalPayload::Candidate(candidate)) => {
                let Some(session) = sessions.get_mut(&from) else {
                    return violation(ProtocolViolation::UnknownSession { kind, from });
                };
                match session.add_remote_candidate(candidate).await {
                    Ok(CandidateOutcome::Buffered(n)) => Dispatch::Buffered(n),
                    Ok(CandidateOutcome::Applied | CandidateOutcome::Rejected) => Dispatch::Applied,
                    Err(e) => Dispatch::Failed(from, e),
                }
            }
            _ => violation(ProtocolViolation::PayloadMismatch { kind, from }),
        }
    }
}

fn violation(v: ProtocolViolation) -> Dispatch {
    warn!("Dropping signal: {}", v);
    Dispatch::Dropped(v)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::media::peer::SessionContext;
    use crate::models::{NetworkCandidate, SessionDescription};
    use crate::testing::{Call, FakeConnector};

    fn setup(local: &str) -> (Arc<FakeConnector>, PeerSessions, SignalingRouter) {
        let connector = FakeConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sessions = PeerSessions::new(SessionContext {
            local: local.into(),
            connector: connector.clone(),
            events_tx: tx,
            connection_ids: Default::default(),
        });
        let router = SignalingRouter::new(local.into(), Utc::now(), 5000);
        (connector, sessions, router)
    }

    fn candidate(from: &str, to: &str, c: &str) -> SignalingEnvelope {
        SignalingEnvelope::candidate(from.into(), to.into(), NetworkCandidate::new(c))
    }

    fn offer(from: &str, to: &str) -> SignalingEnvelope {
        SignalingEnvelope::description(from.into(), to.into(), SessionDescription::offer("v=0"))
    }

    #[tokio::test]
    async fn candidate_offer_interleaving_applies_in_order() {
        let (connector, mut sessions, router) = setup("b");

        // Session exists from the roster, remote description not yet set.
        let a = Identity::from("a");
        sessions.open(&a, &[]).await.unwrap();

        assert!(matches!(
            router.dispatch(candidate("a", "b", "c1"), &mut sessions, &[]).await,
            Dispatch::Buffered(1)
        ));
        assert!(matches!(
            router.dispatch(candidate("a", "b", "c2"), &mut sessions, &[]).await,
            Dispatch::Buffered(2)
        ));
        let answered = router.dispatch(offer("a", "b"), &mut sessions, &[]).await;
        let Dispatch::Answered(answer) = answered else {
            panic!("expected an answer, got {answered:?}");
        };
        assert_eq!(answer.kind, SignalKind::Answer);
        assert_eq!(answer.to, a);
        assert!(matches!(
            router.dispatch(candidate("a", "b", "c3"), &mut sessions, &[]).await,
            Dispatch::Applied
        ));

        let calls = connector.connection_for(&a).unwrap().calls();
        let remote_at = calls
            .iter()
            .position(|c| *c == Call::SetRemote(SdpKind::Offer))
            .unwrap();
        let candidates: Vec<(usize, &str)> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Call::AddCandidate(s) => Some((i, s.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            candidates.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
            vec!["c1", "c2", "c3"]
        );
        assert!(candidates.iter().all(|(i, _)| *i > remote_at));
    }

    #[tokio::test]
    async fn offer_creates_session_once() {
        let (connector, mut sessions, router) = setup("b");
        router.dispatch(offer("a", "b"), &mut sessions, &[]).await;
        router.dispatch(offer("a", "b"), &mut sessions, &[]).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(connector.count_for(&"a".into()), 1);
    }

    #[tokio::test]
    async fn answer_or_candidate_without_session_is_dropped() {
        let (_connector, mut sessions, router) = setup("b");
        let answer = SignalingEnvelope::description("a".into(), "b".into(), SessionDescription::answer("v=0"));

        assert!(matches!(
            router.dispatch(answer, &mut sessions, &[]).await,
            Dispatch::Dropped(ProtocolViolation::UnknownSession { kind: SignalKind::Answer, .. })
        ));
        assert!(matches!(
            router.dispatch(candidate("a", "b", "c"), &mut sessions, &[]).await,
            Dispatch::Dropped(ProtocolViolation::UnknownSession { kind: SignalKind::Candidate, .. })
        ));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn mismatched_payload_is_dropped() {
        let (_connector, mut sessions, router) = setup("b");
        let mut env = offer("a", "b");
        env.payload = SignalPayload::Candidate(NetworkCandidate::new("c"));
        assert!(matches!(
            router.dispatch(env, &mut sessions, &[]).await,
            Dispatch::Dropped(ProtocolViolation::PayloadMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn filters_foreign_echo_and_stale_envelopes() {
        let (_connector, mut sessions, router) = setup("b");

        assert!(matches!(
            router.dispatch(offer("a", "c"), &mut sessions, &[]).await,
            Dispatch::Ignored(IgnoreReason::NotAddressed)
        ));
        assert!(matches!(
            router.dispatch(offer("b", "b"), &mut sessions, &[]).await,
            Dispatch::Ignored(IgnoreReason::SelfEcho)
        ));

        let mut old = offer("a", "b");
        old.sent_at = Utc::now() - Duration::seconds(30);
        assert!(matches!(
            router.dispatch(old, &mut sessions, &[]).await,
            Dispatch::Ignored(IgnoreReason::Stale)
        ));

        let mut recent = offer("a", "b");
        recent.sent_at = Utc::now() - Duration::seconds(2);
        assert!(matches!(
            router.dispatch(recent, &mut sessions, &[]).await,
            Dispatch::Answered(_)
        ));
    }

    #[tokio::test]
    async fn late_offer_cannot_resurrect_closed_peer() {
        let (_connector, mut sessions, router) = setup("b");
        let a = Identity::from("a");
        let late = offer("a", "b");

        sessions.open(&a, &[]).await.unwrap();
        sessions.close(&a).await;

        assert!(matches!(
            router.dispatch(late, &mut sessions, &[]).await,
            Dispatch::Ignored(IgnoreReason::Superseded)
        ));
        assert!(sessions.is_empty());

        sessions.clear_tombstone(&a);
        assert!(matches!(
            router.dispatch(offer("a", "b"), &mut sessions, &[]).await,
            Dispatch::Answered(_)
        ));
    }

    #[tokio::test]
    async fn transport_failure_is_reported_for_closing() {
        let (connector, mut sessions, router) = setup("b");
        connector.fail_connects(true);
        let out = router.dispatch(offer("a", "b"), &mut sessions, &[]).await;
        assert!(matches!(out, Dispatch::Failed(ref peer, TransportError::Setup(_)) if peer.as_str() == "a"));
    }
}
