use tracing::{info, warn};

use crate::error::TransportError;
use crate::media::connection::MediaStream;
use crate::media::peer::PeerSessions;
use crate::models::{Identity, Roster, SignalingEnvelope};

/// Difference between the roster and the live sessions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub add: Vec<Identity>,
    pub remove: Vec<Identity>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub opened: Vec<Identity>,
    pub closed: Vec<Identity>,
    /// Initial offers from sessions where we are the offerer, ready to publish.
    pub offers: Vec<SignalingEnvelope>,
    /// Sessions that failed to come up. Already closed.
    pub failed: Vec<(Identity, TransportError)>,
}

pub fn plan(local: &Identity, roster: &Roster, sessions: &PeerSessions) -> ReconcilePlan {
    let add = roster
        .keys()
        .filter(|id| *id != local && !sessions.contains(id))
        .cloned()
        .collect();
    let remove = sessions
        .ids()
        .into_iter()
        .filter(|id| !roster.contains_key(id))
        .collect();
    ReconcilePlan { add, remove }
}

/// Bring `sessions` in line with `roster`. Every close and open finishes
/// before this returns. Running it twice on the same roster is a no-op.
pub async fn reconcile(
    sessions: &mut PeerSessions,
    roster: &Roster,
    media: &[&MediaStream],
) -> ReconcileOutcome {
    let local = sessions.local().clone();
    let plan = plan(&local, roster, sessions);
    let mut outcome = ReconcileOutcome::default();
    if plan.is_empty() {
        return outcome;
    }

    for peer in plan.remove {
        if sessions.close(&peer).await {
            info!("Peer {} left the channel", peer);
            outcome.closed.push(peer);
        }
    }

    for peer in plan.add {
        sessions.clear_tombstone(&peer);
        let started = match sessions.open(&peer, media).await {
            Ok(session) => session.start().await,
            Err(e) => Err(e),
        };
        match started {
            Ok(offer) => {
                if let Some(offer) = offer {
                    outcome
                        .offers
                        .push(SignalingEnvelope::description(local.clone(), peer.clone(), offer));
                }
                outcome.opened.push(peer);
            }
            Err(e) => {
                warn!("Failed to set up session with {}: {}", peer, e);
                sessions.close(&peer).await;
                outcome.failed.push((peer, e));
            }
        }
    }

    outcome
}
