use serde::{Deserialize, Serialize};

use crate::models::Identity;

/// Which side of a peer pair originates offers, including renegotiation offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// The lower identity offers. Both sides evaluate this independently and
/// agree without exchanging anything, so a pair never glares.
pub fn role_for(local: &Identity, peer: &Identity) -> NegotiationRole {
    if local < peer {
        NegotiationRole::Offerer
    } else {
        NegotiationRole::Answerer
    }
}
