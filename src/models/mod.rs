use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================
// Identity & channel addressing
// ============================================================

/// Stable identity of a logical user. Ordering is plain string ordering,
/// which is what the offer tie-break relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A voice channel inside a room. Presence and signaling are both scoped to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub room_id: String,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn new(room_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room_id, self.channel_id)
    }
}

// ============================================================
// Roster
// ============================================================

/// What a member publishes about itself when it joins a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Partial update of a member's side-channel flags. `None` leaves a flag as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deafened: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub streaming: bool,
}

impl RosterEntry {
    pub fn new(profile: MemberProfile) -> Self {
        Self {
            display_name: profile.display_name,
            avatar_url: profile.avatar_url,
            joined_at: Utc::now(),
            muted: false,
            deafened: false,
            streaming: false,
        }
    }

    pub fn apply(&mut self, flags: &VoiceFlags) {
        if let Some(muted) = flags.muted {
            self.muted = muted;
        }
        if let Some(deafened) = flags.deafened {
            self.deafened = deafened;
        }
        if let Some(streaming) = flags.streaming {
            self.streaming = streaming;
        }
    }
}

/// Live member set of one voice channel.
pub type Roster = BTreeMap<Identity, RosterEntry>;

// ============================================================
// Signaling
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl NetworkCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(NetworkCandidate),
}

/// A directed signaling message. Never broadcast: `to` is always one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub kind: SignalKind,
    pub from: Identity,
    pub to: Identity,
    pub payload: SignalPayload,
    pub sent_at: DateTime<Utc>,
}

impl SignalingEnvelope {
    pub fn description(from: Identity, to: Identity, desc: SessionDescription) -> Self {
        let kind = match desc.kind {
            SdpKind::Offer => SignalKind::Offer,
            SdpKind::Answer => SignalKind::Answer,
        };
        Self {
            kind,
            from,
            to,
            payload: SignalPayload::Description(desc),
            sent_at: Utc::now(),
        }
    }

    pub fn candidate(from: Identity, to: Identity, candidate: NetworkCandidate) -> Self {
        Self {
            kind: SignalKind::Candidate,
            from,
            to,
            payload: SignalPayload::Candidate(candidate),
            sent_at: Utc::now(),
        }
    }
}
