pub mod client;
pub mod local;
pub mod relay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::RelayError;
use crate::models::{ChannelKey, Identity, MemberProfile, Roster, SignalingEnvelope, VoiceFlags};

/// Roster pub/sub for voice channels. One record per (channel, member);
/// a record disappears when its publisher retracts it or goes away.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn subscribe(&self, channel: &ChannelKey) -> Result<watch::Receiver<Roster>, RelayError>;

    async fn publish_self(
        &self,
        channel: &ChannelKey,
        member: &Identity,
        profile: &MemberProfile,
    ) -> Result<(), RelayError>;

    /// Partial update; flags left as `None` are not touched.
    async fn update_self(
        &self,
        channel: &ChannelKey,
        member: &Identity,
        flags: &VoiceFlags,
    ) -> Result<(), RelayError>;

    async fn retract_self(&self, channel: &ChannelKey, member: &Identity) -> Result<(), RelayError>;

    /// Release the roster subscription for `channel` once every receiver
    /// handed out for it has been dropped.
    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), RelayError>;
}

/// Ordered per-channel stream of signaling envelopes. A subscriber sees
/// every envelope published after it subscribed, in publish order.
#[async_trait]
pub trait SignalingBus: Send + Sync {
    async fn subscribe(
        &self,
        channel: &ChannelKey,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEnvelope>, RelayError>;

    async fn publish(&self, channel: &ChannelKey, envelope: SignalingEnvelope) -> Result<(), RelayError>;

    /// Release the signal subscription for `channel` once every receiver
    /// handed out for it has been dropped.
    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), RelayError>;
}

/// Frames a relay client sends to the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SubscribeRoster {
        channel: ChannelKey,
    },
    SubscribeSignals {
        channel: ChannelKey,
    },
    UnsubscribeRoster {
        channel: ChannelKey,
    },
    UnsubscribeSignals {
        channel: ChannelKey,
    },
    PublishPresence {
        channel: ChannelKey,
        member: Identity,
        profile: MemberProfile,
    },
    UpdatePresence {
        channel: ChannelKey,
        member: Identity,
        flags: VoiceFlags,
    },
    RetractPresence {
        channel: ChannelKey,
        member: Identity,
    },
    Signal {
        channel: ChannelKey,
        envelope: SignalingEnvelope,
    },
}

/// Frames the relay server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Roster { channel: ChannelKey, roster: Roster },
    Signal { channel: ChannelKey, envelope: SignalingEnvelope },
    Error { message: String },
}
