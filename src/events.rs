use serde::Serialize;
use tokio::sync::broadcast;

use crate::media::connection::TrackKind;
use crate::media::negotiation::NegotiationRole;
use crate::models::Identity;

/// Voice events, emitted by the voice engine and consumed by the WebSocket API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum VoiceEvent {
    Joined { room_id: String, channel_id: String },
    Left { room_id: String, channel_id: String },
    PeerSessionOpened { peer_id: Identity, role: NegotiationRole },
    PeerConnected { peer_id: Identity },
    PeerSessionClosed { peer_id: Identity, reason: String },
    RemoteTrack { peer_id: Identity, track_id: String, kind: TrackKind },
    MuteChanged { muted: bool },
    DeafenChanged { deafened: bool },
    StreamingChanged { streaming: bool },
    SignalDropped { from: Identity, reason: String },
}

pub type EventSender = broadcast::Sender<VoiceEvent>;
pub type EventReceiver = broadcast::Receiver<VoiceEvent>;

pub fn create_event_bus(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
