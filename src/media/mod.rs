pub mod candidates;
pub mod connection;
pub mod engine;
pub mod negotiation;
pub mod peer;
pub mod reconciler;
pub mod router;
pub mod rtc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::VoiceError;
use crate::models::{ChannelKey, Identity, MemberProfile, Roster};

use self::negotiation::NegotiationRole;
use self::peer::SessionState;

/// Commands sent to the voice engine from the API and the handle.
#[derive(Debug)]
pub enum MediaCommand {
    JoinChannel {
        channel: ChannelKey,
        profile: MemberProfile,
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    LeaveChannel {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleDeafen {
        reply: oneshot::Sender<bool>,
    },
    StartStream {
        reply: oneshot::Sender<Result<(), VoiceError>>,
    },
    StopStream {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer_id: Identity,
    pub state: SessionState,
    pub role: NegotiationRole,
    pub remote_tracks: usize,
}

/// Current voice state snapshot returned by GET /voice/state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoiceState {
    pub in_voice: bool,
    pub room_id: Option<String>,
    pub channel_id: Option<String>,
    pub muted: bool,
    pub deafened: bool,
    pub streaming: bool,
    pub peers: Vec<PeerStatus>,
    pub members: Roster,
}

impl VoiceState {
    pub fn peer(&self, peer_id: &Identity) -> Option<&PeerStatus> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }

    pub fn connected_peers(&self) -> Vec<Identity> {
        self.peers
            .iter()
            .filter(|p| p.state == SessionState::Connected)
            .map(|p| p.peer_id.clone())
            .collect()
    }
}

/// Cloneable front door to a running voice engine.
#[derive(Clone)]
pub struct VoiceHandle {
    pub command_tx: mpsc::Sender<MediaCommand>,
    pub state_rx: watch::Receiver<VoiceState>,
}

impl VoiceHandle {
    pub fn state(&self) -> VoiceState {
        self.state_rx.borrow().clone()
    }

    /// Join `channel`, leaving the current one first if needed. Fails fast if
    /// the microphone cannot be acquired or the relay is unreachable.
    pub async fn join_channel(&self, channel: ChannelKey, profile: MemberProfile) -> Result<(), VoiceError> {
        self.request(|reply| MediaCommand::JoinChannel {
            channel,
            profile,
            reply,
        })
        .await?
    }

    pub async fn leave_channel(&self) -> Result<(), VoiceError> {
        self.request(|reply| MediaCommand::LeaveChannel { reply }).await
    }

    /// Returns the new mute flag.
    pub async fn toggle_mute(&self) -> Result<bool, VoiceError> {
        self.request(|reply| MediaCommand::ToggleMute { reply }).await
    }

    /// Returns the new deafen flag.
    pub async fn toggle_deafen(&self) -> Result<bool, VoiceError> {
        self.request(|reply| MediaCommand::ToggleDeafen { reply }).await
    }

    pub async fn start_stream(&self) -> Result<(), VoiceError> {
        self.request(|reply| MediaCommand::StartStream { reply }).await?
    }

    pub async fn stop_stream(&self) -> Result<(), VoiceError> {
        self.request(|reply| MediaCommand::StopStream { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> MediaCommand) -> Result<T, VoiceError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| VoiceError::EngineStopped)?;
        rx.await.map_err(|_| VoiceError::EngineStopped)
    }
}
