//! Capability seams between the coordinator and the media stack.
//!
//! The coordinator never touches a concrete peer connection or capture
//! device. It talks to [`MediaConnection`], [`ConnectionFactory`] and
//! [`MediaDevices`]; connection callbacks come back as [`ConnectionEvent`]s
//! on the engine's single event queue.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{DeviceError, TransportError};
use crate::models::{Identity, NetworkCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// An opaque local or remote media track.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_tracks(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track);
        }
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// A screen capture plus an optional signal that fires when the capture
/// ends outside our control (e.g. the OS "stop sharing" button).
pub struct DisplayCapture {
    pub stream: MediaStream,
    pub ended: Option<oneshot::Receiver<()>>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_local_audio(&self) -> Result<MediaStream, DeviceError>;
    async fn acquire_display_media(&self) -> Result<DisplayCapture, DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One bidirectional media connection to a single peer.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>, stream_id: &str) -> Result<(), TransportError>;
    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_candidate(&self, candidate: NetworkCandidate) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection to `peer`. Everything the connection reports
    /// afterwards must go through `events`.
    async fn connect(
        &self,
        peer: &Identity,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, TransportError>;
}

#[derive(Debug)]
pub enum ConnectionEventKind {
    Candidate(NetworkCandidate),
    Track {
        track: Arc<dyn MediaTrack>,
        stream_id: String,
    },
    State(ConnectionState),
}

#[derive(Debug)]
pub struct ConnectionEvent {
    pub peer_id: Identity,
    /// Lets the engine ignore events from a connection it already replaced.
    pub connection_id: u64,
    pub kind: ConnectionEventKind,
}

/// Event sink handed to a connection at creation time.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    peer_id: Identity,
    connection_id: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionEvents {
    pub fn new(peer_id: Identity, connection_id: u64, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            peer_id,
            connection_id,
            tx,
        }
    }

    pub fn peer_id(&self) -> &Identity {
        &self.peer_id
    }

    pub fn candidate(&self, candidate: NetworkCandidate) {
        self.emit(ConnectionEventKind::Candidate(candidate));
    }

    pub fn track(&self, track: Arc<dyn MediaTrack>, stream_id: String) {
        self.emit(ConnectionEventKind::Track { track, stream_id });
    }

    pub fn state(&self, state: ConnectionState) {
        self.emit(ConnectionEventKind::State(state));
    }

    fn emit(&self, kind: ConnectionEventKind) {
        // The engine may already be gone; nothing left to tell.
        let _ = self.tx.send(ConnectionEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            kind,
        });
    }
}
