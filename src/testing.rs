//! In-memory stand-ins for the media stack, shared by the unit tests.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{DeviceError, TransportError};
use crate::media::connection::{
    ConnectionEvents, ConnectionFactory, ConnectionState, DisplayCapture, MediaConnection,
    MediaDevices, MediaStream, MediaTrack, TrackKind,
};
use crate::models::{Identity, NetworkCandidate, SdpKind, SessionDescription};

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn audio(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, TrackKind::Audio)
    }

    pub fn video(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, TrackKind::Video)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Everything a [`FakeConnection`] was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddTrack(String),
    RemoveTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct FakeConnectionState {
    local_set: bool,
    remote_set: bool,
    connected: bool,
    closed: bool,
    gathered: u32,
}

/// Emits one local candidate per local description, and a remote track plus
/// `Connected` once both descriptions are in place.
pub struct FakeConnection {
    peer: Identity,
    events: ConnectionEvents,
    calls: Mutex<Vec<Call>>,
    state: Mutex<FakeConnectionState>,
    rejected: Mutex<HashSet<String>>,
    remote_track: Mutex<Option<Arc<FakeTrack>>>,
}

impl FakeConnection {
    fn new(peer: Identity, events: ConnectionEvents) -> Self {
        Self {
            peer,
            events,
            calls: Mutex::new(Vec::new()),
            state: Mutex::new(FakeConnectionState::default()),
            rejected: Mutex::new(HashSet::new()),
            remote_track: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &Identity {
        &self.peer
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// The track this connection delivered to the engine once connected.
    pub fn remote_track(&self) -> Option<Arc<FakeTrack>> {
        self.remote_track.lock().unwrap().clone()
    }

    /// Make `add_candidate` refuse this candidate string.
    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().unwrap().insert(candidate.to_string());
    }

    /// Report a transport state as if the network changed underneath.
    pub fn report(&self, state: ConnectionState) {
        self.events.state(state);
    }

    fn record(&self, call: Call) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(call);
        if self.state.lock().unwrap().closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn maybe_connect(&self) {
        let mut state = self.state.lock().unwrap();
        if state.local_set && state.remote_set && !state.connected {
            state.connected = true;
            drop(state);
            let track = FakeTrack::audio(format!("remote-audio-{}", self.peer));
            *self.remote_track.lock().unwrap() = Some(track.clone());
            self.events.track(track, format!("stream-{}", self.peer));
            self.events.state(ConnectionState::Connected);
        }
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>, _stream_id: &str) -> Result<(), TransportError> {
        self.record(Call::AddTrack(track.id().to_string()))
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        self.record(Call::RemoveTrack(track_id.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer)?;
        Ok(SessionDescription::offer(format!("fake-offer-{}", self.peer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer)?;
        Ok(SessionDescription::answer(format!("fake-answer-{}", self.peer)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetLocal(desc.kind))?;
        let n = {
            let mut state = self.state.lock().unwrap();
            state.local_set = true;
            state.gathered += 1;
            state.gathered
        };
        self.events
            .candidate(NetworkCandidate::new(format!("candidate:{}:{}", self.peer, n)));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetRemote(desc.kind))?;
        self.state.lock().unwrap().remote_set = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_candidate(&self, candidate: NetworkCandidate) -> Result<(), TransportError> {
        self.record(Call::AddCandidate(candidate.candidate.clone()))?;
        if !self.state.lock().unwrap().remote_set {
            return Err(TransportError::Candidate("remote description not set".into()));
        }
        if self.rejected.lock().unwrap().contains(&candidate.candidate) {
            return Err(TransportError::Candidate(format!("malformed {}", candidate.candidate)));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Close);
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            drop(state);
            self.events.state(ConnectionState::Closed);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    fail: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Most recent connection made to `peer`.
    pub fn connection_for(&self, peer: &Identity) -> Option<Arc<FakeConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.peer() == peer)
            .cloned()
    }

    pub fn count_for(&self, peer: &Identity) -> usize {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.peer() == peer)
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnector {
    async fn connect(
        &self,
        peer: &Identity,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Setup(format!("refused connection to {peer}")));
        }
        let conn = Arc::new(FakeConnection::new(peer.clone(), events));
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

#[derive(Default)]
pub struct FakeDevices {
    deny_audio: AtomicBool,
    deny_display: AtomicBool,
    issued: Mutex<Vec<Arc<FakeTrack>>>,
    display_end: Mutex<Option<oneshot::Sender<()>>>,
    counter: AtomicU32,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deny_audio(&self, deny: bool) {
        self.deny_audio.store(deny, Ordering::SeqCst);
    }

    pub fn deny_display(&self, deny: bool) {
        self.deny_display.store(deny, Ordering::SeqCst);
    }

    pub fn issued(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.issued.lock().unwrap().iter().all(|t| t.is_stopped())
    }

    /// Simulate the user ending the share from outside the app.
    pub fn end_display(&self) {
        if let Some(tx) = self.display_end.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    fn issue(&self, kind: TrackKind) -> Arc<FakeTrack> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let prefix = match kind {
            TrackKind::Audio => "mic",
            TrackKind::Video => "display",
        };
        let track = FakeTrack::new(format!("{prefix}-{n}"), kind);
        self.issued.lock().unwrap().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_local_audio(&self) -> Result<MediaStream, DeviceError> {
        if self.deny_audio.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("microphone".into()));
        }
        let track = self.issue(TrackKind::Audio);
        Ok(MediaStream::with_tracks(format!("{}-stream", track.id()), vec![track as Arc<dyn MediaTrack>]))
    }

    async fn acquire_display_media(&self) -> Result<DisplayCapture, DeviceError> {
        if self.deny_display.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("screen".into()));
        }
        let track = self.issue(TrackKind::Video);
        let (tx, rx) = oneshot::channel();
        *self.display_end.lock().unwrap() = Some(tx);
        Ok(DisplayCapture {
            stream: MediaStream::with_tracks(format!("{}-stream", track.id()), vec![track as Arc<dyn MediaTrack>]),
            ended: Some(rx),
        })
    }
}
