use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::media::candidates::{Admission, CandidateBuffer};
use crate::media::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionState, MediaConnection,
    MediaStream,
};
use crate::media::negotiation::{role_for, NegotiationRole};
use crate::models::{Identity, NetworkCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Negotiating,
    Connected,
    Closed,
}

/// What happened to an inbound candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered(usize),
    /// The connection refused it. Logged; the session carries on.
    Rejected,
}

/// Effect of a transport state report on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Connected,
    /// The session must be closed and discarded.
    Terminal,
}

/// One media connection to one remote identity, plus its negotiation state.
pub struct PeerSession {
    peer_id: Identity,
    connection_id: u64,
    role: NegotiationRole,
    state: SessionState,
    connection: Arc<dyn MediaConnection>,
    candidates: CandidateBuffer,
    attached: Vec<String>,
    transport_connected: bool,
    renegotiation_pending: bool,
}

impl PeerSession {
    pub fn new(
        local: &Identity,
        peer_id: Identity,
        connection_id: u64,
        connection: Arc<dyn MediaConnection>,
    ) -> Self {
        Self {
            role: role_for(local, &peer_id),
            peer_id,
            connection_id,
            state: SessionState::Created,
            connection,
            candidates: CandidateBuffer::new(),
            attached: Vec::new(),
            transport_connected: false,
            renegotiation_pending: false,
        }
    }

    pub fn peer_id(&self) -> &Identity {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn is_offerer(&self) -> bool {
        self.role == NegotiationRole::Offerer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn remote_description_set(&self) -> bool {
        self.candidates.is_remote_ready()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn attached_tracks(&self) -> &[String] {
        &self.attached
    }

    pub fn renegotiation_pending(&self) -> bool {
        self.renegotiation_pending
    }

    /// Attach every track of `stream` not already attached.
    pub async fn attach(&mut self, stream: &MediaStream) -> Result<(), TransportError> {
        self.ensure_open()?;
        for track in stream.tracks() {
            if self.attached.iter().any(|id| id == track.id()) {
                continue;
            }
            self.connection.add_track(track.clone(), stream.id()).await?;
            self.attached.push(track.id().to_string());
            debug!("Attached track {} to session with {}", track.id(), self.peer_id);
        }
        Ok(())
    }

    pub async fn detach(&mut self, stream: &MediaStream) -> Result<(), TransportError> {
        self.ensure_open()?;
        for track in stream.tracks() {
            let Some(pos) = self.attached.iter().position(|id| id == track.id()) else {
                continue;
            };
            self.connection.remove_track(track.id()).await?;
            self.attached.remove(pos);
            debug!("Detached track {} from session with {}", track.id(), self.peer_id);
        }
        Ok(())
    }

    /// Kick off negotiation for a freshly created session. The offerer
    /// returns its initial offer; the answerer waits for one.
    pub async fn start(&mut self) -> Result<Option<SessionDescription>, TransportError> {
        match self.role {
            NegotiationRole::Offerer => self.make_offer().await.map(Some),
            NegotiationRole::Answerer => Ok(None),
        }
    }

    /// Produce a fresh offer after the local track set changed. Only the
    /// offerer ever originates one, and only from `Connected`: while an offer
    /// is still unanswered the change is remembered and offered by
    /// [`PeerSession::resume_renegotiation`] once the session settles.
    pub async fn renegotiate(&mut self) -> Result<Option<SessionDescription>, TransportError> {
        self.ensure_open()?;
        if !self.is_offerer() {
            return Ok(None);
        }
        if self.state != SessionState::Connected {
            debug!("Deferring renegotiation with {} until connected", self.peer_id);
            self.renegotiation_pending = true;
            return Ok(None);
        }
        self.renegotiation_pending = false;
        self.make_offer().await.map(Some)
    }

    /// Offer a deferred renegotiation if the session has reached `Connected`.
    pub async fn resume_renegotiation(&mut self) -> Result<Option<SessionDescription>, TransportError> {
        if !self.renegotiation_pending || self.state != SessionState::Connected {
            return Ok(None);
        }
        self.renegotiate().await
    }

    async fn make_offer(&mut self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.state = SessionState::Negotiating;
        info!("Created WebRTC offer for peer {}", self.peer_id);
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer to send back.
    pub async fn accept_offer(&mut self, offer: SessionDescription) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        self.state = SessionState::Negotiating;
        self.apply_remote(offer).await?;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.settle();
        info!("Created WebRTC answer for peer {}", self.peer_id);
        Ok(answer)
    }

    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.apply_remote(answer).await?;
        self.settle();
        info!("Applied WebRTC answer from peer {}", self.peer_id);
        Ok(())
    }

    pub async fn add_remote_candidate(
        &mut self,
        candidate: NetworkCandidate,
    ) -> Result<CandidateOutcome, TransportError> {
        self.ensure_open()?;
        match self.candidates.admit(candidate) {
            Admission::Apply(candidate) => Ok(self.apply_candidate(candidate).await),
            Admission::Buffered(len) => {
                debug!("Buffered ICE candidate from {} ({} pending)", self.peer_id, len);
                Ok(CandidateOutcome::Buffered(len))
            }
        }
    }

    pub fn on_transport_state(&mut self, state: ConnectionState) -> Transition {
        if self.is_closed() {
            return Transition::None;
        }
        match state {
            ConnectionState::Connected => {
                self.transport_connected = true;
                if self.settle() {
                    Transition::Connected
                } else {
                    Transition::None
                }
            }
            ConnectionState::Disconnected => {
                info!("WebRTC connection to {} disconnected, waiting for recovery", self.peer_id);
                Transition::None
            }
            ConnectionState::Failed | ConnectionState::Closed => Transition::Terminal,
            ConnectionState::New | ConnectionState::Connecting => Transition::None,
        }
    }

    /// Release the connection. Idempotent; errors are logged, never returned.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Closed;
        let dropped = self.candidates.discard();
        if dropped > 0 {
            debug!("Discarded {} pending candidates for {}", dropped, self.peer_id);
        }
        self.attached.clear();
        if let Err(e) = self.connection.close().await {
            warn!("Error closing peer connection to {}: {}", self.peer_id, e);
        }
        info!("Closed peer connection to {}", self.peer_id);
    }

    /// Set the remote description and drain whatever candidates were waiting
    /// for it, in arrival order.
    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), TransportError> {
        self.connection.set_remote_description(desc).await?;
        for candidate in self.candidates.mark_remote_ready() {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: NetworkCandidate) -> CandidateOutcome {
        match self.connection.add_candidate(candidate).await {
            Ok(()) => {
                debug!("Added ICE candidate from peer {}", self.peer_id);
                CandidateOutcome::Applied
            }
            Err(e) => {
                warn!("Failed to add ICE candidate from {}: {}", self.peer_id, e);
                CandidateOutcome::Rejected
            }
        }
    }

    /// Move to `Connected` once both the descriptions and the transport allow it.
    /// Returns true on the edge.
    fn settle(&mut self) -> bool {
        let ready = self.transport_connected && self.candidates.is_remote_ready();
        if ready && self.state != SessionState::Connected {
            self.state = SessionState::Connected;
            return true;
        }
        false
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Everything needed to build a new session.
#[derive(Clone)]
pub struct SessionContext {
    pub local: Identity,
    pub connector: Arc<dyn ConnectionFactory>,
    pub events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    /// Shared by every call of one engine so a connection id is never reused.
    pub connection_ids: Arc<AtomicU64>,
}

impl SessionContext {
    fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// The session table of one call. At most one session per remote identity.
pub struct PeerSessions {
    ctx: SessionContext,
    sessions: HashMap<Identity, PeerSession>,
    tombstones: HashMap<Identity, DateTime<Utc>>,
}

impl PeerSessions {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    pub fn local(&self) -> &Identity {
        &self.ctx.local
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn get(&self, peer: &Identity) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn get_mut(&mut self, peer: &Identity) -> Option<&mut PeerSession> {
        self.sessions.get_mut(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session identities in tie-break order.
    pub fn ids(&self) -> Vec<Identity> {
        let mut ids: Vec<Identity> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    /// Return the live session for `peer`, creating it (with `media` attached)
    /// only if none exists.
    pub async fn open(
        &mut self,
        peer: &Identity,
        media: &[&MediaStream],
    ) -> Result<&mut PeerSession, TransportError> {
        if self.sessions.contains_key(peer) {
            return self.sessions.get_mut(peer).ok_or(TransportError::Closed);
        }

        let connection_id = self.ctx.next_connection_id();
        let events = ConnectionEvents::new(peer.clone(), connection_id, self.ctx.events_tx.clone());
        let connection = self.ctx.connector.connect(peer, events).await?;

        let mut session = PeerSession::new(&self.ctx.local, peer.clone(), connection_id, connection);
        for stream in media {
            if let Err(e) = session.attach(stream).await {
                session.close().await;
                return Err(e);
            }
        }

        info!(
            "Created WebRTC peer connection for {} (#{}, {:?})",
            peer,
            connection_id,
            session.role()
        );
        Ok(self.sessions.entry(peer.clone()).or_insert(session))
    }

    /// Close and discard the session for `peer`, leaving a tombstone so that
    /// late offers cannot bring it back. Returns false if there was none.
    pub async fn close(&mut self, peer: &Identity) -> bool {
        match self.sessions.remove(peer) {
            Some(mut session) => {
                session.close().await;
                self.tombstones.insert(peer.clone(), Utc::now());
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        let peers: Vec<Identity> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.close(&peer).await;
        }
    }

    pub fn tombstoned_at(&self, peer: &Identity) -> Option<DateTime<Utc>> {
        self.tombstones.get(peer).copied()
    }

    pub fn clear_tombstone(&mut self, peer: &Identity) {
        self.tombstones.remove(peer);
    }
}
