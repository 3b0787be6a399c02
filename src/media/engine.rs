use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, VoiceError};
use crate::events::{EventSender, VoiceEvent};
use crate::models::{ChannelKey, Identity, MemberProfile, Roster, SignalingEnvelope, VoiceFlags};
use crate::network::{PresenceChannel, SignalingBus};

use super::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionFactory, MediaDevices, MediaStream, TrackKind,
};
use super::negotiation::role_for;
use super::peer::{PeerSessions, SessionContext, Transition};
use super::reconciler::reconcile;
use super::router::{Dispatch, SignalingRouter};
use super::{MediaCommand, PeerStatus, VoiceHandle, VoiceState};

/// Collaborators the voice engine talks to. Identity is fixed for the
/// engine's lifetime.
pub struct EngineDeps {
    pub local: Identity,
    pub presence: Arc<dyn PresenceChannel>,
    pub signaling: Arc<dyn SignalingBus>,
    pub devices: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn ConnectionFactory>,
    pub stale_signal_window_ms: i64,
}

/// Spawn the voice engine on the current runtime and return its handle.
pub fn spawn_voice_engine(deps: EngineDeps, command_buffer: usize, event_tx: EventSender) -> VoiceHandle {
    let (command_tx, command_rx) = mpsc::channel(command_buffer);
    let (state_tx, state_rx) = watch::channel(VoiceState::default());
    tokio::spawn(run_voice_engine(deps, command_rx, event_tx, state_tx));
    VoiceHandle { command_tx, state_rx }
}

/// Everything that exists only while we are in a channel. Dropping it
/// drops both subscriptions.
struct ActiveCall {
    channel: ChannelKey,
    router: SignalingRouter,
    sessions: PeerSessions,
    roster_rx: watch::Receiver<Roster>,
    signal_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    roster: Roster,
    local_audio: MediaStream,
    screen: Option<MediaStream>,
    screen_ended: Option<oneshot::Receiver<()>>,
    remote_media: HashMap<Identity, MediaStream>,
    muted: bool,
    deafened: bool,
}

impl ActiveCall {
    async fn close_peer(&mut self, peer: &Identity, reason: String, event_tx: &EventSender) {
        self.sessions.close(peer).await;
        self.remote_media.remove(peer);
        let _ = event_tx.send(VoiceEvent::PeerSessionClosed {
            peer_id: peer.clone(),
            reason,
        });
    }
}

/// Local media every session carries: the microphone, plus the screen while sharing.
fn outbound<'a>(local_audio: &'a MediaStream, screen: &'a Option<MediaStream>) -> Vec<&'a MediaStream> {
    let mut media = vec![local_audio];
    media.extend(screen.as_ref());
    media
}

async fn send_signal(bus: &dyn SignalingBus, channel: &ChannelKey, envelope: SignalingEnvelope) {
    let (kind, to) = (envelope.kind, envelope.to.clone());
    if let Err(e) = bus.publish(channel, envelope).await {
        warn!("Failed to send {:?} to {}: {}", kind, to, e);
    }
}

async fn send_flags(presence: &dyn PresenceChannel, channel: &ChannelKey, local: &Identity, flags: VoiceFlags) {
    if let Err(e) = presence.update_self(channel, local, &flags).await {
        warn!("Failed to publish voice state: {}", e);
    }
}

enum CallInput {
    RosterChanged,
    Envelope(SignalingEnvelope),
    /// `true` if the capture signalled its end, `false` if the signal went away.
    ScreenEnded(bool),
    SubscriptionClosed,
}

async fn next_call_input(call: &mut Option<ActiveCall>) -> CallInput {
    let Some(call) = call.as_mut() else {
        return std::future::pending().await;
    };
    let ActiveCall {
        roster_rx,
        signal_rx,
        screen_ended,
        ..
    } = call;

    tokio::select! {
        changed = roster_rx.changed() => match changed {
            Ok(()) => CallInput::RosterChanged,
            Err(_) => CallInput::SubscriptionClosed,
        },
        envelope = signal_rx.recv() => match envelope {
            Some(envelope) => CallInput::Envelope(envelope),
            None => CallInput::SubscriptionClosed,
        },
        ended = async {
            match screen_ended.as_mut() {
                Some(rx) => rx.await.is_ok(),
                None => std::future::pending().await,
            }
        } => CallInput::ScreenEnded(ended),
    }
}

struct VoiceEngine {
    deps: EngineDeps,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_ids: Arc<AtomicU64>,
    event_tx: EventSender,
    state_tx: watch::Sender<VoiceState>,
    call: Option<ActiveCall>,
}

/// Run the voice engine event loop.
/// This owns the channel subscriptions, local media, and every peer session;
/// all state changes happen here, one input at a time.
pub async fn run_voice_engine(
    deps: EngineDeps,
    mut cmd_rx: mpsc::Receiver<MediaCommand>,
    event_tx: EventSender,
    state_tx: watch::Sender<VoiceState>,
) {
    info!("VoiceEngine started for {}", deps.local);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
    let mut engine = VoiceEngine {
        deps,
        conn_tx,
        connection_ids: Arc::new(AtomicU64::new(0)),
        event_tx,
        state_tx,
        call: None,
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => engine.handle_command(cmd).await,
                None => break,
            },

            Some(event) = conn_rx.recv() => {
                engine.handle_connection_event(event).await;
            }

            input = next_call_input(&mut engine.call) => {
                engine.handle_call_input(input).await;
            }
        }
        engine.publish_state();
    }

    engine.leave().await;
    engine.publish_state();
    info!("VoiceEngine stopped");
}

impl VoiceEngine {
    /// State is published before each reply so callers observe their own effect.
    async fn handle_command(&mut self, cmd: MediaCommand) {
        match cmd {
            MediaCommand::JoinChannel {
                channel,
                profile,
                reply,
            } => {
                let result = self.join(channel, profile).await;
                self.publish_state();
                let _ = reply.send(result);
            }
            MediaCommand::LeaveChannel { reply } => {
                self.leave().await;
                self.publish_state();
                let _ = reply.send(());
            }
            MediaCommand::ToggleMute { reply } => {
                let muted = self.toggle_mute().await;
                self.publish_state();
                let _ = reply.send(muted);
            }
            MediaCommand::ToggleDeafen { reply } => {
                let deafened = self.toggle_deafen().await;
                self.publish_state();
                let _ = reply.send(deafened);
            }
            MediaCommand::StartStream { reply } => {
                let result = self.start_stream().await;
                self.publish_state();
                let _ = reply.send(result);
            }
            MediaCommand::StopStream { reply } => {
                self.stop_stream().await;
                self.publish_state();
                let _ = reply.send(());
            }
        }
    }

    async fn handle_call_input(&mut self, input: CallInput) {
        match input {
            CallInput::RosterChanged => self.sync_roster().await,
            CallInput::Envelope(envelope) => self.route(envelope).await,
            CallInput::ScreenEnded(ended) => {
                if let Some(call) = self.call.as_mut() {
                    call.screen_ended = None;
                }
                if ended {
                    info!("Screen capture ended outside the app");
                    self.stop_stream().await;
                }
            }
            CallInput::SubscriptionClosed => {
                warn!("Relay subscription closed, leaving voice");
                self.leave().await;
            }
        }
    }

    async fn join(&mut self, channel: ChannelKey, profile: MemberProfile) -> Result<(), VoiceError> {
        if self.call.is_some() {
            self.leave().await;
        }
        info!("Joining voice: room={}, channel={}", channel.room_id, channel.channel_id);

        let local_audio = self.deps.devices.acquire_local_audio().await.map_err(|e| {
            warn!("Failed to acquire microphone: {}", e);
            e
        })?;

        let call = match self.open_call(&channel, &profile, local_audio.clone()).await {
            Ok(call) => call,
            Err(e) => {
                error!("Failed to join {}: {}", channel, e);
                local_audio.stop_all();
                return Err(e);
            }
        };
        self.call = Some(call);

        let _ = self.event_tx.send(VoiceEvent::Joined {
            room_id: channel.room_id,
            channel_id: channel.channel_id,
        });
        self.sync_roster().await;
        Ok(())
    }

    /// Subscribe to signaling before announcing ourselves, so an offer sent in
    /// response to our presence cannot slip past us.
    async fn open_call(
        &self,
        channel: &ChannelKey,
        profile: &MemberProfile,
        local_audio: MediaStream,
    ) -> Result<ActiveCall, VoiceError> {
        let local = &self.deps.local;
        let signal_rx = self.deps.signaling.subscribe(channel).await?;
        let router = SignalingRouter::new(local.clone(), Utc::now(), self.deps.stale_signal_window_ms);

        self.deps.presence.publish_self(channel, local, profile).await?;
        let roster_rx = match self.deps.presence.subscribe(channel).await {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(retract_err) = self.deps.presence.retract_self(channel, local).await {
                    warn!("Failed to retract presence from {}: {}", channel, retract_err);
                }
                return Err(e.into());
            }
        };

        let sessions = PeerSessions::new(SessionContext {
            local: local.clone(),
            connector: self.deps.connector.clone(),
            events_tx: self.conn_tx.clone(),
            connection_ids: self.connection_ids.clone(),
        });

        Ok(ActiveCall {
            channel: channel.clone(),
            router,
            sessions,
            roster_rx,
            signal_rx,
            roster: Roster::new(),
            local_audio,
            screen: None,
            screen_ended: None,
            remote_media: HashMap::new(),
            muted: false,
            deafened: false,
        })
    }

    /// Teardown order: presence first so peers stop offering, then local
    /// tracks, then every session, then the subscriptions.
    async fn leave(&mut self) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        info!("Leaving voice: {}", call.channel);

        if let Err(e) = self.deps.presence.retract_self(&call.channel, &self.deps.local).await {
            warn!("Failed to retract presence from {}: {}", call.channel, e);
        }

        call.local_audio.stop_all();
        if let Some(screen) = call.screen.take() {
            screen.stop_all();
        }
        call.sessions.close_all().await;
        call.remote_media.clear();

        // The relay only lets go of a subscription once our receivers are gone.
        let channel = call.channel.clone();
        drop(call);
        if let Err(e) = self.deps.presence.unsubscribe(&channel).await {
            debug!("Failed to drop roster subscription for {}: {}", channel, e);
        }
        if let Err(e) = self.deps.signaling.unsubscribe(&channel).await {
            debug!("Failed to drop signal subscription for {}: {}", channel, e);
        }
        let _ = self.event_tx.send(VoiceEvent::Left {
            room_id: channel.room_id,
            channel_id: channel.channel_id,
        });
    }

    async fn sync_roster(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let roster = call.roster_rx.borrow_and_update().clone();
        let outcome = {
            let media = outbound(&call.local_audio, &call.screen);
            reconcile(&mut call.sessions, &roster, &media).await
        };
        call.roster = roster;

        for peer in outcome.closed {
            call.remote_media.remove(&peer);
            let _ = self.event_tx.send(VoiceEvent::PeerSessionClosed {
                peer_id: peer,
                reason: "left channel".to_string(),
            });
        }
        for (peer, e) in outcome.failed {
            call.remote_media.remove(&peer);
            let _ = self.event_tx.send(VoiceEvent::PeerSessionClosed {
                peer_id: peer,
                reason: e.to_string(),
            });
        }
        for peer in outcome.opened {
            let role = role_for(&self.deps.local, &peer);
            let _ = self.event_tx.send(VoiceEvent::PeerSessionOpened { peer_id: peer, role });
        }
        for offer in outcome.offers {
            send_signal(self.deps.signaling.as_ref(), &call.channel, offer).await;
        }
    }

    async fn route(&mut self, envelope: SignalingEnvelope) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let from = envelope.from.clone();
        let existed = call.sessions.contains(&from);
        let dispatched = {
            let media = outbound(&call.local_audio, &call.screen);
            call.router.dispatch(envelope, &mut call.sessions, &media).await
        };

        match dispatched {
            Dispatch::Answered(answer) => {
                if !existed {
                    let role = role_for(&self.deps.local, &from);
                    let _ = self.event_tx.send(VoiceEvent::PeerSessionOpened {
                        peer_id: from.clone(),
                        role,
                    });
                }
                send_signal(self.deps.signaling.as_ref(), &call.channel, answer).await;
            }
            Dispatch::Failed(peer, e) => {
                warn!("Negotiation with {} failed: {}", peer, e);
                call.close_peer(&peer, e.to_string(), &self.event_tx).await;
            }
            Dispatch::Dropped(violation) => {
                let _ = self.event_tx.send(VoiceEvent::SignalDropped {
                    from: from.clone(),
                    reason: violation.to_string(),
                });
            }
            Dispatch::Applied | Dispatch::Buffered(_) | Dispatch::Ignored(_) => {}
        }
        self.resume_renegotiation(&from).await;
    }

    /// Send the offer for a track change that happened while `peer`'s session
    /// was still negotiating.
    async fn resume_renegotiation(&mut self, peer: &Identity) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(session) = call.sessions.get_mut(peer) else {
            return;
        };
        match session.resume_renegotiation().await {
            Ok(Some(offer)) => {
                info!("Sending deferred renegotiation offer to {}", peer);
                let envelope = SignalingEnvelope::description(self.deps.local.clone(), peer.clone(), offer);
                send_signal(self.deps.signaling.as_ref(), &call.channel, envelope).await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Renegotiation with {} failed: {}", peer, e);
                call.close_peer(peer, e.to_string(), &self.event_tx).await;
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        let Some(call) = self.call.as_mut() else {
            debug!("Ignoring connection event from {} outside a call", event.peer_id);
            return;
        };
        let live = call.sessions.get(&event.peer_id).map(|s| s.connection_id());
        if live != Some(event.connection_id) {
            debug!(
                "Ignoring event from stale connection #{} to {}",
                event.connection_id, event.peer_id
            );
            return;
        }

        let peer = event.peer_id;
        match event.kind {
            ConnectionEventKind::Candidate(candidate) => {
                let envelope = SignalingEnvelope::candidate(self.deps.local.clone(), peer, candidate);
                send_signal(self.deps.signaling.as_ref(), &call.channel, envelope).await;
            }
            ConnectionEventKind::Track { track, stream_id } => {
                info!("Received remote {:?} track from {}", track.kind(), peer);
                if track.kind() == TrackKind::Audio && call.deafened {
                    track.set_enabled(false);
                }
                let _ = self.event_tx.send(VoiceEvent::RemoteTrack {
                    peer_id: peer.clone(),
                    track_id: track.id().to_string(),
                    kind: track.kind(),
                });
                call.remote_media
                    .entry(peer)
                    .or_insert_with(|| MediaStream::new(stream_id))
                    .add_track(track);
            }
            ConnectionEventKind::State(state) => {
                let Some(session) = call.sessions.get_mut(&peer) else {
                    return;
                };
                match session.on_transport_state(state) {
                    Transition::Connected => {
                        info!("WebRTC connected to {}", peer);
                        let _ = self.event_tx.send(VoiceEvent::PeerConnected { peer_id: peer.clone() });
                        self.resume_renegotiation(&peer).await;
                    }
                    Transition::Terminal => {
                        info!("WebRTC connection to {} ended: {:?}", peer, state);
                        call.close_peer(&peer, format!("transport {:?}", state), &self.event_tx)
                            .await;
                    }
                    Transition::None => {
                        debug!("WebRTC connection to {} state: {:?}", peer, state);
                    }
                }
            }
        }
    }

    async fn toggle_mute(&mut self) -> bool {
        let Some(call) = self.call.as_mut() else {
            warn!("Cannot toggle mute: not in voice channel");
            return false;
        };
        call.muted = !call.muted;
        for track in call.local_audio.audio_tracks() {
            track.set_enabled(!call.muted);
        }
        info!("Mute set to {}", call.muted);

        let flags = VoiceFlags {
            muted: Some(call.muted),
            ..Default::default()
        };
        send_flags(self.deps.presence.as_ref(), &call.channel, &self.deps.local, flags).await;
        let _ = self.event_tx.send(VoiceEvent::MuteChanged { muted: call.muted });
        call.muted
    }

    async fn toggle_deafen(&mut self) -> bool {
        let Some(call) = self.call.as_mut() else {
            warn!("Cannot toggle deafen: not in voice channel");
            return false;
        };
        call.deafened = !call.deafened;
        for stream in call.remote_media.values() {
            for track in stream.audio_tracks() {
                track.set_enabled(!call.deafened);
            }
        }
        info!("Deafen set to {}", call.deafened);

        let flags = VoiceFlags {
            deafened: Some(call.deafened),
            ..Default::default()
        };
        send_flags(self.deps.presence.as_ref(), &call.channel, &self.deps.local, flags).await;
        let _ = self.event_tx.send(VoiceEvent::DeafenChanged {
            deafened: call.deafened,
        });
        call.deafened
    }

    /// Share the screen with every peer. A second call while sharing does nothing.
    async fn start_stream(&mut self) -> Result<(), VoiceError> {
        let Some(call) = self.call.as_mut() else {
            warn!("Cannot start screen share: not in voice channel");
            return Ok(());
        };
        if call.screen.is_some() {
            info!("Screen sharing already active");
            return Ok(());
        }

        let capture = self.deps.devices.acquire_display_media().await.map_err(|e| {
            warn!("Failed to start screen capture: {}", e);
            e
        })?;
        let screen = capture.stream;

        let mut offers = Vec::new();
        let mut failed = Vec::new();
        for peer in call.sessions.ids() {
            let Some(session) = call.sessions.get_mut(&peer) else {
                continue;
            };
            let result = match session.attach(&screen).await {
                Ok(()) => session.renegotiate().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(offer)) => offers.push(SignalingEnvelope::description(
                    self.deps.local.clone(),
                    peer,
                    offer,
                )),
                Ok(None) => {}
                Err(e) => failed.push((peer, e)),
            }
        }

        call.screen = Some(screen);
        call.screen_ended = capture.ended;
        info!("Screen sharing started");

        self.finish_track_change(offers, failed, true).await;
        Ok(())
    }

    async fn stop_stream(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(screen) = call.screen.take() else {
            return;
        };
        call.screen_ended = None;
        screen.stop_all();

        let mut offers = Vec::new();
        let mut failed = Vec::new();
        for peer in call.sessions.ids() {
            let Some(session) = call.sessions.get_mut(&peer) else {
                continue;
            };
            let result = match session.detach(&screen).await {
                Ok(()) => session.renegotiate().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(Some(offer)) => offers.push(SignalingEnvelope::description(
                    self.deps.local.clone(),
                    peer,
                    offer,
                )),
                Ok(None) => {}
                Err(e) => failed.push((peer, e)),
            }
        }
        info!("Screen sharing stopped");

        self.finish_track_change(offers, failed, false).await;
    }

    /// Close sessions that failed while the track set changed, publish the
    /// renegotiation offers, and announce the new streaming flag.
    async fn finish_track_change(
        &mut self,
        offers: Vec<SignalingEnvelope>,
        failed: Vec<(Identity, TransportError)>,
        streaming: bool,
    ) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        for (peer, e) in failed {
            warn!("Renegotiation with {} failed: {}", peer, e);
            call.close_peer(&peer, e.to_string(), &self.event_tx).await;
        }
        for offer in offers {
            send_signal(self.deps.signaling.as_ref(), &call.channel, offer).await;
        }

        let flags = VoiceFlags {
            streaming: Some(streaming),
            ..Default::default()
        };
        send_flags(self.deps.presence.as_ref(), &call.channel, &self.deps.local, flags).await;
        let _ = self.event_tx.send(VoiceEvent::StreamingChanged { streaming });
    }

    fn publish_state(&self) {
        let state = match &self.call {
            None => VoiceState::default(),
            Some(call) => {
                let mut peers: Vec<PeerStatus> = call
                    .sessions
                    .iter()
                    .map(|s| PeerStatus {
                        peer_id: s.peer_id().clone(),
                        state: s.state(),
                        role: s.role(),
                        remote_tracks: call
                            .remote_media
                            .get(s.peer_id())
                            .map(|m| m.tracks().len())
                            .unwrap_or(0),
                    })
                    .collect();
                peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

                VoiceState {
                    in_voice: true,
                    room_id: Some(call.channel.room_id.clone()),
                    channel_id: Some(call.channel.channel_id.clone()),
                    muted: call.muted,
                    deafened: call.deafened,
                    streaming: call.screen.is_some(),
                    peers,
                    members: call.roster.clone(),
                }
            }
        };
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
