//! `webrtc` crate implementations of the media seams.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as WrtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::error::{DeviceError, TransportError};
use crate::models::{Identity, NetworkCandidate, SdpKind, SessionDescription};

use super::connection::{
    ConnectionEvents, ConnectionFactory, ConnectionState, DisplayCapture, MediaConnection,
    MediaDevices, MediaStream, MediaTrack, TrackKind,
};

/// A local track fed by the application through [`LocalSampleTrack::write_sample`].
/// Samples written while disabled or after stop are discarded.
pub struct LocalSampleTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalSampleTrack {
    pub fn opus(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            id.into(),
            stream_id.into(),
        )
    }

    pub fn vp8(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.into(),
            stream_id.into(),
        )
    }

    fn new(kind: TrackKind, codec: RTCRtpCodecCapability, id: String, stream_id: String) -> Self {
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(codec, id, stream_id)),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), webrtc::Error> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.track.write_sample(sample).await
    }
}

impl fmt::Debug for LocalSampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSampleTrack")
            .field("id", &self.track.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl MediaTrack for LocalSampleTrack {
    fn id(&self) -> &str {
        self.track.id()
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

/// A track received from a peer. Readers should skip packets while disabled.
pub struct RemoteMediaTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackRemote>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RemoteMediaTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        Self {
            id: track.id(),
            kind,
            track,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> Arc<TrackRemote> {
        self.track.clone()
    }
}

impl fmt::Debug for RemoteMediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl MediaTrack for RemoteMediaTrack {
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

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::Negotiation(format!("Failed to parse SDP: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Negotiation(format!("Unexpected SDP type {}", other))),
    }
}

/// An `RTCPeerConnection` to a single peer.
pub struct WebRtcConnection {
    peer: Identity,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn add_track(&self, track: Arc<dyn MediaTrack>, stream_id: &str) -> Result<(), TransportError> {
        let local = track
            .as_any()
            .downcast_ref::<LocalSampleTrack>()
            .ok_or_else(|| TransportError::Track(format!("{} is not a local sample track", track.id())))?;

        let rtp_sender = self
            .pc
            .add_track(local.inner() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(format!("Failed to add track: {}", e)))?;

        // Read incoming RTCP packets (needed by webrtc crate for proper operation)
        let reader = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.insert(track.id().to_string(), rtp_sender);
        debug!("Added {:?} track {} ({}) for {}", track.kind(), track.id(), stream_id, self.peer);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        let Some(sender) = self.senders.lock().await.remove(track_id) else {
            return Ok(());
        };
        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| TransportError::Track(format!("Failed to remove track: {}", e)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_candidate(&self, candidate: NetworkCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.senders.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Setup(format!("Failed to close peer connection: {}", e)))
    }
}

/// Builds `RTCPeerConnection`s with default codecs and interceptors.
pub struct WebRtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[IceServerConfig]) -> Result<Self, TransportError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::Setup(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnector {
    async fn connect(
        &self,
        peer: &Identity,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.config.clone())
                .await
                .map_err(|e| TransportError::Setup(format!("Failed to create peer connection: {}", e)))?,
        );

        // Connection state change
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                info!("WebRTC connection to {} state: {}", events.peer_id(), state);
                events.state(map_state(state));
            })
        }));

        // On track (remote audio or screen)
        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let stream_id = track.stream_id();
                let remote = Arc::new(RemoteMediaTrack::new(track));
                events.track(remote, stream_id);
            })
        }));

        // ICE candidate gathering
        let ice_events = events;
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = ice_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.candidate(NetworkCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }),
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        info!("Created WebRTC peer connection for {}", peer);
        Ok(Arc::new(WebRtcConnection {
            peer: peer.clone(),
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// Hands out sample-fed tracks. Whatever captures the microphone or screen
/// writes into [`WebRtcDevices::current_audio`] / [`WebRtcDevices::current_display`].
#[derive(Default)]
pub struct WebRtcDevices {
    counter: AtomicU32,
    audio: Mutex<Option<Arc<LocalSampleTrack>>>,
    display: Mutex<Option<(Arc<LocalSampleTrack>, oneshot::Sender<()>)>>,
}

impl WebRtcDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current_audio(&self) -> Option<Arc<LocalSampleTrack>> {
        self.audio.lock().await.clone()
    }

    pub async fn current_display(&self) -> Option<Arc<LocalSampleTrack>> {
        self.display.lock().await.as_ref().map(|(track, _)| track.clone())
    }

    /// Report that the screen capture ended on its own.
    pub async fn end_display(&self) {
        if let Some((track, ended)) = self.display.lock().await.take() {
            track.stop();
            let _ = ended.send(());
        }
    }
}

#[async_trait]
impl MediaDevices for WebRtcDevices {
    async fn acquire_local_audio(&self) -> Result<MediaStream, DeviceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let stream_id = format!("voicemesh-voice-{n}");
        let track = Arc::new(LocalSampleTrack::opus(format!("audio-{n}"), stream_id.clone()));
        *self.audio.lock().await = Some(track.clone());
        Ok(MediaStream::with_tracks(stream_id, vec![track as Arc<dyn MediaTrack>]))
    }

    async fn acquire_display_media(&self) -> Result<DisplayCapture, DeviceError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let stream_id = format!("voicemesh-screen-{n}");
        let track = Arc::new(LocalSampleTrack::vp8(format!("screen-{n}"), stream_id.clone()));
        let (tx, rx) = oneshot::channel();
        *self.display.lock().await = Some((track.clone(), tx));
        Ok(DisplayCapture {
            stream: MediaStream::with_tracks(stream_id, vec![track as Arc<dyn MediaTrack>]),
            ended: Some(rx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_convert_both_ways() {
        let rtc = to_rtc(SessionDescription::answer("v=0\r\n")).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc(rtc).unwrap(), SessionDescription::answer("v=0\r\n"));
    }

    #[test]
    fn connection_states_map() {
        assert_eq!(map_state(RTCPeerConnectionState::Connected), ConnectionState::Connected);
        assert_eq!(map_state(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), ConnectionState::New);
    }

    #[tokio::test]
    async fn disabled_track_drops_samples() {
        let track = LocalSampleTrack::opus("audio-0", "s");
        track.set_enabled(false);
        let sample = Sample {
            data: vec![0u8; 10].into(),
            duration: std::time::Duration::from_millis(20),
            ..Default::default()
        };
        assert!(track.write_sample(&sample).await.is_ok());
        assert_eq!(MediaTrack::id(&track), "audio-0");
    }

    #[tokio::test]
    async fn devices_issue_kind_specific_tracks() {
        let devices = WebRtcDevices::new();
        let audio = devices.acquire_local_audio().await.unwrap();
        assert_eq!(audio.tracks()[0].kind(), TrackKind::Audio);

        let display = devices.acquire_display_media().await.unwrap();
        assert_eq!(display.stream.tracks()[0].kind(), TrackKind::Video);

        devices.end_display().await;
        assert!(display.ended.unwrap().await.is_ok());
        assert!(display.stream.tracks()[0].is_stopped());
    }

    #[tokio::test]
    async fn connector_builds_connection_and_offer() {
        let connector = WebRtcConnector::new(&[]).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let events = ConnectionEvents::new("bob".into(), 1, tx);
        let conn = connector.connect(&"bob".into(), events).await.unwrap();

        let devices = WebRtcDevices::new();
        let audio = devices.acquire_local_audio().await.unwrap();
        conn.add_track(audio.tracks()[0].clone(), audio.id()).await.unwrap();

        let offer = conn.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("opus"));
        conn.close().await.unwrap();
    }
}
