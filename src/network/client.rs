use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::models::{ChannelKey, Identity, MemberProfile, Roster, SignalingEnvelope, VoiceFlags};

use super::{ClientFrame, PresenceChannel, ServerFrame, SignalingBus};

#[derive(Default)]
struct Routes {
    rosters: HashMap<ChannelKey, watch::Sender<Roster>>,
    signals: HashMap<ChannelKey, Vec<mpsc::UnboundedSender<SignalingEnvelope>>>,
    closed: bool,
}

impl Routes {
    /// Hand a frame to local subscribers. Returns the unsubscribe frame to
    /// send when the last local receiver for the channel is gone.
    fn deliver(&mut self, frame: ServerFrame) -> Option<ClientFrame> {
        match frame {
            ServerFrame::Roster { channel, roster } => {
                let tx = self.rosters.get(&channel)?;
                if tx.receiver_count() > 0 {
                    tx.send_replace(roster);
                    return None;
                }
                self.release_roster(&channel)
            }
            ServerFrame::Signal { channel, envelope } => {
                let subs = self.signals.get_mut(&channel)?;
                subs.retain(|tx| tx.send(envelope.clone()).is_ok());
                self.release_signals(&channel)
            }
            ServerFrame::Error { message } => {
                warn!("Relay rejected a frame: {}", message);
                None
            }
        }
    }

    fn release_roster(&mut self, channel: &ChannelKey) -> Option<ClientFrame> {
        if self.rosters.get(channel)?.receiver_count() > 0 {
            return None;
        }
        self.rosters.remove(channel);
        debug!("Unsubscribed from roster of {}", channel);
        Some(ClientFrame::UnsubscribeRoster {
            channel: channel.clone(),
        })
    }

    fn release_signals(&mut self, channel: &ChannelKey) -> Option<ClientFrame> {
        let subs = self.signals.get_mut(channel)?;
        subs.retain(|tx| !tx.is_closed());
        if !subs.is_empty() {
            return None;
        }
        self.signals.remove(channel);
        debug!("Unsubscribed from signals of {}", channel);
        Some(ClientFrame::UnsubscribeSignals {
            channel: channel.clone(),
        })
    }

    /// Dropping every sender ends all subscriptions.
    fn close(&mut self) {
        self.closed = true;
        self.rosters.clear();
        self.signals.clear();
    }
}

/// Presence and signaling over one websocket to a relay server.
/// Cloning shares the connection.
#[derive(Clone)]
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    routes: Arc<Mutex<Routes>>,
}

impl RelayClient {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| RelayError::Transport(format!("Failed to connect to {}: {}", url, e)))?;
        info!("Connected to relay at {}", url);

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let routes = Arc::new(Mutex::new(Routes::default()));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize relay frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                    warn!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_routes = routes.clone();
        // Weak, so dropping every client still shuts the writer down.
        let reader_outbound = outbound.downgrade();
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            let release = reader_routes.lock().await.deliver(frame);
                            if let (Some(frame), Some(tx)) = (release, reader_outbound.upgrade()) {
                                let _ = tx.send(frame);
                            }
                        }
                        Err(e) => warn!("Unparseable relay frame: {}", e),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            reader_routes.lock().await.close();
            info!("Relay connection closed");
        });

        Ok(Self { outbound, routes })
    }

    pub async fn is_closed(&self) -> bool {
        self.routes.lock().await.closed
    }

    fn send(&self, frame: ClientFrame) -> Result<(), RelayError> {
        self.outbound.send(frame).map_err(|_| RelayError::Closed)
    }
}

#[async_trait]
impl PresenceChannel for RelayClient {
    async fn subscribe(&self, channel: &ChannelKey) -> Result<watch::Receiver<Roster>, RelayError> {
        let mut routes = self.routes.lock().await;
        if routes.closed {
            return Err(RelayError::Closed);
        }
        if let Some(tx) = routes.rosters.get(channel) {
            return Ok(tx.subscribe());
        }
        let (tx, rx) = watch::channel(Roster::new());
        routes.rosters.insert(channel.clone(), tx);
        self.send(ClientFrame::SubscribeRoster {
            channel: channel.clone(),
        })?;
        debug!("Subscribed to roster of {}", channel);
        Ok(rx)
    }

    async fn publish_self(
        &self,
        channel: &ChannelKey,
        member: &Identity,
        profile: &MemberProfile,
    ) -> Result<(), RelayError> {
        self.send(ClientFrame::PublishPresence {
            channel: channel.clone(),
            member: member.clone(),
            profile: profile.clone(),
        })
    }

    async fn update_self(
        &self,
        channel: &ChannelKey,
        member: &Identity,
        flags: &VoiceFlags,
    ) -> Result<(), RelayError> {
        self.send(ClientFrame::UpdatePresence {
            channel: channel.clone(),
            member: member.clone(),
            flags: flags.clone(),
        })
    }

    async fn retract_self(&self, channel: &ChannelKey, member: &Identity) -> Result<(), RelayError> {
        self.send(ClientFrame::RetractPresence {
            channel: channel.clone(),
            member: member.clone(),
        })
    }

    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), RelayError> {
        let release = self.routes.lock().await.release_roster(channel);
        match release {
            Some(frame) => self.send(frame),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SignalingBus for RelayClient {
    async fn subscribe(
        &self,
        channel: &ChannelKey,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEnvelope>, RelayError> {
        let mut routes = self.routes.lock().await;
        if routes.closed {
            return Err(RelayError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let first = !routes.signals.contains_key(channel);
        routes.signals.entry(channel.clone()).or_default().push(tx);
        if first {
            self.send(ClientFrame::SubscribeSignals {
                channel: channel.clone(),
            })?;
            debug!("Subscribed to signals of {}", channel);
        }
        Ok(rx)
    }

    async fn publish(&self, channel: &ChannelKey, envelope: SignalingEnvelope) -> Result<(), RelayError> {
        self.send(ClientFrame::Signal {
            channel: channel.clone(),
            envelope,
        })
    }

    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), RelayError> {
        let release = self.routes.lock().await.release_signals(channel);
        match release {
            Some(frame) => self.send(frame),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::models::NetworkCandidate;
    use crate::network::relay::{serve_relay, RelayHub};

    async fn start_relay() -> (String, RelayHub) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = RelayHub::new();
        tokio::spawn(serve_relay(listener, hub.clone()));
        (format!("ws://{}/relay", addr), hub)
    }

    fn profile(name: &str) -> MemberProfile {
        MemberProfile {
            display_name: name.into(),
            avatar_url: None,
        }
    }

    async fn wait_for_roster(rx: &mut watch::Receiver<Roster>, pred: impl Fn(&Roster) -> bool) -> Roster {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|r| pred(r)))
            .await
            .expect("timed out waiting for roster")
            .expect("roster subscription closed")
            .clone()
    }

    #[tokio::test]
    async fn presence_and_signals_cross_the_relay() {
        let (url, _hub) = start_relay().await;
        let alice = RelayClient::connect(&url).await.unwrap();
        let bob = RelayClient::connect(&url).await.unwrap();
        let channel = ChannelKey::new("room", "voice");

        let mut bob_roster = PresenceChannel::subscribe(&bob, &channel).await.unwrap();
        let mut bob_signals = SignalingBus::subscribe(&bob, &channel).await.unwrap();
        // Give the relay a moment to register bob before alice publishes.
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice
            .publish_self(&channel, &"alice".into(), &profile("Alice"))
            .await
            .unwrap();
        let roster = wait_for_roster(&mut bob_roster, |r| r.contains_key(&Identity::from("alice"))).await;
        assert_eq!(roster[&Identity::from("alice")].display_name, "Alice");

        let envelope = SignalingEnvelope::candidate("alice".into(), "bob".into(), NetworkCandidate::new("c1"));
        alice.publish(&channel, envelope.clone()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), bob_signals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, envelope);
    }

    #[tokio::test]
    async fn dropped_client_disappears_from_roster() {
        let (url, _hub) = start_relay().await;
        let observer = RelayClient::connect(&url).await.unwrap();
        let channel = ChannelKey::new("room", "voice");
        let mut roster_rx = PresenceChannel::subscribe(&observer, &channel).await.unwrap();

        {
            let leaver = RelayClient::connect(&url).await.unwrap();
            leaver
                .publish_self(&channel, &"leaver".into(), &profile("Leaver"))
                .await
                .unwrap();
            wait_for_roster(&mut roster_rx, |r| r.contains_key(&Identity::from("leaver"))).await;
        }

        let roster = wait_for_roster(&mut roster_rx, |r| r.is_empty()).await;
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_releases_the_relay_channel() {
        let (url, hub) = start_relay().await;
        let client = RelayClient::connect(&url).await.unwrap();
        let channel = ChannelKey::new("room", "voice");

        let roster_rx = PresenceChannel::subscribe(&client, &channel).await.unwrap();
        let signal_rx = SignalingBus::subscribe(&client, &channel).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.channel_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay never saw the subscriptions");

        // A live receiver keeps the subscription.
        PresenceChannel::unsubscribe(&client, &channel).await.unwrap();
        assert!(client.routes.lock().await.rosters.contains_key(&channel));

        drop(roster_rx);
        drop(signal_rx);
        PresenceChannel::unsubscribe(&client, &channel).await.unwrap();
        SignalingBus::unsubscribe(&client, &channel).await.unwrap();
        {
            let routes = client.routes.lock().await;
            assert!(routes.rosters.is_empty());
            assert!(routes.signals.is_empty());
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.channel_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("relay kept the idle channel");
    }

    #[test]
    fn dropped_signal_receiver_is_released_on_next_delivery() {
        let mut routes = Routes::default();
        let channel = ChannelKey::new("room", "voice");
        let (tx, rx) = mpsc::unbounded_channel();
        routes.signals.insert(channel.clone(), vec![tx]);
        drop(rx);

        let envelope = SignalingEnvelope::candidate("a".into(), "b".into(), NetworkCandidate::new("c1"));
        let release = routes.deliver(ServerFrame::Signal {
            channel: channel.clone(),
            envelope,
        });
        assert_eq!(release, Some(ClientFrame::UnsubscribeSignals { channel }));
        assert!(routes.signals.is_empty());
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = RelayClient::connect(&format!("ws://{}/relay", addr))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
