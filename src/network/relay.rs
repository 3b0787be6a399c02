//! Websocket relay that serves presence and signaling to `RelayClient`s.
//!
//! Each socket gets a connection id. Roster entries remember which
//! connection published them and vanish when that socket goes away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{ChannelKey, Identity, Roster, RosterEntry, SignalingEnvelope};

use super::{ClientFrame, ServerFrame};

type Outbox = mpsc::UnboundedSender<ServerFrame>;

#[derive(Default)]
struct HubChannel {
    roster: Roster,
    owners: HashMap<Identity, Uuid>,
    roster_subs: HashMap<Uuid, Outbox>,
    signal_subs: HashMap<Uuid, Outbox>,
}

impl HubChannel {
    fn broadcast_roster(&mut self, channel: &ChannelKey) {
        let frame = ServerFrame::Roster {
            channel: channel.clone(),
            roster: self.roster.clone(),
        };
        self.roster_subs.retain(|_, tx| tx.send(frame.clone()).is_ok());
    }

    fn is_idle(&self) -> bool {
        self.roster.is_empty() && self.roster_subs.is_empty() && self.signal_subs.is_empty()
    }
}

/// Shared relay state. Cloning shares the same hub.
#[derive(Clone, Default)]
pub struct RelayHub {
    channels: Arc<RwLock<HashMap<ChannelKey, HubChannel>>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn roster(&self, channel: &ChannelKey) -> Roster {
        let guard = self.channels.read().await;
        guard.get(channel).map(|c| c.roster.clone()).unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    async fn apply(&self, conn: Uuid, outbox: &Outbox, frame: ClientFrame) {
        let mut guard = self.channels.write().await;
        match frame {
            ClientFrame::SubscribeRoster { channel } => {
                let entry = guard.entry(channel.clone()).or_default();
                let _ = outbox.send(ServerFrame::Roster {
                    channel,
                    roster: entry.roster.clone(),
                });
                entry.roster_subs.insert(conn, outbox.clone());
            }
            ClientFrame::SubscribeSignals { channel } => {
                guard.entry(channel).or_default().signal_subs.insert(conn, outbox.clone());
            }
            ClientFrame::UnsubscribeRoster { channel } => {
                if let Some(entry) = guard.get_mut(&channel) {
                    entry.roster_subs.remove(&conn);
                }
                prune(&mut guard, &channel);
            }
            ClientFrame::UnsubscribeSignals { channel } => {
                if let Some(entry) = guard.get_mut(&channel) {
                    entry.signal_subs.remove(&conn);
                }
                prune(&mut guard, &channel);
            }
            ClientFrame::PublishPresence {
                channel,
                member,
                profile,
            } => {
                let entry = guard.entry(channel.clone()).or_default();
                entry.roster.insert(member.clone(), RosterEntry::new(profile));
                entry.owners.insert(member.clone(), conn);
                entry.broadcast_roster(&channel);
                info!("{} joined {}", member, channel);
            }
            ClientFrame::UpdatePresence { channel, member, flags } => {
                if let Some(entry) = guard.get_mut(&channel) {
                    if let Some(record) = entry.roster.get_mut(&member) {
                        record.apply(&flags);
                        entry.broadcast_roster(&channel);
                    }
                }
            }
            ClientFrame::RetractPresence { channel, member } => {
                if let Some(entry) = guard.get_mut(&channel) {
                    entry.owners.remove(&member);
                    if entry.roster.remove(&member).is_some() {
                        entry.broadcast_roster(&channel);
                        info!("{} left {}", member, channel);
                    }
                }
                prune(&mut guard, &channel);
            }
            ClientFrame::Signal { channel, envelope } => {
                if let Some(entry) = guard.get_mut(&channel) {
                    relay_signal(entry, &channel, envelope);
                }
            }
        }
    }

    /// Forget everything a closed socket owned.
    async fn release(&self, conn: Uuid) {
        let mut guard = self.channels.write().await;
        for (channel, entry) in guard.iter_mut() {
            entry.roster_subs.remove(&conn);
            entry.signal_subs.remove(&conn);

            let owned: Vec<Identity> = entry
                .owners
                .iter()
                .filter(|(_, owner)| **owner == conn)
                .map(|(member, _)| member.clone())
                .collect();
            if owned.is_empty() {
                continue;
            }
            for member in &owned {
                entry.owners.remove(member);
                entry.roster.remove(member);
                info!("{} dropped from {} (connection lost)", member, channel);
            }
            entry.broadcast_roster(channel);
        }
        guard.retain(|_, entry| !entry.is_idle());
    }
}

fn prune(channels: &mut HashMap<ChannelKey, HubChannel>, channel: &ChannelKey) {
    if channels.get(channel).is_some_and(HubChannel::is_idle) {
        channels.remove(channel);
        debug!("Dropped idle channel {}", channel);
    }
}

fn relay_signal(entry: &mut HubChannel, channel: &ChannelKey, envelope: SignalingEnvelope) {
    debug!(
        "Relaying {:?} {} -> {} on {}",
        envelope.kind, envelope.from, envelope.to, channel
    );
    let frame = ServerFrame::Signal {
        channel: channel.clone(),
        envelope,
    };
    entry.signal_subs.retain(|_, tx| tx.send(frame.clone()).is_ok());
}

pub fn relay_router(hub: RelayHub) -> Router {
    Router::new().route("/relay", get(upgrade)).with_state(hub)
}

async fn upgrade(ws: WebSocketUpgrade, State(hub): State<RelayHub>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: RelayHub) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let conn = Uuid::new_v4();
    debug!("Relay client {} connected", conn);

    loop {
        tokio::select! {
            biased;
            Some(frame) = rx.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => hub.apply(conn, &tx, frame).await,
                        Err(e) => {
                            warn!("Relay client {} sent a bad frame: {}", conn, e);
                            let error = ServerFrame::Error { message: e.to_string() };
                            if send_frame(&mut sender, &error).await.is_err() {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.release(conn).await;
    debug!("Relay client {} disconnected", conn);
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            warn!("Failed to serialize relay frame: {}", e);
            Ok(())
        }
    }
}

/// Serve the relay on an already bound listener.
pub async fn serve_relay(listener: TcpListener, hub: RelayHub) -> std::io::Result<()> {
    axum::serve(listener, relay_router(hub)).await
}

pub async fn run_relay(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on ws://{}/relay", addr);
    serve_relay(listener, RelayHub::new()).await
}
