use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::events::{EventReceiver, VoiceEvent};
use crate::media::VoiceState;
use crate::state::ServiceContext;

/// What a control client receives: a state snapshot on connect and after
/// every change, interleaved with engine events.
#[derive(Serialize)]
#[serde(untagged)]
enum Outgoing<'a> {
    Event(&'a VoiceEvent),
    State {
        #[serde(rename = "type")]
        kind: &'static str,
        data: &'a VoiceState,
    },
}

impl<'a> Outgoing<'a> {
    fn state(data: &'a VoiceState) -> Self {
        Outgoing::State { kind: "State", data }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServiceContext>,
) -> impl IntoResponse {
    let event_rx = ctx.event_tx.subscribe();
    let state_rx = ctx.voice.state_rx.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, event_rx, state_rx))
}

async fn send(socket: &mut WebSocket, frame: Outgoing<'_>) -> bool {
    match serde_json::to_string(&frame) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            true
        }
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    mut event_rx: EventReceiver,
    mut state_rx: watch::Receiver<VoiceState>,
) {
    debug!("WebSocket client connected");

    let snapshot = state_rx.borrow_and_update().clone();
    if !send(&mut socket, Outgoing::state(&snapshot)).await {
        return;
    }

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send(&mut socket, Outgoing::Event(&event)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state_rx.borrow_and_update().clone();
                if !send(&mut socket, Outgoing::state(&snapshot)).await {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}
