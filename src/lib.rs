mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod network;
mod state;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::StartupError;
use crate::events::create_event_bus;
use crate::media::engine::{spawn_voice_engine, EngineDeps};
use crate::media::rtc::{WebRtcConnector, WebRtcDevices};
use crate::models::{Identity, MemberProfile};
use crate::network::client::RelayClient;
use crate::state::ServiceContext;

/// Identity from config, or a fresh random one for this process.
fn resolve_identity(config: &AppConfig) -> Identity {
    match &config.identity {
        Some(id) => Identity::from(id.as_str()),
        None => Identity::new(format!("node-{:08x}", rand::random::<u32>())),
    }
}

fn build_service_context(config: &AppConfig, relay: RelayClient, connector: WebRtcConnector) -> ServiceContext {
    let identity = resolve_identity(config);
    info!("My identity: {}", identity);

    let profile = MemberProfile {
        display_name: config
            .display_name
            .clone()
            .unwrap_or_else(|| identity.as_str().to_string()),
        avatar_url: config.avatar_url.clone(),
    };

    let (event_tx, _event_rx) = create_event_bus(config.voice.event_buffer);
    let relay = Arc::new(relay);
    let voice = spawn_voice_engine(
        EngineDeps {
            local: identity.clone(),
            presence: relay.clone(),
            signaling: relay,
            devices: Arc::new(WebRtcDevices::new()),
            connector: Arc::new(connector),
            stale_signal_window_ms: config.voice.stale_signal_window_ms,
        },
        config.voice.command_buffer,
        event_tx.clone(),
    );

    ServiceContext {
        identity,
        profile,
        voice,
        event_tx,
    }
}

/// Run a voice node: relay connection, WebRTC engine and the control API.
/// Leaves the current channel on Ctrl-C before returning.
pub async fn run_node(config: AppConfig) -> Result<(), StartupError> {
    tracing_subscriber::fmt::init();

    let relay = RelayClient::connect(&config.relay_url).await?;
    let connector = WebRtcConnector::new(&config.voice.ice_servers)?;
    let ctx = build_service_context(&config, relay, connector);

    let voice = ctx.voice.clone();
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    };

    api::server::start_api_server(ctx, config.api_port, shutdown).await?;

    if let Err(e) = voice.leave_channel().await {
        warn!("Failed to leave voice on shutdown: {}", e);
    }
    Ok(())
}

/// Run the presence/signaling relay server.
pub async fn run_relay(port: u16) -> Result<(), StartupError> {
    tracing_subscriber::fmt::init();
    network::relay::run_relay(port).await?;
    Ok(())
}
