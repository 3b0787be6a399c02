use std::future::Future;

use axum::{routing::{get, post}, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::state::ServiceContext;

pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        .route("/api/v1/voice/join", post(routes::voice::join_voice))
        .route("/api/v1/voice/leave", post(routes::voice::leave_voice))
        .route("/api/v1/voice/mute/toggle", post(routes::voice::toggle_mute))
        .route("/api/v1/voice/deafen/toggle", post(routes::voice::toggle_deafen))
        .route("/api/v1/voice/screen/start", post(routes::voice::start_screen_share))
        .route("/api/v1/voice/screen/stop", post(routes::voice::stop_screen_share))
        .route("/api/v1/voice/state", get(routes::voice::get_voice_state))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve the control API on localhost until `shutdown` resolves.
pub async fn start_api_server(
    ctx: ServiceContext,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = build_router(ctx);
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}
