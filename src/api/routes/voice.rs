use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;

use crate::error::VoiceError;
use crate::media::VoiceState;
use crate::models::{ChannelKey, MemberProfile};
use crate::state::ServiceContext;

fn voice_error(action: &str, e: VoiceError) -> (StatusCode, String) {
    let status = match e {
        VoiceError::Device(_) => StatusCode::UNPROCESSABLE_ENTITY,
        VoiceError::Relay(_) => StatusCode::BAD_GATEWAY,
        VoiceError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, format!("Failed to {}: {}", action, e))
}

#[derive(Deserialize)]
pub struct JoinVoiceRequest {
    pub room_id: String,
    pub channel_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

pub async fn join_voice(
    State(ctx): State<ServiceContext>,
    Json(body): Json<JoinVoiceRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let profile = MemberProfile {
        display_name: body.display_name.unwrap_or(ctx.profile.display_name),
        avatar_url: body.avatar_url.or(ctx.profile.avatar_url),
    };
    ctx.voice
        .join_channel(ChannelKey::new(body.room_id, body.channel_id), profile)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| voice_error("join voice", e))
}

pub async fn leave_voice(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.voice
        .leave_channel()
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| voice_error("leave voice", e))
}

pub async fn toggle_mute(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.voice
        .toggle_mute()
        .await
        .map(|muted| Json(serde_json::json!({"muted": muted})))
        .map_err(|e| voice_error("toggle mute", e))
}

pub async fn toggle_deafen(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.voice
        .toggle_deafen()
        .await
        .map(|deafened| Json(serde_json::json!({"deafened": deafened})))
        .map_err(|e| voice_error("toggle deafen", e))
}

pub async fn start_screen_share(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.voice
        .start_stream()
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| voice_error("start screen share", e))
}

pub async fn stop_screen_share(
    State(ctx): State<ServiceContext>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    ctx.voice
        .stop_stream()
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| voice_error("stop screen share", e))
}

pub async fn get_voice_state(State(ctx): State<ServiceContext>) -> Json<VoiceState> {
    Json(ctx.voice.state())
}
