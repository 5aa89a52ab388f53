use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::rooms::membership;
use crate::rooms::registry::CreateRoomParams;
use crate::rooms::room::{DiscordSession, Rating, Room, RoomStatus};
use crate::rooms::status::{self, SessionProjection};
use crate::state::AppState;
use crate::sync::protocol::ServerMessage;
use crate::ws::broadcast;

fn session_url(state: &AppState, room_id: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => format!(
            "{}/?room={}&token={}",
            state.config.public_url, room_id, token
        ),
        None => format!("{}/?room={}", state.config.public_url, room_id),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSessionRequest {
    pub title: String,
    pub movie_name: String,
    #[serde(default)]
    pub movie_info: Option<serde_json::Value>,
    #[serde(default)]
    pub selected_episode: Option<String>,
    pub discord_session: DiscordSession,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSessionResponse {
    pub room_id: String,
    pub host_token: String,
    pub url: String,
}

/// POST /api/discord-session — bot-initiated room creation. The host's
/// member token is minted here and handed back for the invite link.
pub async fn create_discord_session(
    State(state): State<AppState>,
    Json(req): Json<DiscordSessionRequest>,
) -> ApiResult<Json<DiscordSessionResponse>> {
    if req.title.trim().is_empty() || req.movie_name.trim().is_empty() {
        return Err(ApiError::validation("title and movieName are required"));
    }

    let host_name = req
        .discord_session
        .host_username
        .clone()
        .unwrap_or_else(|| "Host".to_string());
    let host_discord_id = req.discord_session.host_discord_id.clone();

    let room = state.rooms.create(CreateRoomParams {
        title: req.title,
        movie_name: req.movie_name,
        movie_info: req.movie_info,
        selected_episode: req.selected_episode,
        discord: Some(req.discord_session),
        host_id: String::new(),
    })?;

    let host_token = membership::generate_user_token(&room, &host_discord_id, &host_name)?;
    let url = session_url(&state, &room.id, Some(&host_token));

    Ok(Json(DiscordSessionResponse {
        room_id: room.id.clone(),
        host_token,
        url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSessionRequest {
    pub title: String,
    pub movie_name: String,
    #[serde(default)]
    pub movie_info: Option<serde_json::Value>,
    #[serde(default)]
    pub selected_episode: Option<String>,
    pub host_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSessionResponse {
    pub room_id: String,
    pub url: String,
}

/// POST /api/session — local (non-bot) room creation authorized by a
/// caller-chosen host id instead of tokens.
pub async fn create_local_session(
    State(state): State<AppState>,
    Json(req): Json<LocalSessionRequest>,
) -> ApiResult<Json<LocalSessionResponse>> {
    if req.movie_name.trim().is_empty() || req.host_id.trim().is_empty() {
        return Err(ApiError::validation("movieName and hostId are required"));
    }

    let room = state.rooms.create(CreateRoomParams {
        title: req.title,
        movie_name: req.movie_name,
        movie_info: req.movie_info,
        selected_episode: req.selected_episode,
        discord: None,
        host_id: req.host_id,
    })?;

    let url = session_url(&state, &room.id, None);
    Ok(Json(LocalSessionResponse {
        room_id: room.id.clone(),
        url,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokenRequest {
    pub discord_id: String,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct SessionTokenResponse {
    pub token: String,
    pub url: String,
}

/// POST /api/session-token/{room_id} — mint (or return) a member token for a
/// Discord user joining the session.
pub async fn create_session_token(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<SessionTokenRequest>,
) -> ApiResult<Json<SessionTokenResponse>> {
    let room = state.rooms.require(&room_id)?;
    if !room.is_discord_bound() {
        return Err(ApiError::not_found("No Discord session for this room"));
    }
    if room.status() == RoomStatus::Ended {
        return Err(ApiError::forbidden("Session has ended"));
    }
    if req.discord_id.trim().is_empty() {
        return Err(ApiError::validation("discordId is required"));
    }

    let token = membership::generate_user_token(&room, &req.discord_id, &req.username)?;
    let url = session_url(&state, &room.id, Some(&token));

    Ok(Json(SessionTokenResponse { token, url }))
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenResponse {
    pub discord_id: String,
    pub username: String,
    pub is_host: bool,
}

/// GET /api/validate-token/{room_id}?token=
pub async fn validate_token(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<ValidateTokenResponse>> {
    let room = state.rooms.require(&room_id)?;
    let token = query
        .token
        .as_deref()
        .ok_or_else(|| ApiError::validation("token query parameter is required"))?;

    let member = membership::validate_token(&room, token)
        .ok_or_else(|| ApiError::forbidden("Invalid session token"))?;

    Ok(Json(ValidateTokenResponse {
        discord_id: member.external_id,
        username: member.display_name,
        is_host: member.is_host,
    }))
}

/// GET /api/session-status/{room_id}
pub async fn session_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> ApiResult<Json<SessionProjection>> {
    let room = state.rooms.require(&room_id)?;
    Ok(Json(status::project(&room)))
}

#[derive(Debug, Deserialize)]
pub struct HostTokenRequest {
    pub token: String,
}

fn require_host(room: &Room, token: &str) -> ApiResult<()> {
    if !membership::is_host_by_token(room, token) {
        return Err(ApiError::forbidden("Only the host can do that"));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub success: bool,
    pub status: &'static str,
}

/// POST /api/discord-end-session/{room_id} — host closes the session; the
/// room stays around for rating collection until finalize.
pub async fn end_session(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<HostTokenRequest>,
) -> ApiResult<Json<EndSessionResponse>> {
    let room = state.rooms.require(&room_id)?;
    require_host(&room, &req.token)?;

    {
        let mut st = room.state();
        st.status = RoomStatus::Ended;
        st.is_playing = false;
    }
    broadcast::broadcast(&room, &ServerMessage::SessionEnding);
    broadcast::broadcast(&room, &ServerMessage::SessionStatus(status::project(&room)));

    tracing::info!(room_id = %room.id, "session ended by host");
    Ok(Json(EndSessionResponse {
        success: true,
        status: "ending",
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeSessionResponse {
    pub success: bool,
    pub ratings: Vec<Rating>,
    pub average: Option<f64>,
    pub discord_session: Option<DiscordSession>,
}

/// POST /api/discord-finalize-session/{room_id} — host collects the rating
/// summary; the room and its files are torn down.
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<HostTokenRequest>,
) -> ApiResult<Json<FinalizeSessionResponse>> {
    let room = state.rooms.require(&room_id)?;
    require_host(&room, &req.token)?;

    let ratings = room.ratings().clone();
    let average = status::rating_average(&ratings);
    let discord_session = room.discord.clone();

    broadcast::broadcast(&room, &ServerMessage::SessionEnded);
    state.rooms.delete(&room.id, &state.uploads).await;

    Ok(Json(FinalizeSessionResponse {
        success: true,
        ratings,
        average,
        discord_session,
    }))
}
