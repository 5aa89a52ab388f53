use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::error::ApiError;
use crate::rooms::membership;
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for the room WebSocket.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub room: String,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws?room=&clientId=&token=
///
/// Rejects the upgrade outright with 404/403 for unknown rooms and bad
/// tokens; admission limits are checked after the upgrade so the client
/// receives the 4003 close code.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(room) = state.rooms.get(&params.room) else {
        return ApiError::not_found("Unknown room").into_response();
    };

    if room.is_discord_bound() {
        let valid = params
            .token
            .as_deref()
            .and_then(|t| membership::validate_token(&room, t))
            .is_some();
        if !valid {
            tracing::warn!(room_id = %room.id, "WebSocket upgrade with missing or invalid token");
            return ApiError::forbidden("Invalid session token").into_response();
        }
    }

    let client_id = params
        .client_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let token = params.token;

    ws.on_upgrade(move |socket| actor::run_connection(socket, state, room, client_id, token))
}
