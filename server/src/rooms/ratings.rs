use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::rooms::membership;
use crate::rooms::room::Rating;
use crate::rooms::status;
use crate::state::AppState;
use crate::sync::protocol::ServerMessage;
use crate::ws::broadcast;

#[derive(Debug, Deserialize)]
pub struct RatingRequest {
    pub token: String,
    pub rating: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingResponse {
    pub success: bool,
    pub all_rated: bool,
    pub ratings: Vec<Rating>,
    pub average: Option<f64>,
}

/// POST /api/session-rating/{room_id}
///
/// One rating per member, upserted by external id. Once every connected
/// member has rated, the aggregate goes out to the room.
pub async fn submit_rating(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<RatingRequest>,
) -> ApiResult<Json<RatingResponse>> {
    let room = state.rooms.require(&room_id)?;
    if !room.is_discord_bound() {
        return Err(ApiError::not_found("No Discord session for this room"));
    }

    let member = membership::validate_token(&room, &req.token)
        .ok_or_else(|| ApiError::forbidden("Invalid session token"))?;

    if !(1..=10).contains(&req.rating) {
        return Err(ApiError::validation("rating must be between 1 and 10"));
    }
    let rating_value = req.rating as u8;

    let ratings = {
        let mut ratings = room.ratings();
        match ratings
            .iter_mut()
            .find(|r| r.external_id == member.external_id)
        {
            Some(existing) => {
                existing.rating = rating_value;
                existing.username = member.display_name.clone();
            }
            None => ratings.push(Rating {
                external_id: member.external_id.clone(),
                username: member.display_name.clone(),
                rating: rating_value,
            }),
        }
        ratings.clone()
    };

    let average = status::rating_average(&ratings);
    let all_rated = status::all_connected_rated(&room);

    broadcast::broadcast(
        &room,
        &ServerMessage::RatingReceived {
            ratings: ratings.clone(),
        },
    );
    if all_rated {
        broadcast::broadcast(
            &room,
            &ServerMessage::AllRatingsReceived {
                ratings: ratings.clone(),
                average: average.unwrap_or(0.0),
            },
        );
    }

    tracing::debug!(
        room_id = %room.id,
        external_id = %member.external_id,
        rating = rating_value,
        all_rated = all_rated,
        "rating recorded"
    );

    Ok(Json(RatingResponse {
        success: true,
        all_rated,
        ratings,
        average,
    }))
}
