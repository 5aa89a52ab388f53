use serde::Serialize;

use crate::rooms::room::{Rating, Room, RoomStatus};
use crate::sync::protocol::ViewerInfo;

/// Read-model of a room served to polling clients and the bot, and pushed
/// over WebSocket as `session-status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProjection {
    pub status: RoomStatus,
    pub viewer_count: usize,
    pub viewers: Vec<ViewerInfo>,
    pub ratings: Vec<Rating>,
    pub average: Option<f64>,
    pub all_rated: bool,
    pub movie_info: Option<serde_json::Value>,
    pub movie_name: String,
}

/// Mean rating rounded to one decimal, or None when nothing was rated.
pub fn rating_average(ratings: &[Rating]) -> Option<f64> {
    if ratings.is_empty() {
        return None;
    }
    let sum: u32 = ratings.iter().map(|r| u32::from(r.rating)).sum();
    let mean = f64::from(sum) / ratings.len() as f64;
    Some((mean * 10.0).round() / 10.0)
}

/// True when every connected member has submitted a rating (and at least one
/// member is connected).
pub fn all_connected_rated(room: &Room) -> bool {
    let members = room.members();
    let connected: Vec<&str> = members
        .values()
        .filter(|m| m.connected)
        .map(|m| m.external_id.as_str())
        .collect();
    if connected.is_empty() {
        return false;
    }
    let ratings = room.ratings();
    connected
        .iter()
        .all(|id| ratings.iter().any(|r| r.external_id == *id))
}

pub fn project(room: &Room) -> SessionProjection {
    let viewers: Vec<ViewerInfo> = room
        .viewer_list()
        .into_iter()
        .map(|(external_id, username, ping)| ViewerInfo {
            external_id,
            username,
            ping,
        })
        .collect();

    let ratings = room.ratings().clone();

    SessionProjection {
        status: room.status(),
        viewer_count: room.clients.len(),
        viewers,
        average: rating_average(&ratings),
        all_rated: all_connected_rated(room),
        ratings,
        movie_info: room.movie_info.clone(),
        movie_name: room.movie_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rating(id: &str, value: u8) -> Rating {
        Rating {
            external_id: id.to_string(),
            username: id.to_string(),
            rating: value,
        }
    }

    #[test]
    fn average_rounds_to_one_decimal() {
        let ratings = vec![rating("a", 7), rating("b", 8), rating("c", 9), rating("d", 10)];
        assert_eq!(rating_average(&ratings), Some(8.5));

        let ratings = vec![rating("a", 7), rating("b", 7), rating("c", 8)];
        assert_eq!(rating_average(&ratings), Some(7.3));
    }

    #[test]
    fn average_of_nothing_is_none() {
        assert_eq!(rating_average(&[]), None);
    }

    #[test]
    fn projection_reflects_room_metadata() {
        let room = Room::new(
            "room-1".into(),
            "Movie night".into(),
            "Solaris".into(),
            Some(serde_json::json!({"year": 1972})),
            None,
            None,
            "host-1".into(),
        );
        let proj = project(&room);
        assert_eq!(proj.movie_name, "Solaris");
        assert_eq!(proj.viewer_count, 0);
        assert!(!proj.all_rated);
        assert!(proj.average.is_none());
        let json = serde_json::to_value(&proj).unwrap();
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["movieInfo"]["year"], 1972);
    }
}
