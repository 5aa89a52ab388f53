use serde::{Deserialize, Serialize};

use crate::rooms::room::{Rating, SubtitleTrack};
use crate::rooms::status::SessionProjection;

/// Messages a client may send over the room WebSocket.
///
/// Unknown `type` values fail to decode and are dropped by the actor; a
/// malformed payload never takes the room down.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Ping {
        timestamp: i64,
    },
    Play {
        current_time: f64,
        seq: u64,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Pause {
        current_time: f64,
        seq: u64,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Seek {
        current_time: f64,
        seq: u64,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Drift check: asks for a personal sync frame.
    State,
    HostHeartbeat {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    UpdateMetrics {
        metrics: ClientMetrics,
    },
    SessionStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    #[serde(default)]
    pub last_ping: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub external_id: String,
    pub username: String,
    pub ping: u32,
}

/// Messages the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Pong {
        timestamp: i64,
        server_time: i64,
    },
    /// Reference frame for latency-compensated playhead reconstruction.
    Sync {
        current_time: f64,
        is_playing: bool,
        server_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_host: Option<bool>,
    },
    Viewers {
        count: usize,
        viewers: Vec<ViewerInfo>,
    },
    UploadStart {
        filename: String,
    },
    UploadProgress {
        progress: u8,
    },
    ProcessingProgress {
        message: String,
    },
    VideoReady,
    SessionEnding,
    SessionEnded,
    SessionStatus(SessionProjection),
    RatingReceived {
        ratings: Vec<Rating>,
    },
    AllRatingsReceived {
        ratings: Vec<Rating>,
        average: f64,
    },
    HostChanged {
        new_host_id: String,
        new_host_username: String,
    },
    SubtitleAdded {
        subtitle: SubtitleTrack,
    },
}

impl ServerMessage {
    /// Encode as a WebSocket text frame. Serialization of these enums cannot
    /// fail; the fallback keeps the send path total.
    pub fn to_ws(&self) -> axum::extract::ws::Message {
        let text = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        axum::extract::ws::Message::Text(text.into())
    }
}
