use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ws::ConnectionSender;

/// Hard cap on members and live sockets per room.
pub const MAX_CLIENTS: usize = 10;

/// Current wall-clock time in epoch milliseconds. All wire-visible
/// timestamps (sync frames, heartbeats, upload metadata) use this clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Ended,
}

/// Discord binding carried by bot-created rooms and echoed back on finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordSession {
    pub channel_id: String,
    pub message_id: String,
    pub guild_id: String,
    pub host_discord_id: String,
    #[serde(default)]
    pub host_username: Option<String>,
}

/// One entry in the room's token map.
#[derive(Debug, Clone)]
pub struct Member {
    pub external_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub connected: bool,
    /// Epoch ms of the first WebSocket connect; drives host-transfer order.
    pub connected_at: i64,
    pub last_ping_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub external_id: String,
    pub username: String,
    pub rating: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleTrack {
    pub filename: String,
    pub display_name: String,
}

/// Playback and pipeline state. The `(current_time, last_update, is_playing)`
/// triple is the sync reference point; everything else is projection input.
#[derive(Debug)]
pub struct RoomState {
    pub video_path: Option<PathBuf>,
    pub current_time: f64,
    pub last_update: i64,
    pub is_playing: bool,
    pub playback_started: bool,
    pub is_uploading: bool,
    pub upload_progress: u8,
    pub is_processing: bool,
    pub processing_message: String,
    pub host_id: String,
    pub host_last_heartbeat: i64,
    pub last_command_seq: u64,
    pub subtitles: Vec<SubtitleTrack>,
    pub status: RoomStatus,
}

impl RoomState {
    fn new(host_id: String) -> Self {
        Self {
            video_path: None,
            current_time: 0.0,
            last_update: now_ms(),
            is_playing: false,
            playback_started: false,
            is_uploading: false,
            upload_progress: 0,
            is_processing: false,
            processing_message: String::new(),
            host_id,
            host_last_heartbeat: now_ms(),
            last_command_seq: 0,
            subtitles: Vec::new(),
            status: RoomStatus::Waiting,
        }
    }

    /// Effective server playhead at `now_ms`.
    pub fn playhead(&self, now_ms: i64) -> f64 {
        if self.is_playing {
            self.current_time + (now_ms - self.last_update) as f64 / 1000.0
        } else {
            self.current_time
        }
    }
}

/// A live WebSocket attached to a room. The socket itself is owned by its
/// actor task; the room only holds the outbound queue and identity.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub client_id: String,
    pub token: Option<String>,
    pub sender: ConnectionSender,
    /// Epoch ms of the attach; orders host transfer in rooms without a
    /// token map.
    pub connected_at: i64,
}

/// The one top-level aggregate. Owned by the registry; everything else holds
/// the room id and looks the room up on use.
pub struct Room {
    pub id: String,
    pub title: String,
    pub movie_name: String,
    pub movie_info: Option<serde_json::Value>,
    pub selected_episode: Option<String>,
    pub discord: Option<DiscordSession>,

    state: Mutex<RoomState>,
    members: Mutex<HashMap<String, Member>>,
    ratings: Mutex<Vec<Rating>>,
    pub clients: DashMap<u64, ClientHandle>,

    /// Monotonic key source for `clients`.
    next_client_key: AtomicU64,
    /// Generation counter for the debounced viewer broadcast.
    pub viewers_epoch: AtomicU64,
    /// Last `sync` emission, for the periodic tick.
    pub last_sync_sent: Mutex<Instant>,
    /// Last upload-progress broadcast `(instant, value)`, for the 250 ms throttle.
    pub progress_gate: Mutex<(Instant, i16)>,
    /// Set when the last socket detaches; cleared on reconnect. Deletion
    /// requires this to be at least 30 s old.
    pub empty_since: Mutex<Option<Instant>>,
}

impl Room {
    pub fn new(
        id: String,
        title: String,
        movie_name: String,
        movie_info: Option<serde_json::Value>,
        selected_episode: Option<String>,
        discord: Option<DiscordSession>,
        host_id: String,
    ) -> Self {
        Self {
            id,
            title,
            movie_name,
            movie_info,
            selected_episode,
            discord,
            state: Mutex::new(RoomState::new(host_id)),
            members: Mutex::new(HashMap::new()),
            ratings: Mutex::new(Vec::new()),
            clients: DashMap::new(),
            next_client_key: AtomicU64::new(1),
            viewers_epoch: AtomicU64::new(0),
            last_sync_sent: Mutex::new(Instant::now()),
            progress_gate: Mutex::new((Instant::now(), -1)),
            empty_since: Mutex::new(None),
        }
    }

    pub fn is_discord_bound(&self) -> bool {
        self.discord.is_some()
    }

    pub fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn members(&self) -> MutexGuard<'_, HashMap<String, Member>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ratings(&self) -> MutexGuard<'_, Vec<Rating>> {
        self.ratings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> RoomStatus {
        self.state().status
    }

    /// Attach a live socket and return its key in the client set.
    pub fn attach_client(&self, handle: ClientHandle) -> u64 {
        let key = self.next_client_key.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(key, handle);
        *self.empty_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        key
    }

    /// Detach a socket. Returns true if the room is now empty.
    pub fn detach_client(&self, key: u64) -> bool {
        self.clients.remove(&key);
        let empty = self.clients.is_empty();
        if empty {
            *self.empty_since.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        }
        empty
    }

    /// Whether any live socket still carries the given token.
    pub fn token_has_live_socket(&self, token: &str) -> bool {
        self.clients
            .iter()
            .any(|c| c.value().token.as_deref() == Some(token))
    }

    /// Snapshot of connected members as `(external_id, display_name, ping)`.
    pub fn viewer_list(&self) -> Vec<(String, String, u32)> {
        let members = self.members();
        let mut viewers: Vec<_> = members
            .values()
            .filter(|m| m.connected)
            .map(|m| (m.external_id.clone(), m.display_name.clone(), m.last_ping_ms))
            .collect();
        viewers.sort_by(|a, b| a.0.cmp(&b.0));
        viewers
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("movie_name", &self.movie_name)
            .field("clients", &self.clients.len())
            .finish()
    }
}
