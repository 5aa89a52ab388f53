use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{ApiError, ApiResult};
use crate::rooms::room::{DiscordSession, Room};
use crate::state::AppState;
use crate::upload::meta::path_is_within;
use crate::upload::store::UploadStore;

/// How often the idle-room sweep runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// A room with no clients and no state change for this long is collected.
const IDLE_ROOM_MS: i64 = 10 * 60 * 1000;

/// Grace period after the last client leaves, so page reloads survive.
const EMPTY_DEBOUNCE: Duration = Duration::from_secs(30);

pub struct CreateRoomParams {
    pub title: String,
    pub movie_name: String,
    pub movie_info: Option<serde_json::Value>,
    pub selected_episode: Option<String>,
    pub discord: Option<DiscordSession>,
    pub host_id: String,
}

/// Process-wide room map. At most one room exists in waiting/playing status;
/// `create` enforces the singleton-session rule.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    uploads_root: PathBuf,
}

impl RoomRegistry {
    pub fn new(uploads_root: PathBuf) -> Self {
        Self {
            rooms: DashMap::new(),
            uploads_root,
        }
    }

    /// Create the single active room. Fails with conflict while any room
    /// (Discord-bound or not) still exists.
    pub fn create(&self, params: CreateRoomParams) -> ApiResult<Arc<Room>> {
        if !self.rooms.is_empty() {
            return Err(ApiError::conflict("A session is already active"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let room = Arc::new(Room::new(
            id.clone(),
            params.title,
            params.movie_name,
            params.movie_info,
            params.selected_episode,
            params.discord,
            params.host_id,
        ));
        self.rooms.insert(id.clone(), room.clone());
        tracing::info!(room_id = %id, movie = %room.movie_name, "room created");
        Ok(room)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn require(&self, id: &str) -> ApiResult<Arc<Room>> {
        self.get(id)
            .ok_or_else(|| ApiError::not_found("Unknown room"))
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Room>)) {
        for entry in self.rooms.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Remove a room and tear down everything it owns: sockets, the active
    /// upload, the published video and extracted subtitles. Files are only
    /// removed when they resolve under the uploads root.
    pub async fn delete(&self, id: &str, uploads: &UploadStore) {
        let Some((_, room)) = self.rooms.remove(id) else {
            return;
        };

        for entry in room.clients.iter() {
            let _ = entry.value().sender.send(axum::extract::ws::Message::Close(Some(
                axum::extract::ws::CloseFrame {
                    code: 1000,
                    reason: "Session closed".into(),
                },
            )));
        }
        room.clients.clear();

        uploads.purge_room(id).await;

        let video_path = room.state().video_path.clone();
        if let Some(path) = video_path {
            self.remove_if_owned(&path).await;
        }

        let subtitle_dir = self.uploads_root.join(format!("{id}_subtitles"));
        if subtitle_dir.is_dir() {
            if let Err(e) = tokio::fs::remove_dir_all(&subtitle_dir).await {
                tracing::warn!(room_id = %id, error = %e, "failed to remove subtitle dir");
            }
        }

        tracing::info!(room_id = %id, "room deleted");
    }

    async fn remove_if_owned(&self, path: &Path) {
        if !path_is_within(&self.uploads_root, path) {
            tracing::warn!(path = %path.display(), "refusing to delete file outside uploads root");
            return;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove video file");
            }
        }
    }
}

/// Spawn the periodic idle-room sweep: rooms with no clients and no state
/// update for 10 minutes are deleted, honoring the 30 s reconnect debounce.
pub fn spawn_cleanup_loop(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;

            let now = crate::rooms::room::now_ms();
            let mut stale: Vec<String> = Vec::new();
            state.rooms.for_each(|room| {
                if !room.clients.is_empty() {
                    return;
                }
                let idle = now - room.state().last_update > IDLE_ROOM_MS;
                let debounced = room
                    .empty_since
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .map(|t| t.elapsed() >= EMPTY_DEBOUNCE)
                    .unwrap_or(true);
                if idle && debounced {
                    stale.push(room.id.clone());
                }
            });

            for id in stale {
                tracing::info!(room_id = %id, "collecting idle room");
                state.rooms.delete(&id, &state.uploads).await;
            }
        }
    });
}

/// Delayed deletion for an ended room once its last client leaves. Re-checked
/// after the debounce so a reload does not kill the session summary screen.
pub fn schedule_ended_room_cleanup(state: AppState, room_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(EMPTY_DEBOUNCE).await;
        let Some(room) = state.rooms.get(&room_id) else {
            return;
        };
        if room.clients.is_empty()
            && room.status() == crate::rooms::room::RoomStatus::Ended
        {
            state.rooms.delete(&room_id, &state.uploads).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str) -> CreateRoomParams {
        CreateRoomParams {
            title: "Night".into(),
            movie_name: name.into(),
            movie_info: None,
            selected_episode: None,
            discord: None,
            host_id: "host".into(),
        }
    }

    #[test]
    fn second_create_conflicts() {
        let registry = RoomRegistry::new(PathBuf::from("/tmp/uploads"));
        registry.create(params("first")).unwrap();
        let err = registry.create(params("second")).unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn require_maps_to_not_found() {
        let registry = RoomRegistry::new(PathBuf::from("/tmp/uploads"));
        assert!(matches!(
            registry.require("nope"),
            Err(ApiError::NotFound(_))
        ));
    }
}
