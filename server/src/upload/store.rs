use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use dashmap::DashMap;

use crate::error::{ApiError, ApiResult};
use crate::rooms::room::now_ms;
use crate::state::AppState;
use crate::upload::meta::UploadMeta;

/// Close pooled write handles idle longer than this.
const HANDLE_IDLE: Duration = Duration::from_secs(60);

/// Handle sweeper cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Upload directories stale longer than this are collected.
const UPLOAD_TTL_MS: i64 = 30 * 60 * 1000;

/// TTL collector cadence.
const GC_INTERVAL: Duration = Duration::from_secs(300);

/// A cached writable handle for one part file. Chunks write non-overlapping
/// byte ranges, so positional writes need no further locking.
pub struct PooledHandle {
    file: std::fs::File,
    writes_in_flight: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl PooledHandle {
    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle(&self) -> bool {
        self.writes_in_flight.load(Ordering::SeqCst) == 0
            && self
                .last_used
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed()
                > HANDLE_IDLE
    }
}

/// One active upload: its metadata, directory, and pooled handle.
pub struct ActiveUpload {
    pub dir: PathBuf,
    pub part_path: PathBuf,
    pub meta: Mutex<UploadMeta>,
    handle: Mutex<Option<Arc<PooledHandle>>>,
}

impl ActiveUpload {
    pub fn meta_snapshot(&self) -> UploadMeta {
        self.meta.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn drop_handle(&self) {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Upload engine state: at most one active upload per room, plus the pooled
/// file handles. The uploads root is the only writable persistent state in
/// the process.
pub struct UploadStore {
    root: PathBuf,
    active: DashMap<String, Arc<ActiveUpload>>,
}

impl UploadStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            active: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begin a new upload for a room, purging any previous one. Preallocates
    /// the part file to its final size so chunk writes are pure positional
    /// writes.
    pub async fn init(
        &self,
        room_id: &str,
        safe_filename: String,
        total_chunks: u32,
        chunk_size: u64,
        total_size: u64,
    ) -> ApiResult<(String, UploadMeta)> {
        self.purge_room(room_id).await;

        let upload_id = format!("{}_{}", room_id, now_ms());
        let dir = self.root.join(&upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let part_path = dir.join("upload.part");
        {
            let part = part_path.clone();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let file = std::fs::File::create(&part)?;
                file.set_len(total_size)
            })
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;
        }

        let meta = UploadMeta::new(
            room_id.to_string(),
            upload_id.clone(),
            safe_filename,
            total_chunks,
            chunk_size,
            total_size,
        );
        meta.persist(&dir).await?;

        self.active.insert(
            room_id.to_string(),
            Arc::new(ActiveUpload {
                dir,
                part_path,
                meta: Mutex::new(meta.clone()),
                handle: Mutex::new(None),
            }),
        );

        tracing::info!(room_id = %room_id, upload_id = %upload_id, chunks = total_chunks, "upload initialized");
        Ok((upload_id, meta))
    }

    /// Look up the active upload for a room, checking the upload id matches.
    pub fn get(&self, room_id: &str, upload_id: &str) -> ApiResult<Arc<ActiveUpload>> {
        let upload = self
            .active
            .get(room_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ApiError::not_found("No active upload for room"))?;
        if upload.meta_snapshot().upload_id != upload_id {
            return Err(ApiError::not_found("Unknown upload id"));
        }
        Ok(upload)
    }

    fn handle_for(&self, upload: &ActiveUpload) -> ApiResult<Arc<PooledHandle>> {
        let mut slot = upload.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.as_ref() {
            handle.touch();
            return Ok(handle.clone());
        }
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&upload.part_path)?;
        let handle = Arc::new(PooledHandle {
            file,
            writes_in_flight: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        });
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Write one chunk at its exclusive offset and record receipt. Returns
    /// the updated progress percentage.
    pub async fn write_chunk(
        &self,
        upload: &Arc<ActiveUpload>,
        chunk_index: u32,
        data: Bytes,
    ) -> ApiResult<u8> {
        let (total_chunks, chunk_size) = {
            let meta = upload.meta.lock().unwrap_or_else(|e| e.into_inner());
            (meta.total_chunks, meta.chunk_size)
        };
        if chunk_index >= total_chunks {
            return Err(ApiError::validation(format!(
                "chunkIndex {chunk_index} out of range (totalChunks {total_chunks})"
            )));
        }

        let handle = self.handle_for(upload)?;
        let offset = u64::from(chunk_index) * chunk_size;

        handle.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = tokio::task::spawn_blocking({
            let handle = handle.clone();
            let data = data.clone();
            move || handle.file.write_all_at(&data, offset)
        })
        .await;
        handle.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
        handle.touch();

        result.map_err(|e| ApiError::Internal(e.to_string()))??;

        let mut meta = upload.meta.lock().unwrap_or_else(|e| e.into_inner());
        meta.received_chunks.insert(chunk_index);
        meta.last_activity = now_ms();
        Ok(meta.progress())
    }

    /// Finish an upload: verify every chunk arrived, close the handle, flush
    /// metadata, and move the part file to its published name. Returns the
    /// final path.
    pub async fn complete(&self, room_id: &str, upload: &Arc<ActiveUpload>) -> ApiResult<PathBuf> {
        let meta = upload.meta_snapshot();
        if !meta.is_complete() {
            return Err(ApiError::IncompleteUpload {
                received: meta.received_chunks.len(),
                expected: meta.total_chunks as usize,
            });
        }

        upload.drop_handle();
        meta.persist(&upload.dir).await?;

        let final_path = self.root.join(format!("{}_{}", meta.upload_id, meta.filename));
        tokio::fs::rename(&upload.part_path, &final_path).await?;

        if let Err(e) = tokio::fs::remove_dir_all(&upload.dir).await {
            tracing::warn!(upload_id = %meta.upload_id, error = %e, "failed to remove upload dir");
        }
        self.active.remove(room_id);

        tracing::info!(
            room_id = %room_id,
            upload_id = %meta.upload_id,
            path = %final_path.display(),
            "upload completed"
        );
        Ok(final_path)
    }

    /// Drop the active upload for a room: close the handle, delete the
    /// directory, purge caches.
    pub async fn purge_room(&self, room_id: &str) {
        if let Some((_, upload)) = self.active.remove(room_id) {
            upload.drop_handle();
            if let Err(e) = tokio::fs::remove_dir_all(&upload.dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(room_id = %room_id, error = %e, "failed to remove upload dir");
                }
            }
        }
    }

    /// One sweep of the handle pool: close handles with no writes in flight
    /// that have been idle past the threshold.
    pub fn sweep_handles(&self) {
        for entry in self.active.iter() {
            let upload = entry.value();
            let mut slot = upload.handle.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().map(|h| h.idle()).unwrap_or(false) {
                *slot = None;
                tracing::debug!(
                    upload_id = %upload.meta_snapshot().upload_id,
                    "closed idle upload handle"
                );
            }
        }
    }

    /// One TTL pass over the uploads root: delete upload directories whose
    /// last activity (or mtime fallback) is older than the TTL. Subtitle
    /// directories are exempt.
    pub async fn collect_stale(&self) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "uploads root unreadable during GC");
                return;
            }
        };

        let now = now_ms();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with("_subtitles") {
                continue;
            }

            let dir = entry.path();
            let last_activity = self
                .active_last_activity(&name)
                .or(UploadMeta::load(&dir).await.ok().map(|m| m.last_activity));
            let last_activity = match last_activity {
                Some(ms) => ms,
                None => match entry.metadata().await.and_then(|m| m.modified()) {
                    Ok(mtime) => chrono::DateTime::<chrono::Utc>::from(mtime).timestamp_millis(),
                    Err(_) => continue,
                },
            };

            if now - last_activity > UPLOAD_TTL_MS {
                tracing::info!(upload_id = %name, "collecting stale upload");
                let room_id: Option<String> = self
                    .active
                    .iter()
                    .find(|e| e.value().meta_snapshot().upload_id == name)
                    .map(|e| e.key().clone());
                if let Some(room_id) = room_id {
                    self.purge_room(&room_id).await;
                } else if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(upload_id = %name, error = %e, "failed to remove stale upload dir");
                }
            }
        }
    }

    fn active_last_activity(&self, upload_id: &str) -> Option<i64> {
        self.active.iter().find_map(|e| {
            let meta = e.value().meta_snapshot();
            (meta.upload_id == upload_id).then_some(meta.last_activity)
        })
    }
}

/// Spawn the idle-handle sweeper.
pub fn spawn_handle_sweeper(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            state.uploads.sweep_handles();
        }
    });
}

/// Spawn the TTL collector for abandoned upload directories.
pub fn spawn_ttl_gc(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(GC_INTERVAL).await;
            state.uploads.collect_stale().await;
        }
    });
}
