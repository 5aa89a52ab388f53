use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::media;
use crate::rooms::membership;
use crate::rooms::room::{Room, RoomStatus, SubtitleTrack};
use crate::state::AppState;
use crate::sync::protocol::ServerMessage;
use crate::upload::meta::{path_is_within, sanitize_filename};
use crate::ws::broadcast;

/// Upload authorization carried in the query string: Discord-bound rooms
/// present the host token, simple rooms the host id chosen at creation.
#[derive(Debug, Deserialize)]
pub struct UploadAuthQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(rename = "hostId", default)]
    pub host_id: Option<String>,
}

fn authorize_host(room: &Room, auth: &UploadAuthQuery) -> ApiResult<()> {
    if room.status() == RoomStatus::Ended {
        return Err(ApiError::forbidden("Session has ended"));
    }

    if room.is_discord_bound() {
        let token = auth
            .token
            .as_deref()
            .ok_or_else(|| ApiError::forbidden("Missing session token"))?;
        if !membership::is_host_by_token(room, token) {
            return Err(ApiError::forbidden("Only the host can manage uploads"));
        }
    } else {
        let host_id = auth
            .host_id
            .as_deref()
            .ok_or_else(|| ApiError::forbidden("Missing host id"))?;
        let expected = room.state().host_id.clone();
        if expected.is_empty() || host_id != expected {
            return Err(ApiError::forbidden("Only the host can manage uploads"));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub filename: String,
    pub total_chunks: i64,
    pub chunk_size: i64,
    pub total_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub safe_filename: String,
}

/// POST /api/upload/init/{room_id}
pub async fn init_upload(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(auth): Query<UploadAuthQuery>,
    Json(req): Json<InitUploadRequest>,
) -> ApiResult<Json<InitUploadResponse>> {
    let room = state.rooms.require(&room_id)?;
    authorize_host(&room, &auth)?;

    if req.total_chunks <= 0 || req.chunk_size <= 0 || req.total_size <= 0 {
        return Err(ApiError::validation(
            "totalChunks, chunkSize and totalSize must be positive",
        ));
    }
    if room.state().is_processing {
        return Err(ApiError::conflict("A file is already being processed"));
    }

    let safe_filename = sanitize_filename(&req.filename);
    let (upload_id, _meta) = state
        .uploads
        .init(
            &room.id,
            safe_filename.clone(),
            req.total_chunks as u32,
            req.chunk_size as u64,
            req.total_size as u64,
        )
        .await?;

    {
        let mut st = room.state();
        st.is_uploading = true;
        st.upload_progress = 0;
    }
    broadcast::reset_progress_gate(&room);
    broadcast::broadcast(
        &room,
        &ServerMessage::UploadStart {
            filename: safe_filename.clone(),
        },
    );

    Ok(Json(InitUploadResponse {
        upload_id,
        safe_filename,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub success: bool,
    pub chunk_index: u32,
    pub progress: u8,
}

/// POST /api/upload/chunk/{room_id}/{upload_id}/{chunk_index}
///
/// The raw body is the chunk; it lands at `chunk_index * chunk_size` in the
/// preallocated part file through the pooled handle.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((room_id, upload_id, chunk_index)): Path<(String, String, String)>,
    Query(auth): Query<UploadAuthQuery>,
    body: Bytes,
) -> ApiResult<Json<ChunkResponse>> {
    let room = state.rooms.require(&room_id)?;
    authorize_host(&room, &auth)?;

    let chunk_index: u32 = chunk_index
        .parse()
        .map_err(|_| ApiError::validation("chunkIndex must be a non-negative integer"))?;

    let upload = state.uploads.get(&room.id, &upload_id)?;
    let progress = state.uploads.write_chunk(&upload, chunk_index, body).await?;

    room.state().upload_progress = progress;
    broadcast::broadcast_upload_progress(&room, progress);

    Ok(Json(ChunkResponse {
        success: true,
        chunk_index,
        progress,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: u32,
    pub existing_chunks: Vec<u32>,
    pub last_activity: i64,
}

/// GET /api/upload/status/{room_id}/{upload_id}
///
/// Lets a reloaded client decide whether it can resume: same name, size and
/// chunk count mean the remaining chunks can be sent under the same id.
pub async fn upload_status(
    State(state): State<AppState>,
    Path((room_id, upload_id)): Path<(String, String)>,
    Query(auth): Query<UploadAuthQuery>,
) -> ApiResult<Json<UploadStatusResponse>> {
    let room = state.rooms.require(&room_id)?;
    authorize_host(&room, &auth)?;

    let upload = state.uploads.get(&room.id, &upload_id)?;
    let meta = upload.meta_snapshot();

    Ok(Json(UploadStatusResponse {
        upload_id: meta.upload_id,
        filename: meta.filename,
        total_chunks: meta.total_chunks,
        existing_chunks: meta.received_chunks.iter().copied().collect(),
        last_activity: meta.last_activity,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub filename: String,
    pub total_chunks: i64,
    /// Optional audio track selection forwarded to the post-processor.
    #[serde(default)]
    pub stream_index: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub success: bool,
    pub filename: String,
    pub processing: bool,
}

/// POST /api/upload/complete/{room_id}/{upload_id}
///
/// Verifies every chunk arrived, publishes the part file under its final
/// name, and hands off to the post-processor in the background. The response
/// returns before processing finishes.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path((room_id, upload_id)): Path<(String, String)>,
    Query(auth): Query<UploadAuthQuery>,
    Json(req): Json<CompleteUploadRequest>,
) -> ApiResult<Json<CompleteUploadResponse>> {
    let room = state.rooms.require(&room_id)?;
    authorize_host(&room, &auth)?;

    let upload = state.uploads.get(&room.id, &upload_id)?;
    let meta = upload.meta_snapshot();
    if req.total_chunks != i64::from(meta.total_chunks) {
        return Err(ApiError::validation(format!(
            "totalChunks mismatch: expected {}, got {}",
            meta.total_chunks, req.total_chunks
        )));
    }

    let final_path = state.uploads.complete(&room.id, &upload).await?;

    {
        let mut st = room.state();
        st.is_uploading = false;
        st.upload_progress = 100;
        st.is_processing = true;
        st.processing_message = "Processing video...".to_string();
    }
    broadcast::broadcast_upload_progress(&room, 100);
    broadcast::broadcast(
        &room,
        &ServerMessage::ProcessingProgress {
            message: "Processing video...".to_string(),
        },
    );

    media::processor::spawn_processing(
        state.clone(),
        room.id.clone(),
        final_path,
        req.stream_index,
    );

    Ok(Json(CompleteUploadResponse {
        success: true,
        filename: meta.filename,
        processing: true,
    }))
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub success: bool,
}

/// POST /api/upload/abort/{room_id}/{upload_id}
pub async fn abort_upload(
    State(state): State<AppState>,
    Path((room_id, upload_id)): Path<(String, String)>,
    Query(auth): Query<UploadAuthQuery>,
) -> ApiResult<Json<AbortResponse>> {
    let room = state.rooms.require(&room_id)?;
    authorize_host(&room, &auth)?;

    // Validate the id before purging so an unknown upload 404s.
    state.uploads.get(&room.id, &upload_id)?;
    state.uploads.purge_room(&room.id).await;

    {
        let mut st = room.state();
        st.is_uploading = false;
        st.upload_progress = 0;
    }

    tracing::info!(room_id = %room.id, upload_id = %upload_id, "upload aborted");
    Ok(Json(AbortResponse { success: true }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtitleUploadResponse {
    pub success: bool,
    pub filename: String,
    pub display_name: String,
}

/// POST /api/upload/subtitle/{room_id}
///
/// Accepts an externally sourced subtitle file (raw body, `x-filename`
/// header) and registers it alongside the extracted tracks.
pub async fn upload_subtitle(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(auth): Query<UploadAuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<SubtitleUploadResponse>> {
    let room = state.rooms.require(&room_id)?;
    authorize_host(&room, &auth)?;

    let raw_name = headers
        .get("x-filename")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("Missing x-filename header"))?;
    let safe = sanitize_filename(raw_name);

    let dir = state.uploads.root().join(format!("{}_subtitles", room.id));
    tokio::fs::create_dir_all(&dir).await?;

    let filename = format!("{}_sub_custom_{}", room.id, safe);
    let path = dir.join(&filename);
    if !path_is_within(state.uploads.root(), &path) {
        return Err(ApiError::validation("Invalid subtitle filename"));
    }
    tokio::fs::write(&path, &body).await?;

    let display_name = std::path::Path::new(&safe)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| safe.clone());

    let track = SubtitleTrack {
        filename: filename.clone(),
        display_name: display_name.clone(),
    };
    room.state().subtitles.push(track.clone());
    broadcast::broadcast(&room, &ServerMessage::SubtitleAdded { subtitle: track });

    tracing::info!(room_id = %room.id, filename = %filename, "subtitle uploaded");
    Ok(Json(SubtitleUploadResponse {
        success: true,
        filename,
        display_name,
    }))
}

/// GET /api/upload/subtitle/{room_id}/{filename}
///
/// Returns the subtitle as UTF-8 text. Legacy files that fail UTF-8 decoding
/// are re-read as Windows-1252.
pub async fn download_subtitle(
    State(state): State<AppState>,
    Path((room_id, filename)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let room = state.rooms.require(&room_id)?;

    if sanitize_filename(&filename) != filename {
        return Err(ApiError::validation("Invalid subtitle filename"));
    }

    let path = state
        .uploads
        .root()
        .join(format!("{}_subtitles", room.id))
        .join(&filename);
    if !path_is_within(state.uploads.root(), &path) {
        return Err(ApiError::validation("Invalid subtitle filename"));
    }

    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("Subtitle not found"));
        }
        Err(e) => return Err(e.into()),
    };

    let text = media::decode_subtitle_text(&bytes);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    ))
}
