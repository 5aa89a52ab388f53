use std::path::Path as FsPath;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use tokio::io::{AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Upper bound on a single range response; large seeks stream in 4 MiB slices.
const MAX_RANGE_CHUNK: u64 = 4 * 1024 * 1024;

/// GET /video/{room_id}
///
/// Serves the room's published video. `Range` requests are answered with 206
/// and at most a 4 MiB slice; the player keeps requesting follow-up ranges.
/// The file reader is dropped as soon as the client goes away.
pub async fn stream_video(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let room = state.rooms.require(&room_id)?;

    let path = room
        .state()
        .video_path
        .clone()
        .ok_or_else(|| ApiError::not_found("No video published for this room"))?;

    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|_| ApiError::not_found("Video file missing"))?;
    let size = meta.len();
    let content_type = content_type_for(&path);

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, size));

    let Some((start, requested_end)) = range else {
        // No (or unparseable) Range: stream the whole file.
        let file = tokio::fs::File::open(&path).await?;
        let body = Body::from_stream(ReaderStream::new(file));
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, size)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(body)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Ok(response);
    };

    if start >= size {
        let response = Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{size}"))
            .body(Body::empty())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        return Ok(response);
    }

    let (start, end) = slice_bounds(start, requested_end, size);
    let length = end - start + 1;

    let mut file = tokio::fs::File::open(&path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let reader = tokio::io::AsyncReadExt::take(file, length);
    let body = Body::from_stream(ReaderStream::new(reader));

    let response = Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, length)
        .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// Clamp a requested range to the 4 MiB chunk cap and the file end.
fn slice_bounds(start: u64, requested_end: Option<u64>, size: u64) -> (u64, u64) {
    let mut end = start + MAX_RANGE_CHUNK - 1;
    if let Some(requested) = requested_end {
        end = end.min(requested);
    }
    (start, end.min(size - 1))
}

/// Parse `bytes=<start>-<end?>` (including suffix form `bytes=-n`).
fn parse_range(value: &str, size: u64) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.trim();
    let end = end.trim();

    if start.is_empty() {
        // Suffix range: last n bytes.
        let n: u64 = end.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((size.saturating_sub(n), None));
    }

    let start: u64 = start.parse().ok()?;
    let end: Option<u64> = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    if let Some(end) = end {
        if end < start {
            return None;
        }
    }
    Some((start, end))
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("srt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEN_MIB: u64 = 10 * 1024 * 1024;

    #[test]
    fn open_range_is_capped_to_four_mib() {
        let (start, end) = slice_bounds(0, None, TEN_MIB);
        assert_eq!(start, 0);
        assert_eq!(end, 4_194_303);
    }

    #[test]
    fn tail_range_ends_at_file_end() {
        let (start, end) = slice_bounds(9_000_000, None, TEN_MIB);
        assert_eq!(start, 9_000_000);
        assert_eq!(end, TEN_MIB - 1);
    }

    #[test]
    fn explicit_end_inside_cap_is_honored() {
        let (start, end) = slice_bounds(100, Some(200), TEN_MIB);
        assert_eq!((start, end), (100, 200));
    }

    #[test]
    fn range_header_parsing() {
        assert_eq!(parse_range("bytes=0-", TEN_MIB), Some((0, None)));
        assert_eq!(parse_range("bytes=100-200", TEN_MIB), Some((100, Some(200))));
        assert_eq!(
            parse_range("bytes=-500", TEN_MIB),
            Some((TEN_MIB - 500, None))
        );
        assert_eq!(parse_range("bytes=200-100", TEN_MIB), None);
        assert_eq!(parse_range("chunks=0-", TEN_MIB), None);
        assert_eq!(parse_range("bytes=abc-", TEN_MIB), None);
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(FsPath::new("a.MP4")), "video/mp4");
        assert_eq!(content_type_for(FsPath::new("a.mkv")), "video/x-matroska");
        assert_eq!(content_type_for(FsPath::new("a.bin")), "application/octet-stream");
    }
}
