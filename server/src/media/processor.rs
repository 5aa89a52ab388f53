use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::media::probe::{self, ProbeOutput, StreamInfo};
use crate::rooms::room::{Room, SubtitleTrack};
use crate::state::AppState;
use crate::sync::protocol::ServerMessage;
use crate::ws::broadcast;

/// Audio codecs browsers play natively; anything else is transcoded to AAC.
const COMPATIBLE_AUDIO_CODECS: [&str; 2] = ["aac", "mp3"];

/// Run the post-processing pipeline off the request path. Failures never
/// reach the upload response (which already returned); they surface through
/// `processing_message` and leave the room recoverable by re-upload.
pub fn spawn_processing(
    state: AppState,
    room_id: String,
    input: PathBuf,
    stream_index: Option<u32>,
) {
    tokio::spawn(async move {
        if let Err(e) = run(&state, &room_id, &input, stream_index).await {
            tracing::error!(room_id = %room_id, error = %e, "media processing failed");
            if let Some(room) = state.rooms.get(&room_id) {
                {
                    let mut st = room.state();
                    st.is_processing = false;
                    st.processing_message = "Error".to_string();
                }
                broadcast::broadcast(
                    &room,
                    &ServerMessage::ProcessingProgress {
                        message: "Error".to_string(),
                    },
                );
            }
        }
    });
}

async fn run(
    state: &AppState,
    room_id: &str,
    input: &Path,
    stream_index: Option<u32>,
) -> Result<(), String> {
    let room = state
        .rooms
        .get(room_id)
        .ok_or_else(|| "room no longer exists".to_string())?;

    set_progress(&room, "Analyzing file...");
    let probed = probe::probe(input).await?;

    extract_subtitles(state, &room, input, &probed).await;

    let final_path = transcode_audio_if_needed(&room, input, &probed, stream_index).await?;

    {
        let mut st = room.state();
        st.video_path = Some(final_path);
        st.is_processing = false;
        st.processing_message.clear();
    }
    broadcast::broadcast(&room, &ServerMessage::VideoReady);
    tracing::info!(room_id = %room.id, "video published");
    Ok(())
}

fn set_progress(room: &Arc<Room>, message: &str) {
    room.state().processing_message = message.to_string();
    broadcast::broadcast(
        room,
        &ServerMessage::ProcessingProgress {
            message: message.to_string(),
        },
    );
}

/// Phase 1: demux every text subtitle stream to srt. Per-stream failures are
/// logged and skipped; only bitmap-only files surface a user message.
async fn extract_subtitles(state: &AppState, room: &Arc<Room>, input: &Path, probed: &ProbeOutput) {
    let subtitle_streams = probed.subtitle_streams();
    if subtitle_streams.is_empty() {
        return;
    }

    let text_streams: Vec<&&StreamInfo> = subtitle_streams
        .iter()
        .filter(|s| s.is_text_subtitle())
        .collect();
    if text_streams.is_empty() {
        set_progress(room, "bitmap subtitles ignored");
        return;
    }

    let subtitle_dir = state.uploads.root().join(format!("{}_subtitles", room.id));
    if let Err(e) = tokio::fs::create_dir_all(&subtitle_dir).await {
        tracing::warn!(room_id = %room.id, error = %e, "cannot create subtitle dir");
        return;
    }

    let total = text_streams.len();
    for (i, stream) in text_streams.into_iter().enumerate() {
        set_progress(room, &format!("Extracting subtitles ({}/{})...", i + 1, total));

        let tmp_path = state
            .uploads
            .root()
            .join(format!(".{}_sub_{}.srt.tmp", room.id, stream.index));

        let result = Command::new("ffmpeg")
            .arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-map")
            .arg(format!("0:{}", stream.index))
            .arg("-c:s")
            .arg("srt")
            .arg(&tmp_path)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                let filename = format!(
                    "{}_sub_{}_{}.srt",
                    room.id,
                    stream.index,
                    stream.language()
                );
                let dest = subtitle_dir.join(&filename);
                if let Err(e) = tokio::fs::copy(&tmp_path, &dest).await {
                    tracing::warn!(room_id = %room.id, stream = stream.index, error = %e, "subtitle copy failed");
                } else {
                    let display_name = stream
                        .tags
                        .as_ref()
                        .and_then(|t| t.title.clone())
                        .unwrap_or_else(|| format!("Track {} ({})", stream.index, stream.language()));
                    let track = SubtitleTrack {
                        filename,
                        display_name,
                    };
                    room.state().subtitles.push(track.clone());
                    broadcast::broadcast(room, &ServerMessage::SubtitleAdded { subtitle: track });
                }
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
            Ok(output) => {
                tracing::warn!(
                    room_id = %room.id,
                    stream = stream.index,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "subtitle extraction failed, skipping stream"
                );
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
            Err(e) => {
                tracing::warn!(room_id = %room.id, stream = stream.index, error = %e, "ffmpeg did not start");
            }
        }
    }
}

/// Phase 2: keep the file as-is when its target audio track is already
/// browser-compatible and no explicit multi-track selection was made; else
/// remux to mp4 with a single AAC (or copied) audio track.
async fn transcode_audio_if_needed(
    room: &Arc<Room>,
    input: &Path,
    probed: &ProbeOutput,
    stream_index: Option<u32>,
) -> Result<PathBuf, String> {
    let audio_streams = probed.audio_streams();
    if audio_streams.is_empty() {
        return Ok(input.to_path_buf());
    }

    let target = stream_index
        .and_then(|i| audio_streams.iter().find(|s| s.index == i).copied())
        .unwrap_or(audio_streams[0]);
    let codec = target.codec_name.as_deref().unwrap_or("");
    let compatible = COMPATIBLE_AUDIO_CODECS.contains(&codec);
    let explicit_multi_track = stream_index.is_some() && audio_streams.len() > 1;

    if compatible && !explicit_multi_track {
        return Ok(input.to_path_buf());
    }

    set_progress(room, "Converting audio...");

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let output_path = input.with_file_name(format!("{stem}_converted.mp4"));

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y")
        .arg("-v")
        .arg("error")
        .arg("-i")
        .arg(input)
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg(format!("0:{}", target.index))
        .arg("-c:v")
        .arg("copy");
    if compatible {
        cmd.arg("-c:a").arg("copy");
    } else {
        cmd.arg("-c:a").arg("aac").arg("-ac").arg("2").arg("-b:a").arg("192k");
    }
    cmd.arg("-movflags")
        .arg("+faststart")
        .arg("-progress")
        .arg("pipe:1")
        .arg("-nostats")
        .arg(&output_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to run ffmpeg: {e}"))?;

    // Drain stderr concurrently so a chatty ffmpeg cannot fill the pipe and
    // stall while we read progress from stdout.
    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    // ffmpeg reports out_time_ms (microseconds) on its progress pipe; turn it
    // into a percentage against the probed duration.
    if let Some(stdout) = child.stdout.take() {
        let duration = probed.duration_secs();
        let mut lines = BufReader::new(stdout).lines();
        let mut last_pct: i64 = -1;
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(value) = line.strip_prefix("out_time_ms=") else {
                continue;
            };
            let (Some(duration), Ok(micros)) = (duration, value.trim().parse::<i64>()) else {
                continue;
            };
            if duration <= 0.0 {
                continue;
            }
            let pct = ((micros as f64 / 1_000_000.0) / duration * 100.0).clamp(0.0, 100.0) as i64;
            if pct != last_pct {
                last_pct = pct;
                set_progress(room, &format!("Converting audio... {pct}%"));
            }
        }
    }

    let stderr_text = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    let status = child
        .wait()
        .await
        .map_err(|e| format!("ffmpeg wait failed: {e}"))?;
    if !status.success() {
        let _ = tokio::fs::remove_file(&output_path).await;
        return Err(format!(
            "ffmpeg exited with {status}: {}",
            stderr_text.trim()
        ));
    }

    // Replace the original: the converted mp4 becomes the served file.
    if let Err(e) = tokio::fs::remove_file(input).await {
        tracing::warn!(path = %input.display(), error = %e, "could not remove pre-transcode file");
    }

    tracing::info!(
        room_id = %room.id,
        output = %output_path.display(),
        "audio transcode finished"
    );
    Ok(output_path)
}
