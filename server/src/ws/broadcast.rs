use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rooms::room::Room;
use crate::sync::protocol::{ServerMessage, ViewerInfo};

use super::ConnectionSender;

/// Upload-progress frames are throttled per room to one per window.
const PROGRESS_THROTTLE: Duration = Duration::from_millis(250);

/// Viewer-list broadcasts are debounced so join/leave bursts collapse.
const VIEWERS_DEBOUNCE: Duration = Duration::from_millis(500);

/// Push a frame to a single connection. Best effort: a closed queue means
/// the actor is already tearing the socket down.
pub fn send(sender: &ConnectionSender, msg: &ServerMessage) {
    let _ = sender.send(msg.to_ws());
}

/// Push a frame to every socket in the room. Frames are enqueued in issue
/// order per socket; no ordering is promised across sockets.
pub fn broadcast(room: &Room, msg: &ServerMessage) {
    let frame = msg.to_ws();
    for entry in room.clients.iter() {
        let _ = entry.value().sender.send(frame.clone());
    }
}

/// Push a frame to the host's sockets only (upload/processing progress is
/// host-facing UI).
pub fn send_to_host(room: &Room, msg: &ServerMessage) {
    let host_token: Option<String> = room
        .members()
        .iter()
        .find(|(_, m)| m.is_host)
        .map(|(token, _)| token.clone());
    let host_id = room.state().host_id.clone();

    let frame = msg.to_ws();
    for entry in room.clients.iter() {
        let client = entry.value();
        let is_host = match (&client.token, &host_token) {
            (Some(token), Some(host)) => token == host,
            _ => !host_id.is_empty() && client.client_id == host_id,
        };
        if is_host {
            let _ = client.sender.send(frame.clone());
        }
    }
}

/// Re-arm the progress gate so the first progress frame of a fresh upload
/// is not swallowed by the previous upload's window.
pub fn reset_progress_gate(room: &Room) {
    *room.progress_gate.lock().unwrap_or_else(|e| e.into_inner()) =
        (Instant::now() - PROGRESS_THROTTLE, -1);
}

/// Broadcast an upload-progress value, subject to the 250 ms per-room
/// throttle. A repeated value is never re-sent; 100 (set only by `complete`)
/// bypasses the window so the terminal frame is never dropped.
pub fn broadcast_upload_progress(room: &Room, progress: u8) {
    {
        let mut gate = room.progress_gate.lock().unwrap_or_else(|e| e.into_inner());
        let (last_at, last_value) = *gate;
        if i16::from(progress) == last_value {
            return;
        }
        if progress < 100 && last_at.elapsed() < PROGRESS_THROTTLE {
            return;
        }
        *gate = (Instant::now(), i16::from(progress));
    }
    broadcast(room, &ServerMessage::UploadProgress { progress });
}

/// Immediate viewer-list broadcast.
pub fn broadcast_viewers(room: &Room) {
    let viewers: Vec<ViewerInfo> = room
        .viewer_list()
        .into_iter()
        .map(|(external_id, username, ping)| ViewerInfo {
            external_id,
            username,
            ping,
        })
        .collect();

    broadcast(
        room,
        &ServerMessage::Viewers {
            count: room.clients.len(),
            viewers,
        },
    );
}

/// Debounced viewer-list broadcast: waits 500 ms and only fires if no newer
/// schedule superseded this one.
pub fn schedule_viewers_broadcast(room: Arc<Room>) {
    let epoch = room.viewers_epoch.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::spawn(async move {
        tokio::time::sleep(VIEWERS_DEBOUNCE).await;
        if room.viewers_epoch.load(Ordering::SeqCst) == epoch {
            broadcast_viewers(&room);
        }
    });
}
