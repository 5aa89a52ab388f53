use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rooms::room::{now_ms, Room, RoomStatus};
use crate::rooms::status;
use crate::state::AppState;
use crate::sync::protocol::{ClientMessage, ServerMessage};
use crate::ws::broadcast;

/// Emit interval for the periodic sync while playing.
const SYNC_INTERVAL_PLAYING: Duration = Duration::from_secs(2);

/// Emit interval while paused; doubles as an application-level keep-alive.
const SYNC_INTERVAL_PAUSED: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackCommand {
    Play,
    Pause,
    Seek,
}

pub fn sync_interval(is_playing: bool) -> Duration {
    if is_playing {
        SYNC_INTERVAL_PLAYING
    } else {
        SYNC_INTERVAL_PAUSED
    }
}

/// Apply a host playback command to the room's reference point.
///
/// Commands carry a monotonic `seq`; anything at or below the last applied
/// sequence is a replay and is dropped. Returns whether the command was
/// applied.
pub fn apply_host_command(
    room: &Arc<Room>,
    command: PlaybackCommand,
    current_time: f64,
    seq: u64,
) -> bool {
    let now = now_ms();
    let is_playing;
    let mut status_changed = false;

    {
        let mut state = room.state();

        if state.status == RoomStatus::Ended {
            tracing::warn!(room_id = %room.id, "playback command on ended room dropped");
            return false;
        }
        if seq <= state.last_command_seq {
            tracing::debug!(
                room_id = %room.id,
                seq = seq,
                last = state.last_command_seq,
                "stale playback command dropped"
            );
            return false;
        }

        state.current_time = current_time;
        match command {
            PlaybackCommand::Play => state.is_playing = true,
            PlaybackCommand::Pause => state.is_playing = false,
            // Seek only moves the reference point.
            PlaybackCommand::Seek => {}
        }
        state.last_update = now;
        state.last_command_seq = seq;
        state.host_last_heartbeat = now;

        if command == PlaybackCommand::Play && !state.playback_started {
            state.playback_started = true;
            if state.status == RoomStatus::Waiting {
                state.status = RoomStatus::Playing;
                status_changed = true;
            }
        }

        is_playing = state.is_playing;
    }

    broadcast::broadcast(
        room,
        &ServerMessage::Sync {
            current_time,
            is_playing,
            server_time: now,
            is_host: None,
        },
    );
    *room.last_sync_sent.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

    if status_changed {
        broadcast::broadcast(room, &ServerMessage::SessionStatus(status::project(room)));
    }

    true
}

/// Build a sync frame from the room's current reference point.
pub fn sync_frame(room: &Room, is_host: Option<bool>) -> ServerMessage {
    let now = now_ms();
    let state = room.state();
    ServerMessage::Sync {
        current_time: state.playhead(now),
        is_playing: state.is_playing,
        server_time: now,
        is_host,
    }
}

/// Whether the socket behind `client_key` holds host authority: a tokened
/// member with the host flag, or (simple rooms) a client id equal to the
/// room's host id.
fn sender_is_host(room: &Room, client_key: u64) -> bool {
    let Some(client) = room.clients.get(&client_key).map(|c| c.value().clone()) else {
        return false;
    };
    if let Some(token) = &client.token {
        return room
            .members()
            .get(token)
            .map(|m| m.is_host)
            .unwrap_or(false);
    }
    let host_id = room.state().host_id.clone();
    !host_id.is_empty() && client.client_id == host_id
}

/// Dispatch one inbound client message. Invalid senders and stale commands
/// are ignored; nothing in here can take the room down.
pub fn handle_message(room: &Arc<Room>, client_key: u64, msg: ClientMessage) {
    let sender = room.clients.get(&client_key).map(|c| c.value().sender.clone());
    let Some(sender) = sender else { return };

    match msg {
        ClientMessage::Ping { timestamp } => {
            broadcast::send(
                &sender,
                &ServerMessage::Pong {
                    timestamp,
                    server_time: now_ms(),
                },
            );
        }
        ClientMessage::Play { current_time, seq, .. } => {
            if sender_is_host(room, client_key) {
                apply_host_command(room, PlaybackCommand::Play, current_time, seq);
            } else {
                tracing::warn!(room_id = %room.id, "play command from non-host ignored");
            }
        }
        ClientMessage::Pause { current_time, seq, .. } => {
            if sender_is_host(room, client_key) {
                apply_host_command(room, PlaybackCommand::Pause, current_time, seq);
            } else {
                tracing::warn!(room_id = %room.id, "pause command from non-host ignored");
            }
        }
        ClientMessage::Seek { current_time, seq, .. } => {
            if sender_is_host(room, client_key) {
                apply_host_command(room, PlaybackCommand::Seek, current_time, seq);
            } else {
                tracing::warn!(room_id = %room.id, "seek command from non-host ignored");
            }
        }
        ClientMessage::State => {
            let is_host = sender_is_host(room, client_key);
            broadcast::send(&sender, &sync_frame(room, Some(is_host)));
        }
        ClientMessage::HostHeartbeat { .. } => {
            if sender_is_host(room, client_key) {
                room.state().host_last_heartbeat = now_ms();
            }
        }
        ClientMessage::UpdateMetrics { metrics } => {
            if let Some(last_ping) = metrics.last_ping {
                let token = room
                    .clients
                    .get(&client_key)
                    .and_then(|c| c.value().token.clone());
                if let Some(token) = token {
                    if let Some(member) = room.members().get_mut(&token) {
                        member.last_ping_ms = last_ping;
                    }
                }
            }
        }
        ClientMessage::SessionStatus => {
            broadcast::send(&sender, &ServerMessage::SessionStatus(status::project(room)));
        }
    }
}

/// Global 1 Hz tick driving the periodic sync. Each room emits at its own
/// interval (2 s playing, 5 s paused); ended rooms stay quiet.
pub fn spawn_sync_tick_loop(state: AppState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.tick().await;
        loop {
            tick.tick().await;
            state.rooms.for_each(|room| {
                if room.clients.is_empty() {
                    return;
                }
                let is_playing = {
                    let st = room.state();
                    if st.status == RoomStatus::Ended {
                        return;
                    }
                    st.is_playing
                };
                {
                    let mut last = room.last_sync_sent.lock().unwrap_or_else(|e| e.into_inner());
                    if last.elapsed() < sync_interval(is_playing) {
                        return;
                    }
                    *last = Instant::now();
                }
                broadcast::broadcast(room, &sync_frame(room, None));
            });
        }
    });
}
