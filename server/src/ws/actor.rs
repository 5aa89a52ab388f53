use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::limits;
use crate::rooms::registry;
use crate::rooms::room::{now_ms, ClientHandle, Room, RoomStatus};
use crate::rooms::status;
use crate::state::AppState;
use crate::sync::engine;
use crate::sync::protocol::{ClientMessage, ServerMessage};
use crate::ws::{broadcast, CLOSE_ADMISSION_DENIED};

/// Server-initiated heartbeat round. A socket that has not ponged since the
/// previous round is terminated.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Run the actor-per-connection pattern for an admitted room socket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from an mpsc channel
/// - Reader loop: decodes JSON messages, dispatches to the sync engine
///
/// The mpsc sender is registered in the room's client set so broadcasts and
/// background loops can reach this client.
pub async fn run_connection(
    socket: WebSocket,
    state: AppState,
    room: Arc<Room>,
    client_id: String,
    token: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Admission runs after the upgrade so the browser sees the close code.
    if let Err(reason) = limits::check_room_admission(&room).await {
        tracing::warn!(room_id = %room.id, client_id = %client_id, reason = %reason, "admission denied");
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_ADMISSION_DENIED,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let client_key = room.attach_client(ClientHandle {
        client_id: client_id.clone(),
        token: token.clone(),
        sender: tx.clone(),
        connected_at: now_ms(),
    });

    // Promote the member behind this token to connected.
    if let Some(token) = &token {
        let mut members = room.members();
        if let Some(member) = members.get_mut(token) {
            if !member.connected {
                member.connected = true;
                member.connected_at = now_ms();
            }
        }
    }

    tracing::info!(
        room_id = %room.id,
        client_id = %client_id,
        clients = room.clients.len(),
        "WebSocket client connected"
    );

    send_initial_frames(&room, client_key, &tx);
    broadcast::schedule_viewers_broadcast(room.clone());

    // Writer task: forwards queued frames to the socket sink.
    let writer_handle = tokio::spawn(async move {
        let mut rx = rx;
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Heartbeat: one ping per round, terminate when the previous round's
    // pong never arrived.
    let pong_seen = Arc::new(AtomicBool::new(true));
    let ping_handle = tokio::spawn({
        let ping_tx = tx.clone();
        let pong_seen = pong_seen.clone();
        async move {
            let mut timer = interval(PING_INTERVAL);
            timer.tick().await;
            loop {
                timer.tick().await;
                if !pong_seen.swap(false, Ordering::SeqCst) {
                    tracing::warn!("heartbeat pong missed, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Heartbeat timeout".into(),
                    })));
                    break;
                }
                if ping_tx.send(Message::Ping(vec![0xb, 0xe, 0xa, 0x7].into())).is_err() {
                    break;
                }
            }
        }
    });

    // Reader loop.
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(parsed) => engine::handle_message(&room, client_key, parsed),
                    Err(e) => {
                        tracing::debug!(
                            room_id = %room.id,
                            client_id = %client_id,
                            error = %e,
                            "unparseable client message dropped"
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_seen.store(true, Ordering::SeqCst);
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::debug!(
                        room_id = %room.id,
                        client_id = %client_id,
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
                Message::Binary(_) => {
                    // The protocol is JSON text frames only.
                }
            },
            Some(Err(e)) => {
                tracing::debug!(room_id = %room.id, client_id = %client_id, error = %e, "WebSocket receive error");
                break;
            }
            None => break,
        }
    }

    writer_handle.abort();
    ping_handle.abort();

    let room_empty = room.detach_client(client_key);

    if let Some(token) = &token {
        if !room.token_has_live_socket(token) {
            let mut members = room.members();
            if let Some(member) = members.get_mut(token) {
                member.connected = false;
            }
        }
    }

    broadcast::schedule_viewers_broadcast(room.clone());

    if room_empty && room.status() == RoomStatus::Ended {
        registry::schedule_ended_room_cleanup(state.clone(), room.id.clone());
    }

    tracing::info!(
        room_id = %room.id,
        client_id = %client_id,
        clients = room.clients.len(),
        "WebSocket client disconnected"
    );
}

/// Initial state pushed to a freshly admitted client: the current sync
/// reference, the session projection, and (host only) any in-flight upload
/// or processing progress.
fn send_initial_frames(room: &Arc<Room>, client_key: u64, tx: &crate::ws::ConnectionSender) {
    let is_host = {
        let client = room.clients.get(&client_key).map(|c| c.value().clone());
        match client {
            Some(c) => match &c.token {
                Some(token) => room
                    .members()
                    .get(token)
                    .map(|m| m.is_host)
                    .unwrap_or(false),
                None => {
                    let host_id = room.state().host_id.clone();
                    !host_id.is_empty() && c.client_id == host_id
                }
            },
            None => false,
        }
    };

    broadcast::send(tx, &engine::sync_frame(room, Some(is_host)));
    broadcast::send(tx, &ServerMessage::SessionStatus(status::project(room)));

    if is_host {
        let (uploading, progress, processing, message) = {
            let st = room.state();
            (
                st.is_uploading,
                st.upload_progress,
                st.is_processing,
                st.processing_message.clone(),
            )
        };
        if uploading {
            broadcast::send(tx, &ServerMessage::UploadProgress { progress });
        }
        if processing {
            broadcast::send(tx, &ServerMessage::ProcessingProgress { message });
        }
    }
}
