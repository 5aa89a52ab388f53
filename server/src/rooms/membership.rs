use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;

use crate::error::{ApiError, ApiResult};
use crate::rooms::room::{now_ms, Member, Room, RoomStatus, MAX_CLIENTS};
use crate::state::AppState;
use crate::sync::protocol::ServerMessage;
use crate::ws::broadcast;

/// Host considered inactive after this long without a heartbeat or command.
const HOST_INACTIVE_MS: i64 = 60_000;

/// How often the host-inactivity check runs.
const HOST_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Mint an opaque member token: 32 bytes of cryptographic randomness,
/// URL-safe base64 without padding.
fn mint_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Return the existing token for `external_id` if one was already minted
/// (idempotent), else mint a fresh one. The first member of a room becomes
/// its host.
pub fn generate_user_token(
    room: &Room,
    external_id: &str,
    display_name: &str,
) -> ApiResult<String> {
    let mut members = room.members();

    if let Some((token, _)) = members
        .iter()
        .find(|(_, m)| m.external_id == external_id)
    {
        return Ok(token.clone());
    }

    if members.len() >= MAX_CLIENTS {
        return Err(ApiError::conflict("Room is full"));
    }

    let token = mint_token();
    let is_host = members.is_empty();
    members.insert(
        token.clone(),
        Member {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            is_host,
            connected: false,
            connected_at: now_ms(),
            last_ping_ms: 0,
        },
    );

    tracing::debug!(
        room_id = %room.id,
        external_id = %external_id,
        is_host = is_host,
        "member token minted"
    );
    Ok(token)
}

pub fn validate_token(room: &Room, token: &str) -> Option<Member> {
    room.members().get(token).cloned()
}

pub fn is_host_by_token(room: &Room, token: &str) -> bool {
    room.members().get(token).map(|m| m.is_host).unwrap_or(false)
}

/// Run one host-inactivity check against a room, transferring host authority
/// to the longest-connected non-host member when the host has gone quiet.
pub fn check_host_transfer(room: &Arc<Room>) {
    if room.clients.is_empty() {
        return;
    }

    {
        let state = room.state();
        if state.status == RoomStatus::Ended {
            return;
        }
        if state.is_uploading {
            return;
        }
        if now_ms() - state.host_last_heartbeat <= HOST_INACTIVE_MS {
            return;
        }
    }

    // Tokened rooms transfer within the member map; simple rooms have no
    // member records, so their live sockets are the candidate pool.
    let has_members = !room.members().is_empty();
    let candidate = if has_members {
        promote_member(room)
    } else {
        promote_client(room)
    };
    let Some((new_host_id, new_host_name)) = candidate else {
        return;
    };

    {
        let mut state = room.state();
        state.host_last_heartbeat = now_ms();
        state.host_id = new_host_id.clone();
    }

    tracing::info!(
        room_id = %room.id,
        new_host = %new_host_id,
        "host inactive, transferring host authority"
    );

    broadcast::broadcast(
        room,
        &ServerMessage::HostChanged {
            new_host_id,
            new_host_username: new_host_name,
        },
    );
}

/// Promote the longest-connected non-host member and flip the host flags.
fn promote_member(room: &Room) -> Option<(String, String)> {
    let mut members = room.members();

    let candidate_id = members
        .values()
        .filter(|m| m.connected && !m.is_host)
        .min_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.external_id.cmp(&b.external_id))
        })
        .map(|m| m.external_id.clone())?;

    for member in members.values_mut() {
        member.is_host = member.external_id == candidate_id;
    }

    let name = members
        .values()
        .find(|m| m.is_host)
        .map(|m| m.display_name.clone())
        .unwrap_or_default();
    Some((candidate_id, name))
}

/// Simple rooms: promote the longest-attached socket that is not the current
/// host. Host authority there is the `host_id` field, so updating it (done by
/// the caller) is the whole flag flip; the client id doubles as the display
/// name.
fn promote_client(room: &Room) -> Option<(String, String)> {
    let host_id = room.state().host_id.clone();

    let candidate = room
        .clients
        .iter()
        .filter(|entry| entry.value().client_id != host_id)
        .min_by(|a, b| {
            let a = a.value();
            let b = b.value();
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        })
        .map(|entry| entry.value().client_id.clone())?;

    Some((candidate.clone(), candidate))
}

/// Spawn the periodic host-inactivity check across all rooms.
pub fn spawn_host_check_loop(state: AppState) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HOST_CHECK_INTERVAL).await;
            let mut rooms = Vec::new();
            state.rooms.for_each(|room| rooms.push(room.clone()));
            for room in rooms {
                check_host_transfer(&room);
            }
        }
    });
}
