//! Integration tests for the WebSocket sync protocol: host commands,
//! sequence gating, drift requests, ping/pong, and admission.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use watchparty_server::config::Config;
use watchparty_server::routes;
use watchparty_server::state::AppState;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_test_server() -> (String, AppState) {
    let tmp = tempfile::tempdir().expect("create temp dir");
    let uploads_dir = tmp.path().join("uploads");
    tokio::fs::create_dir_all(&uploads_dir).await.unwrap();

    let config = Config {
        uploads_dir: uploads_dir.to_str().unwrap().to_string(),
        public_dir: tmp.path().join("public").to_str().unwrap().to_string(),
        ..Config::default()
    };

    let state = AppState::new(config);
    let app = routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp;
    });

    (format!("http://{}", addr), state)
}

async fn create_simple_room(client: &reqwest::Client, base: &str, host_id: &str) -> String {
    let body: serde_json::Value = client
        .post(format!("{}/api/session", base))
        .json(&json!({
            "title": "Movie night",
            "movieName": "Solaris",
            "hostId": host_id,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["roomId"].as_str().unwrap().to_string()
}

async fn connect_ws(base: &str, room_id: &str, client_id: &str) -> WsStream {
    let url = format!(
        "{}/ws?room={}&clientId={}",
        base.replace("http", "ws"),
        room_id,
        client_id
    );
    let (socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    socket
}

/// Read frames until one with the given `type` arrives (or time out).
async fn recv_typed(socket: &mut WsStream, wanted: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let frame = tokio::time::timeout(Duration::from_millis(500), socket.next()).await;
        let Ok(Some(Ok(Message::Text(text)))) = frame else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        if value["type"] == wanted {
            return value;
        }
    }
    panic!("timed out waiting for a '{wanted}' frame");
}

async fn send_json(socket: &mut WsStream, value: serde_json::Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn connect_sends_initial_sync_and_projection() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let room_id = create_simple_room(&client, &base, "host-1").await;

    let mut socket = connect_ws(&base, &room_id, "host-1").await;

    let sync = recv_typed(&mut socket, "sync").await;
    assert_eq!(sync["isPlaying"], false);
    assert_eq!(sync["currentTime"], 0.0);
    assert_eq!(sync["isHost"], true);
    assert!(sync["serverTime"].as_i64().unwrap() > 0);

    let status = recv_typed(&mut socket, "session-status").await;
    assert_eq!(status["status"], "waiting");
    assert_eq!(status["movieName"], "Solaris");
}

#[tokio::test]
async fn play_pause_roundtrip_reaches_viewers() {
    let (base, state) = start_test_server().await;
    let client = reqwest::Client::new();
    let room_id = create_simple_room(&client, &base, "host-1").await;

    let mut host = connect_ws(&base, &room_id, "host-1").await;
    let mut viewer = connect_ws(&base, &room_id, "viewer-1").await;

    // Drain the viewer's initial sync so the next one is command-driven.
    recv_typed(&mut viewer, "sync").await;

    send_json(&mut host, json!({"type": "play", "currentTime": 0.0, "seq": 1})).await;
    let sync = recv_typed(&mut viewer, "sync").await;
    assert_eq!(sync["isPlaying"], true);
    assert_eq!(sync["currentTime"], 0.0);

    send_json(&mut host, json!({"type": "pause", "currentTime": 3.0, "seq": 2})).await;
    let sync = recv_typed(&mut viewer, "sync").await;
    assert_eq!(sync["isPlaying"], false);
    assert_eq!(sync["currentTime"], 3.0);

    // Replayed seq is a no-op: the room state stays paused at 3.0.
    send_json(&mut host, json!({"type": "play", "currentTime": 50.0, "seq": 2})).await;
    send_json(&mut host, json!({"type": "seek", "currentTime": 7.5, "seq": 3})).await;
    let sync = recv_typed(&mut viewer, "sync").await;
    assert_eq!(sync["currentTime"], 7.5);
    assert_eq!(sync["isPlaying"], false, "seek preserves the paused state");

    let room = state.rooms.get(&room_id).unwrap();
    assert_eq!(room.state().last_command_seq, 3);
}

#[tokio::test]
async fn non_host_commands_are_ignored() {
    let (base, state) = start_test_server().await;
    let client = reqwest::Client::new();
    let room_id = create_simple_room(&client, &base, "host-1").await;

    let mut viewer = connect_ws(&base, &room_id, "viewer-1").await;
    recv_typed(&mut viewer, "sync").await;

    send_json(&mut viewer, json!({"type": "play", "currentTime": 10.0, "seq": 1})).await;

    // Ask for state: still paused at zero.
    send_json(&mut viewer, json!({"type": "state"})).await;
    let sync = recv_typed(&mut viewer, "sync").await;
    assert_eq!(sync["isPlaying"], false);
    assert_eq!(sync["currentTime"], 0.0);
    assert_eq!(sync["isHost"], false);

    let room = state.rooms.get(&room_id).unwrap();
    assert_eq!(room.state().last_command_seq, 0);
}

#[tokio::test]
async fn ping_echoes_timestamp_with_server_time() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let room_id = create_simple_room(&client, &base, "host-1").await;

    let mut socket = connect_ws(&base, &room_id, "viewer-1").await;
    send_json(&mut socket, json!({"type": "ping", "timestamp": 987654321})).await;

    let pong = recv_typed(&mut socket, "pong").await;
    assert_eq!(pong["timestamp"], 987654321);
    assert!(pong["serverTime"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn malformed_messages_do_not_kill_the_connection() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let room_id = create_simple_room(&client, &base, "host-1").await;

    let mut socket = connect_ws(&base, &room_id, "viewer-1").await;
    send_json(&mut socket, json!({"type": "dance"})).await;
    socket
        .send(Message::Text("not json at all".to_string().into()))
        .await
        .unwrap();

    // The socket still answers.
    send_json(&mut socket, json!({"type": "ping", "timestamp": 1})).await;
    recv_typed(&mut socket, "pong").await;
}

#[tokio::test]
async fn unknown_room_rejects_the_upgrade() {
    let (base, _state) = start_test_server().await;
    let url = format!("{}/ws?room=ghost&clientId=x", base.replace("http", "ws"));
    let err = tokio_tungstenite::connect_async(&url).await.err().unwrap();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status(), 404);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn discord_room_requires_a_valid_token_for_ws() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{}/api/discord-session", base))
        .json(&json!({
            "title": "t",
            "movieName": "m",
            "discordSession": {
                "channelId": "c", "messageId": "m", "guildId": "g",
                "hostDiscordId": "host-1", "hostUsername": "Nina"
            }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room_id = created["roomId"].as_str().unwrap();
    let host_token = created["hostToken"].as_str().unwrap();

    // No token: 403 on upgrade.
    let url = format!("{}/ws?room={}&clientId=x", base.replace("http", "ws"), room_id);
    let err = tokio_tungstenite::connect_async(&url).await.err().unwrap();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status(), 403);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    // Valid token: connects and the initial sync marks the host.
    let url = format!(
        "{}/ws?room={}&clientId=x&token={}",
        base.replace("http", "ws"),
        room_id,
        host_token
    );
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let sync = recv_typed(&mut socket, "sync").await;
    assert_eq!(sync["isHost"], true);
}

#[tokio::test]
async fn eleventh_client_is_closed_with_4003() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let room_id = create_simple_room(&client, &base, "host-1").await;

    let mut held = Vec::new();
    for i in 0..10 {
        let mut socket = connect_ws(&base, &room_id, &format!("viewer-{i}")).await;
        // Wait for the initial sync so this client is fully attached before
        // the next one races the admission check.
        recv_typed(&mut socket, "sync").await;
        held.push(socket);
    }

    // The 11th upgrade succeeds but is immediately closed with 4003.
    let mut rejected = connect_ws(&base, &room_id, "viewer-10").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the 4003 close"
        );
        match tokio::time::timeout(Duration::from_millis(500), rejected.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                assert_eq!(u16::from(frame.code), 4003);
                break;
            }
            Ok(None) => panic!("connection ended without a close frame"),
            _ => continue,
        }
    }
}
