//! Integration tests for end-of-session rating collection.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::StreamExt;
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

/// Create a Discord room and mint tokens for the host plus `viewers` extra
/// members. Returns (room_id, host_token, viewer_tokens).
async fn create_discord_room(
    client: &reqwest::Client,
    base: &str,
    viewers: &[(&str, &str)],
) -> (String, String, Vec<String>) {
    let created: serde_json::Value = client
        .post(format!("{}/api/discord-session", base))
        .json(&json!({
            "title": "Movie night",
            "movieName": "Stalker",
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
    let room_id = created["roomId"].as_str().unwrap().to_string();
    let host_token = created["hostToken"].as_str().unwrap().to_string();

    let mut viewer_tokens = Vec::new();
    for (id, name) in viewers {
        let body: serde_json::Value = client
            .post(format!("{}/api/session-token/{}", base, room_id))
            .json(&json!({"discordId": id, "username": name}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        viewer_tokens.push(body["token"].as_str().unwrap().to_string());
    }

    (room_id, host_token, viewer_tokens)
}

async fn connect_with_token(base: &str, room_id: &str, client_id: &str, token: &str) -> WsStream {
    let url = format!(
        "{}/ws?room={}&clientId={}&token={}",
        base.replace("http", "ws"),
        room_id,
        client_id,
        token
    );
    let (socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    socket
}

async fn submit_rating(
    client: &reqwest::Client,
    base: &str,
    room_id: &str,
    token: &str,
    rating: i64,
) -> reqwest::Response {
    client
        .post(format!("{}/api/session-rating/{}", base, room_id))
        .json(&json!({"token": token, "rating": rating}))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn four_ratings_aggregate_to_the_expected_average() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let (room_id, host_token, viewer_tokens) = create_discord_room(
        &client,
        &base,
        &[("v1", "Amy"), ("v2", "Ben"), ("v3", "Cal")],
    )
    .await;

    // Everyone connects so they all count as "connected" for allRated.
    let mut host_ws = connect_with_token(&base, &room_id, "h", &host_token).await;
    let _v1 = connect_with_token(&base, &room_id, "c1", &viewer_tokens[0]).await;
    let _v2 = connect_with_token(&base, &room_id, "c2", &viewer_tokens[1]).await;
    let _v3 = connect_with_token(&base, &room_id, "c3", &viewer_tokens[2]).await;

    for (token, rating) in [
        (&viewer_tokens[0], 7),
        (&viewer_tokens[1], 8),
        (&viewer_tokens[2], 9),
    ] {
        let resp = submit_rating(&client, &base, &room_id, token, rating).await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["allRated"], false);
    }

    let resp = submit_rating(&client, &base, &room_id, &host_token, 10).await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["allRated"], true);
    assert_eq!(body["average"], 8.5);
    assert_eq!(body["ratings"].as_array().unwrap().len(), 4);

    // The aggregate also goes out over the room socket.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for all-ratings-received"
        );
        let frame = tokio::time::timeout(Duration::from_millis(500), host_ws.next()).await;
        let Ok(Some(Ok(Message::Text(text)))) = frame else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        if value["type"] == "all-ratings-received" {
            assert_eq!(value["average"], 8.5);
            break;
        }
    }
}

#[tokio::test]
async fn rating_is_an_upsert_per_member() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let (room_id, host_token, _) = create_discord_room(&client, &base, &[]).await;
    let _host_ws = connect_with_token(&base, &room_id, "h", &host_token).await;

    let resp = submit_rating(&client, &base, &room_id, &host_token, 3).await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["average"], 3.0);

    let resp = submit_rating(&client, &base, &room_id, &host_token, 9).await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["average"], 9.0);
    assert_eq!(body["ratings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rating_validation_and_authorization() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();
    let (room_id, host_token, _) = create_discord_room(&client, &base, &[]).await;

    // Out-of-range values.
    for bad in [0, 11, -3] {
        let resp = submit_rating(&client, &base, &room_id, &host_token, bad).await;
        assert_eq!(resp.status(), 400, "rating {bad} should be rejected");
    }

    // Wrong token.
    let resp = submit_rating(&client, &base, &room_id, "bogus-token", 5).await;
    assert_eq!(resp.status(), 403);

    // Unknown room.
    let resp = submit_rating(&client, &base, "ghost", &host_token, 5).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn non_discord_rooms_have_no_rating_collection() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{}/api/session", base))
        .json(&json!({"title": "t", "movieName": "m", "hostId": "host-1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room_id = created["roomId"].as_str().unwrap();

    let resp = submit_rating(&client, &base, room_id, "any-token", 5).await;
    assert_eq!(resp.status(), 404);
}
