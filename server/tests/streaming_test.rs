//! Integration tests for byte-range video delivery and subtitle download.

use std::net::SocketAddr;

use serde_json::json;
use tokio::net::TcpListener;

use watchparty_server::config::Config;
use watchparty_server::routes;
use watchparty_server::state::AppState;

const TEN_MIB: usize = 10 * 1024 * 1024;

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

/// Create a room and publish a generated video file of `size` bytes.
async fn room_with_video(base: &str, state: &AppState, size: usize) -> String {
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
    let room_id = created["roomId"].as_str().unwrap().to_string();

    let path = state.uploads.root().join(format!("{}_movie.mp4", room_id));
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&path, &data).await.unwrap();

    state.rooms.get(&room_id).unwrap().state().video_path = Some(path);
    room_id
}

#[tokio::test]
async fn open_range_returns_a_four_mib_slice() {
    let (base, state) = start_test_server().await;
    let room_id = room_with_video(&base, &state, TEN_MIB).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/video/{}", base, room_id))
        .header("Range", "bytes=0-")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers()["content-range"],
        "bytes 0-4194303/10485760"
    );
    assert_eq!(resp.headers()["content-length"], "4194304");
    assert_eq!(resp.headers()["accept-ranges"], "bytes");
    assert_eq!(resp.headers()["cache-control"], "no-cache");
    assert_eq!(resp.headers()["content-type"], "video/mp4");

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 4_194_304);
    assert_eq!(body[0], 0);
    assert_eq!(body[1], 1);
}

#[tokio::test]
async fn tail_range_runs_to_the_file_end() {
    let (base, state) = start_test_server().await;
    let room_id = room_with_video(&base, &state, TEN_MIB).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/video/{}", base, room_id))
        .header("Range", "bytes=9000000-")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.headers()["content-range"],
        "bytes 9000000-10485759/10485760"
    );
    assert_eq!(resp.headers()["content-length"], "1485760");

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 1_485_760);
    assert_eq!(body[0], (9_000_000usize % 251) as u8);
}

#[tokio::test]
async fn no_range_streams_the_whole_file() {
    let (base, state) = start_test_server().await;
    let room_id = room_with_video(&base, &state, 64 * 1024).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/video/{}", base, room_id))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "65536");
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 65536);
}

#[tokio::test]
async fn out_of_bounds_start_is_unsatisfiable() {
    let (base, state) = start_test_server().await;
    let room_id = room_with_video(&base, &state, 1024).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/video/{}", base, room_id))
        .header("Range", "bytes=4096-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);
    assert_eq!(resp.headers()["content-range"], "bytes */1024");
}

#[tokio::test]
async fn missing_video_is_404() {
    let (base, _state) = start_test_server().await;
    let client = reqwest::Client::new();

    // Unknown room.
    let resp = client
        .get(format!("{}/video/ghost", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Known room, nothing published yet.
    let created: serde_json::Value = client
        .post(format!("{}/api/session", base))
        .json(&json!({"title": "t", "movieName": "m", "hostId": "host-1"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let resp = client
        .get(format!("{}/video/{}", base, created["roomId"].as_str().unwrap()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn legacy_encoded_subtitles_are_served_as_utf8() {
    let (base, state) = start_test_server().await;
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

    let dir = state.uploads.root().join(format!("{}_subtitles", room_id));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    // "café" in Windows-1252: the 0xE9 byte is invalid UTF-8.
    let mut bytes = b"1\n00:00:01,000 --> 00:00:02,000\ncaf".to_vec();
    bytes.push(0xE9);
    bytes.push(b'\n');
    let filename = format!("{}_sub_2_fre.srt", room_id);
    tokio::fs::write(dir.join(&filename), &bytes).await.unwrap();

    let resp = client
        .get(format!("{}/api/upload/subtitle/{}/{}", base, room_id, filename))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = resp.text().await.unwrap();
    assert!(text.contains("café"));

    // Traversal attempts never reach the filesystem.
    let resp = client
        .get(format!(
            "{}/api/upload/subtitle/{}/..%2F..%2Fetc%2Fpasswd",
            base, room_id
        ))
        .send()
        .await
        .unwrap();
    assert!(resp.status() == 400 || resp.status() == 404);

    // Unknown file is a 404.
    let resp = client
        .get(format!(
            "{}/api/upload/subtitle/{}/{}_sub_9_und.srt",
            base, room_id, room_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
