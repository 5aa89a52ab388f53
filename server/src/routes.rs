use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::limits;
use crate::rooms::{ratings, sessions};
use crate::state::AppState;
use crate::streaming;
use crate::upload::handlers as upload;
use crate::ws;

/// Upper bound on request bodies; upload chunks are typically a few MiB.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = state.config.origin_list();
    if origins.is_empty() {
        // No allow-list configured: permissive.
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/discord-session",
            post(sessions::create_discord_session),
        )
        .route("/api/session", post(sessions::create_local_session))
        .route(
            "/api/session-token/{room_id}",
            post(sessions::create_session_token),
        )
        .route(
            "/api/validate-token/{room_id}",
            get(sessions::validate_token),
        )
        .route(
            "/api/session-status/{room_id}",
            get(sessions::session_status),
        )
        .route(
            "/api/session-rating/{room_id}",
            post(ratings::submit_rating),
        )
        .route(
            "/api/discord-end-session/{room_id}",
            post(sessions::end_session),
        )
        .route(
            "/api/discord-finalize-session/{room_id}",
            post(sessions::finalize_session),
        );

    let upload_routes = Router::new()
        .route("/api/upload/init/{room_id}", post(upload::init_upload))
        .route(
            "/api/upload/chunk/{room_id}/{upload_id}/{chunk_index}",
            post(upload::upload_chunk),
        )
        .route(
            "/api/upload/status/{room_id}/{upload_id}",
            get(upload::upload_status),
        )
        .route(
            "/api/upload/complete/{room_id}/{upload_id}",
            post(upload::complete_upload),
        )
        .route(
            "/api/upload/abort/{room_id}/{upload_id}",
            post(upload::abort_upload),
        )
        .route("/api/upload/subtitle/{room_id}", post(upload::upload_subtitle))
        .route(
            "/api/upload/subtitle/{room_id}/{filename}",
            get(upload::download_subtitle),
        );

    let media_routes = Router::new()
        .route("/video/{room_id}", get(streaming::stream_video))
        .route("/ws", get(ws::handler::ws_upgrade));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(api)
        .merge(upload_routes)
        .merge(media_routes)
        .merge(health)
        .fallback_service(ServeDir::new(&state.config.public_dir))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            limits::rate_limit_middleware,
        ))
        .layer(cors_layer(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
