use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;

use watchparty_server::config::{generate_config_template, Config};
use watchparty_server::limits;
use watchparty_server::rooms::{membership, registry};
use watchparty_server::routes;
use watchparty_server::state::AppState;
use watchparty_server::sync::engine;
use watchparty_server::upload::store;

/// Hard deadline for in-flight requests after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "watchparty_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "watchparty_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("watchparty-server v{} starting", env!("CARGO_PKG_VERSION"));

    // The uploads root is the only writable persistent state.
    tokio::fs::create_dir_all(&config.uploads_dir).await?;

    let state = AppState::new(config.clone());

    // Background loops: idle-room sweep, host-inactivity check, periodic
    // sync tick, upload TTL GC, handle sweeper, rate-limit bucket purge.
    registry::spawn_cleanup_loop(state.clone());
    membership::spawn_host_check_loop(state.clone());
    engine::spawn_sync_tick_loop(state.clone());
    store::spawn_ttl_gc(state.clone());
    store::spawn_handle_sweeper(state.clone());
    limits::spawn_bucket_purge_loop(state.clone());

    let app = routes::build_router(state.clone());

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    Ok(())
}

/// Wait for SIGINT/SIGTERM, then close every WebSocket with 1001 and arm the
/// force-exit timer while axum drains in-flight requests.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("shutdown signal received, closing sessions");

    state.rooms.for_each(|room| {
        for entry in room.clients.iter() {
            let _ = entry.value().sender.send(axum::extract::ws::Message::Close(Some(
                axum::extract::ws::CloseFrame {
                    code: 1001,
                    reason: "Server shutting down".into(),
                },
            )));
        }
    });

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::warn!("drain deadline exceeded, forcing exit");
        std::process::exit(0);
    });
}
