use std::sync::Arc;

use crate::config::Config;
use crate::limits::RateLimiter;
use crate::rooms::registry::RoomRegistry;
use crate::upload::store::UploadStore;

/// Shared application state passed to all handlers via the axum State
/// extractor. Each registry confines its own mutable state; components never
/// reach across one another to mutate.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide room map (at most one active session).
    pub rooms: Arc<RoomRegistry>,
    /// Chunked upload engine and file-handle pool.
    pub uploads: Arc<UploadStore>,
    /// Per-IP request budget.
    pub limiter: RateLimiter,
    /// Loaded configuration.
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let uploads_root = std::path::PathBuf::from(&config.uploads_dir);
        Self {
            rooms: Arc::new(RoomRegistry::new(uploads_root.clone())),
            uploads: Arc::new(UploadStore::new(uploads_root)),
            limiter: RateLimiter::default(),
            config: Arc::new(config),
        }
    }
}
