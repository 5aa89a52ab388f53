use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::rooms::room::now_ms;

/// Metadata for one active chunked upload. Lives in memory while chunks
/// arrive; mirrored to `<dir>/meta.json` at init, complete, and abort only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub room_id: String,
    pub upload_id: String,
    pub filename: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    pub received_chunks: BTreeSet<u32>,
    pub created_at: i64,
    pub last_activity: i64,
}

impl UploadMeta {
    pub fn new(
        room_id: String,
        upload_id: String,
        filename: String,
        total_chunks: u32,
        chunk_size: u64,
        total_size: u64,
    ) -> Self {
        let now = now_ms();
        Self {
            room_id,
            upload_id,
            filename,
            total_chunks,
            chunk_size,
            total_size,
            received_chunks: BTreeSet::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Upload progress in percent, capped at 99 until `complete` flips it.
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        let pct = self.received_chunks.len() as u64 * 100 / u64::from(self.total_chunks);
        pct.min(99) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() == self.total_chunks as usize
    }

    pub async fn persist(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(dir.join("meta.json"), json).await
    }

    pub async fn load(dir: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(dir.join("meta.json")).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Collapse every character outside `[A-Za-z0-9._-]` to `_`. The result can
/// never traverse out of its directory.
pub fn sanitize_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    // A name of only dots could still walk the tree; flatten it.
    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        safe
    }
}

/// Resolve `.` and `..` components without touching the filesystem, so a
/// not-yet-created path cannot smuggle a parent reference past the prefix
/// check below.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Whether `candidate` resolves inside `root`. Candidates that do not exist
/// yet are normalized lexically and anchored at their canonical parent.
pub fn path_is_within(root: &Path, candidate: &Path) -> bool {
    let root = match root.canonicalize() {
        Ok(r) => r,
        Err(_) => normalize_lexically(root),
    };

    let resolved = match candidate.canonicalize() {
        Ok(c) => c,
        Err(_) => {
            let normalized = normalize_lexically(candidate);
            let parent = normalized.parent().map(Path::to_path_buf);
            let name = normalized.file_name().map(std::ffi::OsStr::to_os_string);
            match (parent, name) {
                (Some(parent), Some(name)) => match parent.canonicalize() {
                    Ok(p) => p.join(name),
                    Err(_) => normalized,
                },
                _ => normalized,
            }
        }
    };

    resolved.starts_with(&root)
}

/// Join a client-supplied file name onto the uploads root, refusing anything
/// that escapes it.
pub fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let joined = root.join(relative);
    if path_is_within(root, &joined) {
        Some(joined)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_hostile_characters() {
        assert_eq!(sanitize_filename("movie final.mkv"), "movie_final.mkv");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("café💣.mp4"), "caf___.mp4");
        assert_eq!(sanitize_filename("ok-name_1.2.srt"), "ok-name_1.2.srt");
    }

    #[test]
    fn sanitize_never_returns_dot_only_names() {
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename(""), "file");
    }

    #[test]
    fn progress_caps_at_99_before_complete() {
        let mut meta = UploadMeta::new("r".into(), "r_1".into(), "f".into(), 4, 10, 40);
        assert_eq!(meta.progress(), 0);
        meta.received_chunks.insert(0);
        meta.received_chunks.insert(1);
        assert_eq!(meta.progress(), 50);
        meta.received_chunks.insert(2);
        meta.received_chunks.insert(3);
        // All chunks present still reports 99; only `complete` reports 100.
        assert_eq!(meta.progress(), 99);
        assert!(meta.is_complete());
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let root = std::env::temp_dir();
        assert!(resolve_within(&root, "fine.srt").is_some());
        assert!(resolve_within(&root, "../escape.srt").is_none());
        assert!(resolve_within(&root, "a/../../escape.srt").is_none());
    }
}
