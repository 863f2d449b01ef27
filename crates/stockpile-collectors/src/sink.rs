//! File sink — where collected payloads land.
//!
//! One JSON file per run under `<root>/<kind>/`, timestamped so repeated
//! runs never clobber each other. The returned path is the storage
//! location recorded on the task's result row.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use stockpile_scheduler::{CollectError, Payload};

/// Writes payloads as pretty-printed JSON files under a root directory.
#[derive(Clone)]
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a payload for `kind`, returning the file path. Filesystem
    /// failures are transient: disk pressure and permissions can clear up.
    pub async fn write(&self, kind: &str, payload: &Payload) -> Result<String, CollectError> {
        let dir = self.root.join(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CollectError::Transient(format!("create {}: {e}", dir.display())))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let path = dir.join(format!("{kind}_{stamp}.json"));
        let body = serde_json::to_vec_pretty(payload)
            .map_err(|e| CollectError::Permanent(format!("serialize payload: {e}")))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| CollectError::Transient(format!("write {}: {e}", path.display())))?;

        debug!(path = %path.display(), items = payload.len(), "Payload written");
        Ok(path.display().to_string())
    }
}
