//! Paused uploads persisted between runs.

use std::path::{Path, PathBuf};

use chunkup_uploader::TaskSnapshot;
use serde::{Deserialize, Serialize};

/// A paused upload and the local file it reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedUpload {
    pub path: PathBuf,
    pub snapshot: TaskSnapshot,
}

/// Reads saved uploads from `path`. A missing file holds no uploads.
pub fn load(path: &Path) -> anyhow::Result<Vec<SavedUpload>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes `uploads` to `path`, removing the file when there is nothing to
/// resume.
pub fn save(path: &Path, uploads: &[SavedUpload]) -> anyhow::Result<()> {
    if uploads.is_empty() {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(uploads)?)?;
    tracing::info!(path = %path.display(), count = uploads.len(), "paused uploads saved");
    Ok(())
}
