use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE, default_allowed_mime_types};

/// Server-communicated upload limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    pub max_file_size: u64,
    /// Allowed MIME types; a type is allowed only when mapped to `true`.
    #[serde(default)]
    pub allowed_mime_types: HashMap<String, bool>,
    /// Signed so that a non-positive value can be reported as a
    /// configuration error instead of failing deserialization.
    pub chunk_size: i64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_mime_types: default_allowed_mime_types(),
            chunk_size: DEFAULT_CHUNK_SIZE as i64,
        }
    }
}

impl UploadConfig {
    /// Returns `true` if `mime_type` is in the allow-list.
    pub fn allows_mime(&self, mime_type: &str) -> bool {
        self.allowed_mime_types
            .get(mime_type)
            .copied()
            .unwrap_or(false)
    }

    /// Returns `true` if `size` is non-zero and within the limit.
    pub fn allows_size(&self, size: u64) -> bool {
        size > 0 && size <= self.max_file_size
    }
}

/// Metadata of a stored file, returned by simple upload and merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub filename: String,
    pub stored_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub extension: String,
    pub md5_hash: String,
    pub file_path: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Body of `POST /upload/chunk/init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChunkedRequest {
    pub filename: String,
    pub file_size: u64,
    pub md5_hash: String,
    pub chunk_size: u64,
}

/// Response of `POST /upload/chunk/init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitChunkedResponse {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub chunk_size: u64,
    pub chunk_total: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub upload_token: String,
}

impl InitChunkedResponse {
    /// Returns the optional upload token (the server sends `""` when unset).
    pub fn upload_token(&self) -> Option<&str> {
        if self.upload_token.is_empty() {
            None
        } else {
            Some(&self.upload_token)
        }
    }
}

/// Response of `POST /upload/chunk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub chunk_index: u32,
    pub chunk_uploaded: u32,
    pub chunk_total: u32,
    pub is_completed: bool,
}

/// Body of `POST /upload/chunk/merge`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    #[serde(rename = "fileID")]
    pub file_id: String,
}

/// Server-side record status, sent as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ServerUploadStatus {
    Uploading,
    Completed,
    Failed,
    Other(i32),
}

impl From<i32> for ServerUploadStatus {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::Uploading,
            2 => Self::Completed,
            3 => Self::Failed,
            other => Self::Other(other),
        }
    }
}

impl From<ServerUploadStatus> for i32 {
    fn from(s: ServerUploadStatus) -> Self {
        match s {
            ServerUploadStatus::Uploading => 1,
            ServerUploadStatus::Completed => 2,
            ServerUploadStatus::Failed => 3,
            ServerUploadStatus::Other(v) => v,
        }
    }
}

/// Response of `GET /upload/progress/{fileID}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProgress {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
    pub chunk_total: u32,
    pub chunk_uploaded: u32,
    pub progress: f64,
    pub status: ServerUploadStatus,
}
