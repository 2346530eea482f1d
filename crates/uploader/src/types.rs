//! Data types for upload tasks.

use chunkup_protocol::FileMetadata;
use chunkup_transfer::{ChunkDescriptor, DEFAULT_SLICE_SIZE};
use serde::{Deserialize, Serialize};

/// Locally unique task identifier.
pub type TaskId = String;

/// How a file is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// One request carrying the whole file.
    Simple,
    /// Init, parallel chunk uploads, then merge.
    Chunked,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Hashing,
    Uploading,
    Merging,
    Success,
    Error,
    Paused,
    Cancelled,
}

impl TaskStatus {
    /// Success and Cancelled accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Cancelled)
    }

    /// Whether a worker is currently driving the task.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Hashing | Self::Uploading | Self::Merging)
    }

    /// Returns `true` if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Success | Cancelled, _) => false,
            (_, Cancelled) => true,
            (_, Error) => !matches!(self, Error),
            (Pending, Hashing) => true,
            (Hashing, Uploading) => true,
            (Uploading, Merging | Success | Paused) => true,
            (Merging, Success) => true,
            (Paused | Error, Uploading) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Hashing => "hashing",
            Self::Uploading => "uploading",
            Self::Merging => "merging",
            Self::Success => "success",
            Self::Error => "error",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tuning knobs for the uploader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderSettings {
    /// Maximum chunk requests in flight per task.
    pub concurrency: usize,
    /// Total attempts per chunk, including the first.
    pub max_attempts: u32,
    /// Files at or below this size use the simple strategy. Defaults to the
    /// server's chunk size when unset.
    pub chunk_threshold: Option<u64>,
    /// Bytes read per step while hashing.
    pub slice_size: u64,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            chunk_threshold: None,
            slice_size: DEFAULT_SLICE_SIZE,
        }
    }
}

/// Full state of one upload, owned by its orchestrator.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// Whole-file MD5 hex, computed once and reused across retries.
    pub digest: Option<String>,
    pub strategy: Option<UploadStrategy>,
    pub status: TaskStatus,
    /// 0 to 100.
    pub progress: f64,
    /// Server-assigned id, known after init (chunked) or success (simple).
    pub file_id: Option<String>,
    pub error: Option<String>,
    /// Empty until a chunked upload is planned.
    pub chunks: Vec<ChunkDescriptor>,
    pub deduplicated: bool,
    pub metadata: Option<FileMetadata>,
}

impl UploadTask {
    pub fn new(
        id: TaskId,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id,
            filename: filename.into(),
            mime_type: mime_type.into(),
            size,
            digest: None,
            strategy: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            file_id: None,
            error: None,
            chunks: Vec::new(),
            deduplicated: false,
            metadata: None,
        }
    }

    pub fn chunk_total(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn uploaded_chunks(&self) -> u32 {
        self.chunks.iter().filter(|c| c.uploaded).count() as u32
    }

    pub fn all_chunks_uploaded(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.uploaded)
    }

    /// Percentage of acknowledged chunks.
    pub fn chunk_progress(&self) -> f64 {
        let total = self.chunk_total();
        if total == 0 {
            return 0.0;
        }
        f64::from(self.uploaded_chunks()) / f64::from(total) * 100.0
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            status: self.status,
            strategy: self.strategy,
            progress: self.progress,
            digest: self.digest.clone(),
            file_id: self.file_id.clone(),
            error: self.error.clone(),
            uploaded_chunks: self.uploaded_chunks(),
            chunk_total: self.chunk_total(),
            deduplicated: self.deduplicated,
            metadata: self.metadata.clone(),
        }
    }
}

/// Read-only view of a task handed to observers and callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: TaskId,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<UploadStrategy>,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(rename = "fileID", skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub uploaded_chunks: u32,
    pub chunk_total: u32,
    pub deduplicated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

/// Change notification emitted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// A task was added.
    Submitted { task_id: TaskId },
    /// Lifecycle transition.
    StatusChanged { task_id: TaskId, status: TaskStatus },
    /// Progress moved forward.
    Progress { task_id: TaskId, progress: f64 },
    /// Progress moved backwards because the upload restarts from an
    /// earlier point.
    ProgressReset { task_id: TaskId, progress: f64 },
    /// Bytes written for an in-flight request.
    BytesTransferred {
        task_id: TaskId,
        chunk_index: Option<u32>,
        bytes_sent: u64,
        bytes_total: u64,
    },
    /// The server acknowledged a chunk.
    ChunkUploaded {
        task_id: TaskId,
        index: u32,
        uploaded: u32,
        total: u32,
    },
    /// A chunk failed and was requeued.
    ChunkRetry {
        task_id: TaskId,
        index: u32,
        attempt: u32,
        error: String,
    },
    /// The file is stored on the server.
    Completed { task_id: TaskId },
    /// The task entered the error state.
    Failed { task_id: TaskId, error: String },
    /// The task was dropped from the registry.
    Removed { task_id: TaskId },
}

impl UploadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Submitted { task_id }
            | Self::StatusChanged { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::ProgressReset { task_id, .. }
            | Self::BytesTransferred { task_id, .. }
            | Self::ChunkUploaded { task_id, .. }
            | Self::ChunkRetry { task_id, .. }
            | Self::Completed { task_id }
            | Self::Failed { task_id, .. }
            | Self::Removed { task_id } => task_id,
        }
    }
}

/// Persistable state of a chunked upload, enough to resume it after the
/// process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub digest: String,
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub chunks: Vec<ChunkDescriptor>,
}
