//! Transport abstraction over the upload service.
//!
//! The orchestrator only talks to the server through [`UploadTransport`],
//! so the HTTP client and the in-memory fake are interchangeable.

use std::future::Future;
use std::pin::Pin;

use chunkup_protocol::{
    ApiError, ChunkUploadResponse, FileMetadata, InitChunkedRequest, InitChunkedResponse,
    ServerProgress, UploadConfig,
};
use tokio::sync::mpsc;

/// Boxed future returned by transport calls.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Failure classes a transport reports.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Network failure, timeout or server fault. Worth retrying.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Well-formed rejection from the server. Never retried.
    #[error("server rejected request ({code}): {message}")]
    Protocol { code: i32, message: String },

    /// Session missing or expired.
    #[error("session expired or unauthorized")]
    Unauthorized,
}

impl TransportError {
    /// Returns `true` for failures the retry policy may requeue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ApiError> for TransportError {
    fn from(e: ApiError) -> Self {
        if e.is_unauthorized() {
            Self::Unauthorized
        } else if e.is_server_fault() {
            Self::Transient(e.to_string())
        } else {
            Self::Protocol {
                code: e.code,
                message: e.message,
            }
        }
    }
}

/// Bytes written so far for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteProgress {
    /// `None` for a simple (single-request) upload.
    pub chunk_index: Option<u32>,
    pub bytes_sent: u64,
    pub bytes_total: u64,
}

/// Reports [`ByteProgress`] for a single request back to the orchestrator.
///
/// Sends never block and are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ByteProgress>,
    chunk_index: Option<u32>,
}

impl ProgressSender {
    pub fn new(tx: mpsc::UnboundedSender<ByteProgress>, chunk_index: Option<u32>) -> Self {
        Self { tx, chunk_index }
    }

    /// A sender nobody listens to.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(tx, None)
    }

    pub fn chunk_index(&self) -> Option<u32> {
        self.chunk_index
    }

    pub fn report(&self, bytes_sent: u64, bytes_total: u64) {
        let _ = self.tx.send(ByteProgress {
            chunk_index: self.chunk_index,
            bytes_sent,
            bytes_total,
        });
    }
}

/// One chunk ready to send.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub file_id: String,
    pub index: u32,
    /// MD5 hex of `data`.
    pub digest: String,
    pub data: Vec<u8>,
}

/// A whole file sent in one request.
#[derive(Debug, Clone)]
pub struct SimplePayload {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// The operations the upload service exposes.
///
/// Implementations must be safe to call concurrently; the orchestrator keeps
/// several `upload_chunk` calls in flight at once.
pub trait UploadTransport: Send + Sync {
    /// Fetches the server's upload constraints.
    fn fetch_config(&self) -> TransportFuture<'_, UploadConfig>;

    /// Registers a chunked upload. Repeating the call with the same digest
    /// returns the same file id.
    fn init_chunked_upload(
        &self,
        request: InitChunkedRequest,
    ) -> TransportFuture<'_, InitChunkedResponse>;

    /// Sends one chunk.
    fn upload_chunk(
        &self,
        chunk: ChunkPayload,
        progress: ProgressSender,
    ) -> TransportFuture<'_, ChunkUploadResponse>;

    /// Asks the server to assemble all chunks of `file_id`.
    fn merge_chunks(&self, file_id: String) -> TransportFuture<'_, FileMetadata>;

    /// Uploads a small file in one request.
    fn simple_upload(
        &self,
        file: SimplePayload,
        progress: ProgressSender,
    ) -> TransportFuture<'_, FileMetadata>;

    /// Reports how many chunks the server holds for `file_id`.
    fn get_progress(&self, file_id: String) -> TransportFuture<'_, ServerProgress>;
}
