//! Wire protocol types for the chunked upload server API.
//!
//! Every response body is wrapped in an [`ApiEnvelope`]; the types in
//! [`types`] describe the `data` payloads and request bodies.

pub mod constants;
pub mod envelope;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{
    CODE_SUCCESS, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE, DEFAULT_MIME_TYPE,
    mime_for_filename,
};
pub use envelope::{ApiEnvelope, ApiError};
pub use types::{
    ChunkUploadResponse, FileMetadata, InitChunkedRequest, InitChunkedResponse, MergeRequest,
    ServerProgress, ServerUploadStatus, UploadConfig,
};
