//! Content hashing, byte sources and chunk planning.
//!
//! The pieces here are pure or blocking; the uploader crate decides when
//! to run them (on `spawn_blocking` for anything that touches disk).

mod digest;
mod planner;
mod source;
mod types;

pub use digest::{DEFAULT_SLICE_SIZE, digest, digest_range, digest_source};
pub use planner::{chunk_count, plan};
pub use source::{ByteSource, FileSource, MemorySource};
pub use types::ChunkDescriptor;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty files are not supported")]
    EmptyFile,

    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(i64),

    #[error("file would need {0} chunks, more than a chunk index can address")]
    TooManyChunks(u64),

    #[error("invalid byte range {start}..{end} for source of {len} bytes")]
    InvalidRange { start: u64, end: u64, len: u64 },
}
