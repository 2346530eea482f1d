//! Upload orchestration for the chunked upload service.
//!
//! An [`Orchestrator`] drives a single file through hashing, strategy
//! selection, bounded-concurrency chunk dispatch with per-chunk retries,
//! and the final merge. The [`UploadRegistry`] owns many orchestrators and
//! fans their state changes out to observers.

pub mod control;
pub mod error;
pub mod events;
pub mod memory;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod transport;
pub mod types;

pub use control::TaskControl;
pub use error::UploadError;
pub use events::{EventBus, Observer, SubscriptionId};
pub use memory::InMemoryTransport;
pub use orchestrator::Orchestrator;
pub use registry::UploadRegistry;
pub use retry::{ChunkVerdict, RetryPolicy};
pub use transport::{
    ByteProgress, ChunkPayload, ProgressSender, SimplePayload, TransportError, TransportFuture,
    UploadTransport,
};
pub use types::{
    TaskId, TaskSnapshot, TaskStatus, TaskSummary, UploadEvent, UploadStrategy, UploadTask,
    UploaderSettings,
};
