//! Per-chunk retry accounting.

use chunkup_transfer::ChunkDescriptor;

use crate::transport::TransportError;

/// What to do with a chunk after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Put the chunk back at the tail of the pending queue.
    Requeue,
    /// Attempt budget used up; the task fails.
    Exhausted,
    /// Non-retryable failure; the task fails without further attempts.
    Fatal,
}

/// Bounded retry policy applied independently to each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per chunk, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Decides the fate of a request that has now failed `attempts` times.
    pub fn verdict(&self, attempts: u32, error: &TransportError) -> ChunkVerdict {
        if !error.is_retryable() {
            ChunkVerdict::Fatal
        } else if attempts >= self.max_attempts.max(1) {
            ChunkVerdict::Exhausted
        } else {
            ChunkVerdict::Requeue
        }
    }

    /// Records a failed attempt on `chunk` and returns the verdict.
    pub fn judge(&self, chunk: &mut ChunkDescriptor, error: &TransportError) -> ChunkVerdict {
        chunk.attempts += 1;
        self.verdict(chunk.attempts, error)
    }

    /// Gives every chunk still pending a fresh attempt budget.
    pub fn reset(&self, chunks: &mut [ChunkDescriptor]) {
        for chunk in chunks.iter_mut().filter(|c| !c.uploaded) {
            chunk.attempts = 0;
        }
    }
}
