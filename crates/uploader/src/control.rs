use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Shared pause/cancel signals for one task.
///
/// Cloning is cheap; every clone observes the same signals. Pausing is
/// honored between dispatches and can be lifted again, cancellation is
/// final.
#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops dispatching new chunks; in-flight ones are allowed to finish.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Aborts the task; in-flight results are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that resolves once [`cancel`](Self::cancel) is called.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
