//! Task summaries and observer fan-out shared by the registry and the
//! orchestrators it owns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::{TaskId, TaskStatus, TaskSummary, UploadEvent};

/// Callback invoked for every event.
pub type Observer = Arc<dyn Fn(&UploadEvent) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Latest summary of every known task plus the registered observers.
///
/// Summaries are kept in insertion order. Observers run synchronously on
/// the publishing task after the summary has been updated, so a callback
/// that reads the bus sees the state the event describes.
#[derive(Default)]
pub struct EventBus {
    tasks: RwLock<TaskTable>,
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct TaskTable {
    order: Vec<TaskId>,
    summaries: HashMap<TaskId, TaskSummary>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer.
    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    /// Removes an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    /// Stores `summary` and notifies observers of `event`.
    ///
    /// A task already marked cancelled stays cancelled.
    pub fn publish(&self, mut summary: TaskSummary, event: UploadEvent) {
        {
            let mut table = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            match table.summaries.get(&summary.id) {
                Some(current) if current.status == TaskStatus::Cancelled => {
                    summary.status = TaskStatus::Cancelled;
                }
                Some(_) => {}
                None => table.order.push(summary.id.clone()),
            }
            table.summaries.insert(summary.id.clone(), summary);
        }
        self.notify(&event);
    }

    /// Marks a task cancelled ahead of its orchestrator and emits the
    /// status change. Returns `false` for unknown or finished tasks.
    pub fn cancel(&self, task_id: &str) -> bool {
        {
            let mut table = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            match table.summaries.get_mut(task_id) {
                Some(summary) if !summary.status.is_terminal() => {
                    summary.status = TaskStatus::Cancelled;
                }
                _ => return false,
            }
        }
        self.notify(&UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            status: TaskStatus::Cancelled,
        });
        true
    }

    /// Returns `true` if the task's published status is cancelled.
    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.summary(task_id)
            .is_some_and(|s| s.status == TaskStatus::Cancelled)
    }

    /// Drops a task and emits [`UploadEvent::Removed`].
    pub fn remove(&self, task_id: &str) -> Option<TaskSummary> {
        let removed = {
            let mut table = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
            table.order.retain(|id| id != task_id);
            table.summaries.remove(task_id)
        };
        if removed.is_some() {
            self.notify(&UploadEvent::Removed {
                task_id: task_id.to_string(),
            });
        }
        removed
    }

    pub fn summary(&self, task_id: &str) -> Option<TaskSummary> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .summaries
            .get(task_id)
            .cloned()
    }

    /// All summaries, oldest first.
    pub fn summaries(&self) -> Vec<TaskSummary> {
        let table = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        table
            .order
            .iter()
            .filter_map(|id| table.summaries.get(id).cloned())
            .collect()
    }

    fn notify(&self, event: &UploadEvent) {
        // Snapshot the list so callbacks may subscribe or unsubscribe.
        let observers: Vec<Observer> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer(event);
        }
    }
}
