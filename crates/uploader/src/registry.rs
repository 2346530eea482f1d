//! Collection of upload tasks with observer notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chunkup_protocol::UploadConfig;
use chunkup_transfer::ByteSource;
use tracing::{debug, info};

use crate::control::TaskControl;
use crate::error::UploadError;
use crate::events::{EventBus, SubscriptionId};
use crate::orchestrator::Orchestrator;
use crate::transport::UploadTransport;
use crate::types::{TaskId, TaskSnapshot, TaskStatus, TaskSummary, UploadEvent, UploaderSettings};

#[derive(Clone)]
struct TaskEntry {
    control: TaskControl,
    orchestrator: Arc<tokio::sync::Mutex<Orchestrator>>,
}

/// Owns every upload task of a session.
///
/// Commands on a finished task (success or cancelled) are accepted and
/// ignored. Commands that do not apply to the current state, such as
/// resuming a task that is not paused, are ignored as well and report
/// the state the task is in.
pub struct UploadRegistry {
    transport: Arc<dyn UploadTransport>,
    settings: UploaderSettings,
    bus: Arc<EventBus>,
    config: RwLock<Option<Arc<UploadConfig>>>,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl UploadRegistry {
    pub fn new(transport: Arc<dyn UploadTransport>, settings: UploaderSettings) -> Self {
        Self {
            transport,
            settings,
            bus: Arc::new(EventBus::new()),
            config: RwLock::new(None),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Cached server configuration, if fetched.
    pub fn config(&self) -> Option<Arc<UploadConfig>> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the cached configuration without asking the server.
    pub fn set_config(&self, config: UploadConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(config));
    }

    /// Fetches the server configuration and caches it.
    ///
    /// Tasks already submitted keep the configuration they started with.
    pub async fn refresh_config(&self) -> Result<Arc<UploadConfig>, UploadError> {
        let config = Arc::new(self.transport.fetch_config().await?);
        info!(
            chunk_size = config.chunk_size,
            max_file_size = config.max_file_size,
            "upload config loaded"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&config));
        Ok(config)
    }

    async fn ensure_config(&self) -> Result<Arc<UploadConfig>, UploadError> {
        match self.config() {
            Some(config) => Ok(config),
            None => self.refresh_config().await,
        }
    }

    /// Adds a pending task for `source`.
    pub async fn submit(&self, source: Arc<dyn ByteSource>) -> Result<TaskId, UploadError> {
        let config = self.ensure_config().await?;
        let orchestrator = Orchestrator::new(
            source,
            config,
            Arc::clone(&self.transport),
            self.settings.clone(),
            Arc::clone(&self.bus),
        );
        Ok(self.insert(orchestrator))
    }

    /// Re-registers a paused task from a snapshot.
    pub async fn restore(
        &self,
        snapshot: TaskSnapshot,
        source: Arc<dyn ByteSource>,
    ) -> Result<TaskId, UploadError> {
        let config = self.ensure_config().await?;
        let orchestrator = Orchestrator::restore(
            snapshot,
            source,
            config,
            Arc::clone(&self.transport),
            self.settings.clone(),
            Arc::clone(&self.bus),
        )?;
        Ok(self.insert(orchestrator))
    }

    fn insert(&self, orchestrator: Orchestrator) -> TaskId {
        let id = orchestrator.id().to_string();
        let entry = TaskEntry {
            control: orchestrator.control(),
            orchestrator: Arc::new(tokio::sync::Mutex::new(orchestrator)),
        };
        self.lock_tasks().insert(id.clone(), entry);
        debug!(task = %id, "task registered");
        id
    }

    /// Runs a pending task to completion, pause or failure.
    pub async fn start(&self, id: &str) -> Result<TaskStatus, UploadError> {
        self.run_if(id, TaskStatus::Pending).await
    }

    /// Submits and runs `source`, returning the settled summary.
    ///
    /// Only submission failures are returned as errors; a failed upload is
    /// reported through the summary and stays in the registry for `retry`.
    pub async fn upload(&self, source: Arc<dyn ByteSource>) -> Result<TaskSummary, UploadError> {
        let id = self.submit(source).await?;
        if let Err(e) = self.start(&id).await {
            debug!(task = %id, error = %e, "upload did not complete");
        }
        self.get(&id)
            .ok_or_else(|| UploadError::TaskNotFound(id.clone()))
    }

    /// Continues a paused task.
    pub async fn resume(&self, id: &str) -> Result<TaskStatus, UploadError> {
        self.run_if(id, TaskStatus::Paused).await
    }

    /// Retries a failed task, sending only what the server is missing.
    pub async fn retry(&self, id: &str) -> Result<TaskStatus, UploadError> {
        self.run_if(id, TaskStatus::Error).await
    }

    /// Stops dispatching new chunks for a running task.
    pub fn pause(&self, id: &str) -> Result<(), UploadError> {
        let entry = self.entry(id)?;
        let status = self.status(id);
        if status.is_some_and(TaskStatus::is_active) {
            entry.control.pause();
            debug!(task = %id, "pause requested");
        }
        Ok(())
    }

    /// Cancels a task. In-flight requests of a running task are abandoned.
    pub fn cancel(&self, id: &str) -> Result<(), UploadError> {
        let entry = self.entry(id)?;
        if self.status(id).is_some_and(TaskStatus::is_terminal) {
            return Ok(());
        }
        entry.control.cancel();
        match entry.orchestrator.try_lock() {
            Ok(mut orchestrator) => orchestrator.cancel(),
            // Running: the orchestrator stops at its next poll, the
            // published status flips now.
            Err(_) => {
                self.bus.cancel(id);
            }
        }
        debug!(task = %id, "cancel requested");
        Ok(())
    }

    /// Drops a task that is not running. Returns `false` if it is active.
    pub fn remove(&self, id: &str) -> Result<bool, UploadError> {
        let entry = self.entry(id)?;
        if self.status(id).is_some_and(TaskStatus::is_active) {
            return Ok(false);
        }
        entry.control.cancel();
        self.lock_tasks().remove(id);
        self.bus.remove(id);
        Ok(true)
    }

    /// Summaries of all tasks in submission order.
    pub fn list(&self) -> Vec<TaskSummary> {
        self.bus.summaries()
    }

    pub fn get(&self, id: &str) -> Option<TaskSummary> {
        self.bus.summary(id)
    }

    /// Resumable state of an idle chunked task.
    pub fn snapshot(&self, id: &str) -> Result<Option<TaskSnapshot>, UploadError> {
        let entry = self.entry(id)?;
        Ok(entry
            .orchestrator
            .try_lock()
            .ok()
            .and_then(|orchestrator| orchestrator.snapshot()))
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    async fn run_if(&self, id: &str, expected: TaskStatus) -> Result<TaskStatus, UploadError> {
        let entry = self.entry(id)?;
        let Ok(mut orchestrator) = entry.orchestrator.try_lock() else {
            debug!(task = %id, "task already running");
            return Ok(self.status(id).unwrap_or(expected));
        };
        let status = orchestrator.task().status;
        if status != expected {
            debug!(task = %id, %status, wanted = %expected, "ignoring command");
            return Ok(status);
        }
        orchestrator.run().await
    }

    fn status(&self, id: &str) -> Option<TaskStatus> {
        self.bus.summary(id).map(|s| s.status)
    }

    fn entry(&self, id: &str) -> Result<TaskEntry, UploadError> {
        self.lock_tasks()
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::TaskNotFound(id.to_string()))
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use chunkup_transfer::MemorySource;

    use super::*;
    use crate::memory::{InMemoryTransport, TransportCall};
    use crate::transport::TransportError;

    const KB: usize = 1024;

    fn setup(concurrency: usize) -> (Arc<InMemoryTransport>, Arc<UploadRegistry>) {
        let transport = Arc::new(InMemoryTransport::new(UploadConfig {
            chunk_size: 5 * KB as i64,
            ..UploadConfig::default()
        }));
        let registry = Arc::new(UploadRegistry::new(
            transport.clone(),
            UploaderSettings {
                concurrency,
                ..UploaderSettings::default()
            },
        ));
        (transport, registry)
    }

    fn file(name: &str, size: usize) -> Arc<dyn ByteSource> {
        let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        Arc::new(MemorySource::new(name, data))
    }

    fn status_of(registry: &UploadRegistry, id: &str) -> TaskStatus {
        registry.get(id).unwrap().status
    }

    #[tokio::test]
    async fn submit_fetches_config_once_and_keeps_order() {
        let (transport, registry) = setup(3);
        let a = registry.submit(file("a.mp4", 10 * KB)).await.unwrap();
        let b = registry.submit(file("b.txt", KB)).await.unwrap();

        let listed: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, [a.clone(), b]);
        assert_eq!(status_of(&registry, &a), TaskStatus::Pending);
        assert_eq!(transport.calls(), [TransportCall::FetchConfig]);
        assert_eq!(registry.config().unwrap().chunk_size, 5 * KB as i64);
    }

    #[tokio::test]
    async fn start_runs_task_and_reports_status_changes() {
        let (_, registry) = setup(3);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        registry.subscribe(move |e| {
            if let UploadEvent::StatusChanged { status, .. } = e {
                sink.lock().unwrap().push(*status);
            }
        });

        let id = registry.submit(file("notes.txt", KB)).await.unwrap();
        assert_eq!(registry.start(&id).await.unwrap(), TaskStatus::Success);

        let summary = registry.get(&id).unwrap();
        assert_eq!(summary.progress, 100.0);
        assert!(summary.metadata.is_some());
        assert_eq!(
            *statuses.lock().unwrap(),
            [
                TaskStatus::Hashing,
                TaskStatus::Uploading,
                TaskStatus::Success
            ]
        );
    }

    #[tokio::test]
    async fn upload_reports_failure_in_summary() {
        let (transport, registry) = setup(3);
        transport.fail_simple(TransportError::Protocol {
            code: 400,
            message: "rejected".into(),
        });

        let summary = registry.upload(file("a.txt", 100)).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Error);
        assert!(summary.error.unwrap().contains("rejected"));

        let summary = registry.upload(file("b.txt", 100)).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Success);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn unknown_task_is_reported() {
        let (_, registry) = setup(3);
        assert!(matches!(
            registry.start("nope").await,
            Err(UploadError::TaskNotFound(_))
        ));
        assert!(matches!(
            registry.resume("nope").await,
            Err(UploadError::TaskNotFound(_))
        ));
        assert!(matches!(
            registry.retry("nope").await,
            Err(UploadError::TaskNotFound(_))
        ));
        assert!(matches!(
            registry.pause("nope"),
            Err(UploadError::TaskNotFound(_))
        ));
        assert!(matches!(
            registry.cancel("nope"),
            Err(UploadError::TaskNotFound(_))
        ));
        assert!(registry.get("nope").is_none());
    }

    #[tokio::test]
    async fn finished_task_ignores_commands() {
        let (transport, registry) = setup(3);
        let id = registry.submit(file("clip.mp4", 12 * KB)).await.unwrap();
        registry.start(&id).await.unwrap();
        transport.clear_calls();

        registry.pause(&id).unwrap();
        assert_eq!(registry.resume(&id).await.unwrap(), TaskStatus::Success);
        assert_eq!(registry.retry(&id).await.unwrap(), TaskStatus::Success);
        assert_eq!(registry.start(&id).await.unwrap(), TaskStatus::Success);
        registry.cancel(&id).unwrap();

        assert_eq!(status_of(&registry, &id), TaskStatus::Success);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn resume_ignores_pending_task() {
        let (transport, registry) = setup(3);
        let id = registry.submit(file("clip.mp4", 12 * KB)).await.unwrap();
        transport.clear_calls();

        assert_eq!(registry.resume(&id).await.unwrap(), TaskStatus::Pending);
        assert_eq!(registry.retry(&id).await.unwrap(), TaskStatus::Pending);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn pause_from_observer_then_resume() {
        let (transport, registry) = setup(1);
        let id = registry.submit(file("movie.mp4", 25 * KB)).await.unwrap();

        let weak: Weak<UploadRegistry> = Arc::downgrade(&registry);
        let watched = id.clone();
        registry.subscribe(move |e| {
            if let UploadEvent::ChunkUploaded {
                task_id,
                uploaded: 2,
                ..
            } = e
            {
                if *task_id == watched {
                    if let Some(registry) = weak.upgrade() {
                        registry.pause(task_id).unwrap();
                    }
                }
            }
        });

        assert_eq!(registry.start(&id).await.unwrap(), TaskStatus::Paused);
        let summary = registry.get(&id).unwrap();
        assert_eq!(summary.uploaded_chunks, 2);
        assert_eq!(summary.chunk_total, 5);

        transport.clear_calls();
        assert_eq!(registry.resume(&id).await.unwrap(), TaskStatus::Success);
        assert_eq!(transport.chunk_requests(), [2, 3, 4]);
    }

    #[tokio::test]
    async fn retry_sends_only_failed_chunk() {
        let (transport, registry) = setup(3);
        transport.fail_chunk(2, TransportError::Transient("timeout".into()), 3);
        let id = registry.submit(file("movie.mp4", 25 * KB)).await.unwrap();

        assert!(matches!(
            registry.start(&id).await,
            Err(UploadError::RetriesExhausted { index: 2, .. })
        ));
        let summary = registry.get(&id).unwrap();
        assert_eq!(summary.status, TaskStatus::Error);
        assert_eq!(summary.uploaded_chunks, 4);
        assert!(summary.error.unwrap().contains("chunk 2"));

        transport.clear_calls();
        assert_eq!(registry.retry(&id).await.unwrap(), TaskStatus::Success);
        assert_eq!(transport.chunk_requests(), [2]);
        assert!(registry.get(&id).unwrap().error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_running_task() {
        let (transport, registry) = setup(2);
        for i in 0..5 {
            transport.delay_chunk(i, Duration::from_secs(30));
        }
        let id = registry.submit(file("movie.mp4", 25 * KB)).await.unwrap();
        let cancelled_events = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&cancelled_events);
        registry.subscribe(move |e| {
            if let UploadEvent::StatusChanged {
                status: TaskStatus::Cancelled,
                ..
            } = e
            {
                *sink.lock().unwrap() += 1;
            }
        });

        let canceller = async {
            while transport.in_flight() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            registry.cancel(&id).unwrap();
            // Visible before the running task is polled again.
            let status = status_of(&registry, &id);
            (status, transport.in_flight())
        };
        let (result, (status_after_cancel, in_flight_at_cancel)) =
            tokio::join!(registry.start(&id), canceller);

        assert_eq!(status_after_cancel, TaskStatus::Cancelled);
        assert_eq!(in_flight_at_cancel, 2);
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(status_of(&registry, &id), TaskStatus::Cancelled);
        assert_eq!(*cancelled_events.lock().unwrap(), 1);
        assert_eq!(transport.in_flight(), 0);
        assert!(
            !transport
                .calls()
                .iter()
                .any(|c| matches!(c, TransportCall::Merge { .. }))
        );
    }

    #[tokio::test]
    async fn cancel_pending_task_is_immediate() {
        let (_, registry) = setup(3);
        let id = registry.submit(file("clip.mp4", 12 * KB)).await.unwrap();
        registry.cancel(&id).unwrap();
        assert_eq!(status_of(&registry, &id), TaskStatus::Cancelled);
        assert!(matches!(
            registry.start(&id).await,
            Ok(TaskStatus::Cancelled)
        ));
    }

    #[tokio::test]
    async fn restore_into_new_registry() {
        let (transport, registry) = setup(1);
        let id = registry.submit(file("movie.mp4", 25 * KB)).await.unwrap();
        let weak = Arc::downgrade(&registry);
        registry.subscribe(move |e| {
            if let UploadEvent::ChunkUploaded { task_id, uploaded: 3, .. } = e {
                if let Some(registry) = weak.upgrade() {
                    registry.pause(task_id).unwrap();
                }
            }
        });
        registry.start(&id).await.unwrap();
        let snapshot = registry.snapshot(&id).unwrap().unwrap();

        let reloaded = UploadRegistry::new(transport.clone(), UploaderSettings::default());
        let restored = reloaded
            .restore(snapshot, file("movie.mp4", 25 * KB))
            .await
            .unwrap();
        assert_eq!(restored, id);
        assert_eq!(status_of(&reloaded, &id), TaskStatus::Paused);

        transport.clear_calls();
        assert_eq!(reloaded.resume(&id).await.unwrap(), TaskStatus::Success);
        let mut sent = transport.chunk_requests();
        sent.sort_unstable();
        assert_eq!(sent, [3, 4]);
    }

    #[tokio::test]
    async fn refresh_config_replaces_cache() {
        let (transport, registry) = setup(3);
        assert!(registry.config().is_none());
        registry.refresh_config().await.unwrap();

        transport.set_config(UploadConfig {
            chunk_size: 2 * KB as i64,
            ..UploadConfig::default()
        });
        let config = registry.refresh_config().await.unwrap();
        assert_eq!(config.chunk_size, 2 * KB as i64);
        assert_eq!(registry.config().unwrap().chunk_size, 2 * KB as i64);
    }

    #[tokio::test]
    async fn unsubscribed_observer_is_silent() {
        let (_, registry) = setup(3);
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let sub = registry.subscribe(move |_| *c.lock().unwrap() += 1);
        registry.submit(file("a.txt", 10)).await.unwrap();
        let seen = *count.lock().unwrap();
        assert!(seen > 0);

        assert!(registry.unsubscribe(sub));
        registry.submit(file("b.txt", 10)).await.unwrap();
        assert_eq!(*count.lock().unwrap(), seen);
    }

    #[tokio::test]
    async fn remove_drops_idle_tasks() {
        let (_, registry) = setup(3);
        let id = registry.submit(file("a.txt", 10)).await.unwrap();
        registry.start(&id).await.unwrap();

        let removed = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&removed);
        registry.subscribe(move |e| {
            if matches!(e, UploadEvent::Removed { .. }) {
                *flag.lock().unwrap() = true;
            }
        });
        assert!(registry.remove(&id).unwrap());
        assert!(registry.list().is_empty());
        assert!(*removed.lock().unwrap());
        assert!(matches!(
            registry.remove(&id),
            Err(UploadError::TaskNotFound(_))
        ));
    }
}
