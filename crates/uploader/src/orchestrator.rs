//! Drives one upload from hashing to merge.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chunkup_protocol::constants::MAX_FILENAME_LENGTH;
use chunkup_protocol::{
    ChunkUploadResponse, FileMetadata, InitChunkedRequest, ServerUploadStatus, UploadConfig,
};
use chunkup_transfer::{ByteSource, digest, digest_source, plan};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::TaskControl;
use crate::error::UploadError;
use crate::events::EventBus;
use crate::retry::{ChunkVerdict, RetryPolicy};
use crate::transport::{
    ByteProgress, ChunkPayload, ProgressSender, SimplePayload, TransportError, UploadTransport,
};
use crate::types::{
    TaskSnapshot, TaskStatus, UploadEvent, UploadStrategy, UploadTask, UploaderSettings,
};

enum ChunkFailure {
    /// The bytes could not be read.
    Source(String),
    Transport(TransportError),
}

type ChunkOutcome = (u32, Result<(ChunkUploadResponse, String), ChunkFailure>);

enum Dispatch {
    /// Every chunk is acknowledged.
    Drained,
    Paused,
}

/// Owns one [`UploadTask`] and moves it through its lifecycle.
///
/// `run` is the only entry point that talks to the server. It picks up
/// wherever the task stopped: a fresh task is validated and hashed, a
/// paused or failed one is reconciled against the server and continues
/// with the chunks that are still missing.
pub struct Orchestrator {
    task: UploadTask,
    source: Arc<dyn ByteSource>,
    config: Arc<UploadConfig>,
    transport: Arc<dyn UploadTransport>,
    settings: UploaderSettings,
    retry: RetryPolicy,
    control: TaskControl,
    bus: Arc<EventBus>,
}

impl Orchestrator {
    /// Creates a pending task for `source` and announces it on `bus`.
    pub fn new(
        source: Arc<dyn ByteSource>,
        config: Arc<UploadConfig>,
        transport: Arc<dyn UploadTransport>,
        settings: UploaderSettings,
        bus: Arc<EventBus>,
    ) -> Self {
        let task = UploadTask::new(
            uuid::Uuid::new_v4().to_string(),
            source.name(),
            source.mime_type(),
            source.len(),
        );
        Self::with_task(task, source, config, transport, settings, bus)
    }

    /// Rebuilds a paused chunked task from a snapshot.
    ///
    /// `source` must be the same file the snapshot was taken from; a size
    /// mismatch or an inconsistent chunk plan is rejected.
    pub fn restore(
        snapshot: TaskSnapshot,
        source: Arc<dyn ByteSource>,
        config: Arc<UploadConfig>,
        transport: Arc<dyn UploadTransport>,
        settings: UploaderSettings,
        bus: Arc<EventBus>,
    ) -> Result<Self, UploadError> {
        if source.len() != snapshot.size {
            return Err(UploadError::Configuration(format!(
                "source is {} bytes but the snapshot recorded {}",
                source.len(),
                snapshot.size
            )));
        }
        let contiguous = snapshot
            .chunks
            .iter()
            .enumerate()
            .all(|(i, c)| c.index as usize == i && !c.is_empty())
            && snapshot.chunks.windows(2).all(|w| w[0].end == w[1].start)
            && snapshot.chunks.first().is_some_and(|c| c.start == 0)
            && snapshot.chunks.last().is_some_and(|c| c.end == snapshot.size);
        if !contiguous {
            return Err(UploadError::Configuration(
                "snapshot chunk plan does not cover the file".into(),
            ));
        }

        let mut task = UploadTask::new(
            snapshot.task_id,
            snapshot.filename,
            snapshot.mime_type,
            snapshot.size,
        );
        task.digest = Some(snapshot.digest);
        task.file_id = Some(snapshot.file_id);
        task.strategy = Some(UploadStrategy::Chunked);
        task.status = TaskStatus::Paused;
        task.chunks = snapshot.chunks;
        task.progress = task.chunk_progress();
        Ok(Self::with_task(task, source, config, transport, settings, bus))
    }

    fn with_task(
        task: UploadTask,
        source: Arc<dyn ByteSource>,
        config: Arc<UploadConfig>,
        transport: Arc<dyn UploadTransport>,
        settings: UploaderSettings,
        bus: Arc<EventBus>,
    ) -> Self {
        let retry = RetryPolicy::new(settings.max_attempts);
        let orchestrator = Self {
            task,
            source,
            config,
            transport,
            settings,
            retry,
            control: TaskControl::new(),
            bus,
        };
        orchestrator.emit(UploadEvent::Submitted {
            task_id: orchestrator.task.id.clone(),
        });
        orchestrator
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn task(&self) -> &UploadTask {
        &self.task
    }

    /// Pause/cancel handle usable while `run` is in progress.
    pub fn control(&self) -> TaskControl {
        self.control.clone()
    }

    /// Resumable state, available once a chunked upload is registered.
    pub fn snapshot(&self) -> Option<TaskSnapshot> {
        if self.task.strategy != Some(UploadStrategy::Chunked) {
            return None;
        }
        Some(TaskSnapshot {
            task_id: self.task.id.clone(),
            filename: self.task.filename.clone(),
            mime_type: self.task.mime_type.clone(),
            size: self.task.size,
            digest: self.task.digest.clone()?,
            file_id: self.task.file_id.clone()?,
            chunks: self.task.chunks.clone(),
        })
    }

    /// Cancels a task that is not currently running.
    pub fn cancel(&mut self) {
        self.control.cancel();
        self.mark_cancelled();
    }

    /// Drives the task until it succeeds, fails, pauses or is cancelled.
    ///
    /// Returns the settled status on success or pause. Failures leave the
    /// task in [`TaskStatus::Error`] and are returned as the error.
    pub async fn run(&mut self) -> Result<TaskStatus, UploadError> {
        match self.task.status {
            TaskStatus::Success => return Ok(TaskStatus::Success),
            TaskStatus::Cancelled => return Err(UploadError::Cancelled),
            TaskStatus::Error if self.task.digest.is_none() => {
                return Err(UploadError::NotRetryable(
                    self.task.error.clone().unwrap_or_default(),
                ));
            }
            _ => {}
        }
        if self.control.is_cancelled() {
            self.mark_cancelled();
            return Err(UploadError::Cancelled);
        }
        self.control.clear_pause();
        self.task.error = None;

        match self.drive().await {
            Ok(status) => Ok(status),
            Err(UploadError::Cancelled) => {
                self.mark_cancelled();
                Err(UploadError::Cancelled)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<TaskStatus, UploadError> {
        let token = self.control.token();
        if self.task.digest.is_none() {
            let strategy = self.validate()?;
            self.task.strategy = Some(strategy);
            self.set_status(TaskStatus::Hashing);
            info!(
                task = %self.task.id,
                file = %self.task.filename,
                size = self.task.size,
                ?strategy,
                "hashing file"
            );
            let file_digest = self.hash(&token).await?;
            debug!(task = %self.task.id, digest = %file_digest, "file hashed");
            self.task.digest = Some(file_digest);
        }

        match self.task.strategy {
            Some(UploadStrategy::Simple) => self.upload_simple(&token).await,
            _ => self.upload_chunked(&token).await,
        }
    }

    /// Checks the file against the server limits and picks a strategy.
    fn validate(&self) -> Result<UploadStrategy, UploadError> {
        let size = self.task.size;
        if size == 0 {
            return Err(UploadError::EmptyFileNotSupported);
        }
        if size > self.config.max_file_size {
            return Err(UploadError::Configuration(format!(
                "file is {size} bytes, limit is {}",
                self.config.max_file_size
            )));
        }
        if self.task.filename.len() > MAX_FILENAME_LENGTH {
            return Err(UploadError::Configuration(format!(
                "filename longer than {MAX_FILENAME_LENGTH} bytes"
            )));
        }
        if !self.config.allows_mime(&self.task.mime_type) {
            return Err(UploadError::Configuration(format!(
                "file type {} is not allowed",
                self.task.mime_type
            )));
        }
        if self.config.chunk_size <= 0 {
            return Err(UploadError::Configuration(format!(
                "chunk size must be positive, got {}",
                self.config.chunk_size
            )));
        }

        let threshold = self
            .settings
            .chunk_threshold
            .unwrap_or(self.config.chunk_size as u64);
        Ok(if size <= threshold {
            UploadStrategy::Simple
        } else {
            UploadStrategy::Chunked
        })
    }

    async fn hash(&self, token: &CancellationToken) -> Result<String, UploadError> {
        let source = Arc::clone(&self.source);
        let slice_size = self.settings.slice_size;
        let job = tokio::task::spawn_blocking(move || digest_source(source.as_ref(), slice_size));
        until_cancelled(token, job)
            .await
            .ok_or(UploadError::Cancelled)?
            .map_err(|e| UploadError::HashingFailed(e.to_string()))?
            .map_err(|e| UploadError::HashingFailed(e.to_string()))
    }

    async fn upload_simple(&mut self, token: &CancellationToken) -> Result<TaskStatus, UploadError> {
        self.set_status(TaskStatus::Uploading);
        let mut attempts = 0;
        loop {
            if self.control.is_paused() {
                return Ok(self.pause_now());
            }
            self.set_progress(0.0);

            let source = Arc::clone(&self.source);
            let size = self.task.size;
            let read = tokio::task::spawn_blocking(move || source.read_range(0, size));
            let data = until_cancelled(token, read)
                .await
                .ok_or(UploadError::Cancelled)?
                .map_err(|e| UploadError::HashingFailed(e.to_string()))?
                .map_err(|e| UploadError::HashingFailed(e.to_string()))?;

            let payload = SimplePayload {
                filename: self.task.filename.clone(),
                mime_type: self.task.mime_type.clone(),
                data,
            };
            let (tx, mut rx) = mpsc::unbounded_channel();
            let transport = Arc::clone(&self.transport);
            let request = transport.simple_upload(payload, ProgressSender::new(tx, None));
            tokio::pin!(request);

            let result = loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(UploadError::Cancelled),
                    Some(bytes) = rx.recv() => self.on_bytes(bytes),
                    result = &mut request => break result,
                }
            };
            while let Ok(bytes) = rx.try_recv() {
                self.on_bytes(bytes);
            }
            if token.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            match result {
                Ok(meta) => {
                    self.task.file_id = Some(meta.file_id.clone());
                    return Ok(self.complete(Some(meta)));
                }
                Err(e) => {
                    attempts += 1;
                    match self.retry.verdict(attempts, &e) {
                        ChunkVerdict::Requeue => {
                            warn!(task = %self.task.id, attempt = attempts, error = %e, "upload failed, retrying");
                        }
                        ChunkVerdict::Exhausted | ChunkVerdict::Fatal => return Err(e.into()),
                    }
                }
            }
        }
    }

    async fn upload_chunked(
        &mut self,
        token: &CancellationToken,
    ) -> Result<TaskStatus, UploadError> {
        self.set_status(TaskStatus::Uploading);
        if self.task.chunks.is_empty() {
            self.task.chunks = plan(self.task.size, self.config.chunk_size)?;
            debug!(task = %self.task.id, chunks = self.task.chunks.len(), "chunk plan ready");
        }
        let transport = Arc::clone(&self.transport);

        let file_id = match self.task.file_id.clone() {
            Some(id) => id,
            None => {
                let request = InitChunkedRequest {
                    filename: self.task.filename.clone(),
                    file_size: self.task.size,
                    md5_hash: self.task.digest.clone().unwrap_or_default(),
                    chunk_size: self.config.chunk_size as u64,
                };
                let response = until_cancelled(token, transport.init_chunked_upload(request))
                    .await
                    .ok_or(UploadError::Cancelled)??;
                info!(
                    task = %self.task.id,
                    file_id = %response.file_id,
                    chunk_total = response.chunk_total,
                    "chunked upload registered"
                );
                self.task.file_id = Some(response.file_id.clone());
                response.file_id
            }
        };

        let server = until_cancelled(token, transport.get_progress(file_id.clone()))
            .await
            .ok_or(UploadError::Cancelled)??;
        if server.status == ServerUploadStatus::Completed {
            for chunk in &mut self.task.chunks {
                chunk.uploaded = true;
            }
            self.task.deduplicated = true;
            info!(task = %self.task.id, file_id = %file_id, "file already stored, skipping upload");
            return Ok(self.complete(None));
        }
        if server.chunk_total != self.task.chunk_total() {
            return Err(UploadError::Configuration(format!(
                "server expects {} chunks, planned {}",
                server.chunk_total,
                self.task.chunk_total()
            )));
        }
        self.reconcile(server.chunk_uploaded);
        self.retry.reset(&mut self.task.chunks);

        if !self.task.all_chunks_uploaded() {
            if let Dispatch::Paused = self.dispatch(&file_id, token).await? {
                return Ok(self.pause_now());
            }
        }
        self.merge(&file_id, token).await
    }

    /// Aligns local chunk flags with the count the server reports.
    ///
    /// The server only reports a count, so when it knows more chunks than
    /// we do the lowest unmarked indices are assumed done; when it knows
    /// fewer, local state is discarded and the first `server_uploaded`
    /// chunks are kept.
    fn reconcile(&mut self, server_uploaded: u32) {
        let total = self.task.chunk_total();
        let server_uploaded = server_uploaded.min(total);
        let local = self.task.uploaded_chunks();
        if server_uploaded == local {
            return;
        }

        if server_uploaded == total {
            for chunk in &mut self.task.chunks {
                chunk.uploaded = true;
            }
        } else if server_uploaded > local {
            let missing = (server_uploaded - local) as usize;
            for chunk in self
                .task
                .chunks
                .iter_mut()
                .filter(|c| !c.uploaded)
                .take(missing)
            {
                chunk.uploaded = true;
            }
        } else {
            warn!(
                task = %self.task.id,
                local,
                server = server_uploaded,
                "server holds fewer chunks than recorded, restarting from its count"
            );
            for (i, chunk) in self.task.chunks.iter_mut().enumerate() {
                chunk.uploaded = (i as u32) < server_uploaded;
            }
        }
        debug!(task = %self.task.id, local, server = server_uploaded, "chunk state reconciled");
        self.set_progress(self.task.chunk_progress());
    }

    async fn dispatch(
        &mut self,
        file_id: &str,
        token: &CancellationToken,
    ) -> Result<Dispatch, UploadError> {
        let mut pending: VecDeque<u32> = self
            .task
            .chunks
            .iter()
            .filter(|c| !c.uploaded)
            .map(|c| c.index)
            .collect();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ChunkOutcome>> =
            FuturesUnordered::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let limit = self.settings.concurrency.max(1);
        let mut failure: Option<UploadError> = None;

        loop {
            while failure.is_none() && !self.control.is_paused() && in_flight.len() < limit {
                let Some(index) = pending.pop_front() else {
                    break;
                };
                debug!(task = %self.task.id, index, "dispatching chunk");
                in_flight.push(self.send_chunk(file_id, index, tx.clone()));
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(UploadError::Cancelled),
                Some(bytes) = rx.recv() => self.on_bytes(bytes),
                Some((index, outcome)) = in_flight.next() => {
                    if token.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }
                    match outcome {
                        Ok((ack, chunk_digest)) => self.on_chunk_uploaded(index, &ack, chunk_digest),
                        Err(ChunkFailure::Source(message)) => {
                            error!(task = %self.task.id, index, error = %message, "chunk unreadable");
                            failure.get_or_insert(UploadError::HashingFailed(message));
                        }
                        Err(ChunkFailure::Transport(e)) if failure.is_some() => {
                            debug!(task = %self.task.id, index, error = %e, "chunk failed while stopping");
                        }
                        Err(ChunkFailure::Transport(e)) => {
                            if let Some(fatal) = self.on_chunk_failed(index, e, &mut pending) {
                                failure.get_or_insert(fatal);
                            }
                        }
                    }
                }
            }
        }
        while let Ok(bytes) = rx.try_recv() {
            self.on_bytes(bytes);
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if self.task.all_chunks_uploaded() {
            Ok(Dispatch::Drained)
        } else {
            Ok(Dispatch::Paused)
        }
    }

    fn send_chunk(
        &self,
        file_id: &str,
        index: u32,
        tx: mpsc::UnboundedSender<ByteProgress>,
    ) -> BoxFuture<'static, ChunkOutcome> {
        let chunk = &self.task.chunks[index as usize];
        transfer_chunk(
            Arc::clone(&self.source),
            Arc::clone(&self.transport),
            file_id.to_string(),
            index,
            (chunk.start, chunk.end),
            ProgressSender::new(tx, Some(index)),
        )
        .map(move |outcome| (index, outcome))
        .boxed()
    }

    fn on_chunk_uploaded(&mut self, index: u32, ack: &ChunkUploadResponse, chunk_digest: String) {
        let chunk = &mut self.task.chunks[index as usize];
        if chunk.uploaded {
            return;
        }
        chunk.uploaded = true;
        chunk.digest = Some(chunk_digest);

        let uploaded = self.task.uploaded_chunks();
        let total = self.task.chunk_total();
        debug!(
            task = %self.task.id,
            index,
            uploaded,
            total,
            server_uploaded = ack.chunk_uploaded,
            "chunk acknowledged"
        );
        let previous = self.task.progress;
        self.task.progress = self.task.chunk_progress();
        self.emit(UploadEvent::ChunkUploaded {
            task_id: self.task.id.clone(),
            index,
            uploaded,
            total,
        });
        if self.task.progress > previous {
            self.emit(UploadEvent::Progress {
                task_id: self.task.id.clone(),
                progress: self.task.progress,
            });
        }
    }

    /// Applies the retry policy. Returns the error that ends the task, if any.
    fn on_chunk_failed(
        &mut self,
        index: u32,
        e: TransportError,
        pending: &mut VecDeque<u32>,
    ) -> Option<UploadError> {
        let chunk = &mut self.task.chunks[index as usize];
        let verdict = self.retry.judge(chunk, &e);
        let attempts = chunk.attempts;
        match verdict {
            ChunkVerdict::Requeue => {
                warn!(task = %self.task.id, index, attempt = attempts, error = %e, "chunk failed, requeued");
                pending.push_back(index);
                self.emit(UploadEvent::ChunkRetry {
                    task_id: self.task.id.clone(),
                    index,
                    attempt: attempts,
                    error: e.to_string(),
                });
                None
            }
            ChunkVerdict::Exhausted => {
                error!(task = %self.task.id, index, attempts, error = %e, "chunk out of attempts");
                Some(UploadError::RetriesExhausted {
                    index,
                    attempts,
                    last_error: e.to_string(),
                })
            }
            ChunkVerdict::Fatal => {
                error!(task = %self.task.id, index, error = %e, "chunk rejected");
                Some(e.into())
            }
        }
    }

    async fn merge(
        &mut self,
        file_id: &str,
        token: &CancellationToken,
    ) -> Result<TaskStatus, UploadError> {
        if !self.task.all_chunks_uploaded() {
            return Err(UploadError::MergeFailed(format!(
                "only {} of {} chunks acknowledged",
                self.task.uploaded_chunks(),
                self.task.chunk_total()
            )));
        }
        self.set_status(TaskStatus::Merging);
        info!(task = %self.task.id, file_id, "merging chunks");

        let transport = Arc::clone(&self.transport);
        let meta = until_cancelled(token, transport.merge_chunks(file_id.to_string()))
            .await
            .ok_or(UploadError::Cancelled)?
            .map_err(|e| UploadError::MergeFailed(e.to_string()))?;
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(self.complete(Some(meta)))
    }

    fn on_bytes(&mut self, bytes: ByteProgress) {
        self.emit(UploadEvent::BytesTransferred {
            task_id: self.task.id.clone(),
            chunk_index: bytes.chunk_index,
            bytes_sent: bytes.bytes_sent,
            bytes_total: bytes.bytes_total,
        });
        // Chunked progress moves on acknowledgements only.
        if bytes.chunk_index.is_none() && bytes.bytes_total > 0 {
            let percent = (bytes.bytes_sent as f64 / bytes.bytes_total as f64 * 100.0).min(100.0);
            if percent > self.task.progress {
                self.set_progress(percent);
            }
        }
    }

    fn set_progress(&mut self, progress: f64) {
        let previous = self.task.progress;
        if progress == previous {
            return;
        }
        self.task.progress = progress;
        let task_id = self.task.id.clone();
        if progress > previous {
            self.emit(UploadEvent::Progress { task_id, progress });
        } else {
            self.emit(UploadEvent::ProgressReset { task_id, progress });
        }
    }

    fn set_status(&mut self, next: TaskStatus) {
        let current = self.task.status;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(task = %self.task.id, from = %current, to = %next, "ignoring invalid status transition");
            return;
        }
        self.task.status = next;
        debug!(task = %self.task.id, from = %current, to = %next, "status changed");
        self.emit(UploadEvent::StatusChanged {
            task_id: self.task.id.clone(),
            status: next,
        });
    }

    fn complete(&mut self, metadata: Option<FileMetadata>) -> TaskStatus {
        if metadata.is_some() {
            self.task.metadata = metadata;
        }
        self.set_progress(100.0);
        self.set_status(TaskStatus::Success);
        info!(
            task = %self.task.id,
            file_id = self.task.file_id.as_deref().unwrap_or_default(),
            deduplicated = self.task.deduplicated,
            "upload completed"
        );
        self.emit(UploadEvent::Completed {
            task_id: self.task.id.clone(),
        });
        TaskStatus::Success
    }

    fn pause_now(&mut self) -> TaskStatus {
        self.set_status(TaskStatus::Paused);
        info!(
            task = %self.task.id,
            uploaded = self.task.uploaded_chunks(),
            total = self.task.chunk_total(),
            "upload paused"
        );
        TaskStatus::Paused
    }

    fn mark_cancelled(&mut self) {
        if self.task.status.is_terminal() {
            return;
        }
        if self.bus.is_cancelled(&self.task.id) {
            // Already announced by the registry.
            self.task.status = TaskStatus::Cancelled;
        } else {
            self.set_status(TaskStatus::Cancelled);
        }
        info!(task = %self.task.id, "upload cancelled");
    }

    fn fail(&mut self, e: &UploadError) {
        self.task.error = Some(e.to_string());
        self.set_status(TaskStatus::Error);
        error!(task = %self.task.id, error = %e, "upload failed");
        self.emit(UploadEvent::Failed {
            task_id: self.task.id.clone(),
            error: e.to_string(),
        });
    }

    fn emit(&self, event: UploadEvent) {
        self.bus.publish(self.task.summary(), event);
    }
}

/// Resolves to `None` if `token` fires first.
async fn until_cancelled<F: Future>(token: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

async fn transfer_chunk(
    source: Arc<dyn ByteSource>,
    transport: Arc<dyn UploadTransport>,
    file_id: String,
    index: u32,
    (start, end): (u64, u64),
    progress: ProgressSender,
) -> Result<(ChunkUploadResponse, String), ChunkFailure> {
    let (data, chunk_digest) = tokio::task::spawn_blocking(move || {
        source.read_range(start, end).map(|data| {
            let d = digest(&data);
            (data, d)
        })
    })
    .await
    .map_err(|e| ChunkFailure::Source(e.to_string()))?
    .map_err(|e| ChunkFailure::Source(e.to_string()))?;

    let payload = ChunkPayload {
        file_id,
        index,
        digest: chunk_digest.clone(),
        data,
    };
    let ack = transport
        .upload_chunk(payload, progress)
        .await
        .map_err(ChunkFailure::Transport)?;
    Ok((ack, chunk_digest))
}
