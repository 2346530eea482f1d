//! In-process stand-in for the upload server.
//!
//! Behaves like the real service for deduplication, chunk bookkeeping and
//! merging, and lets callers script failures and latency per chunk.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use chunkup_protocol::{
    ChunkUploadResponse, FileMetadata, InitChunkedRequest, InitChunkedResponse, ServerProgress,
    ServerUploadStatus, UploadConfig, mime_for_filename,
};
use chunkup_transfer::{chunk_count, digest};

use crate::transport::{
    ChunkPayload, ProgressSender, SimplePayload, TransportError, TransportFuture, UploadTransport,
};

/// One request observed by [`InMemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    FetchConfig,
    InitChunked { digest: String },
    /// A chunk request arrived.
    UploadChunk { index: u32 },
    /// A chunk was stored and acknowledged.
    ChunkStored { index: u32 },
    Merge { file_id: String },
    Simple { filename: String },
    Progress { file_id: String },
}

struct StoredFile {
    filename: String,
    file_size: u64,
    digest: String,
    chunk_total: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    metadata: Option<FileMetadata>,
}

#[derive(Default)]
struct ServerState {
    config: UploadConfig,
    files: HashMap<String, StoredFile>,
    by_digest: HashMap<String, String>,
    chunk_failures: HashMap<u32, VecDeque<TransportError>>,
    init_failures: VecDeque<TransportError>,
    merge_failures: VecDeque<TransportError>,
    simple_failures: VecDeque<TransportError>,
    chunk_delays: HashMap<u32, Duration>,
    calls: Vec<TransportCall>,
}

/// Thread-safe fake implementing [`UploadTransport`].
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<ServerState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryTransport {
    pub fn new(config: UploadConfig) -> Self {
        let transport = Self::default();
        transport.lock().config = config;
        transport
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_config(&self, config: UploadConfig) {
        self.lock().config = config;
    }

    /// Makes the next `times` requests for chunk `index` fail with `error`.
    pub fn fail_chunk(&self, index: u32, error: TransportError, times: usize) {
        let mut state = self.lock();
        let queue = state.chunk_failures.entry(index).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    pub fn fail_init(&self, error: TransportError) {
        self.lock().init_failures.push_back(error);
    }

    pub fn fail_merge(&self, error: TransportError) {
        self.lock().merge_failures.push_back(error);
    }

    pub fn fail_simple(&self, error: TransportError) {
        self.lock().simple_failures.push_back(error);
    }

    /// Holds every request for chunk `index` for `delay` before answering.
    pub fn delay_chunk(&self, index: u32, delay: Duration) {
        self.lock().chunk_delays.insert(index, delay);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Indices of chunk requests received, in arrival order.
    pub fn chunk_requests(&self) -> Vec<u32> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TransportCall::UploadChunk { index } => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Chunk requests currently being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent chunk requests seen so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Indices of chunks stored for `file_id`.
    pub fn stored_chunks(&self, file_id: &str) -> Vec<u32> {
        self.lock()
            .files
            .get(file_id)
            .map(|f| f.chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Metadata of a completed file.
    pub fn stored_file(&self, file_id: &str) -> Option<FileMetadata> {
        self.lock()
            .files
            .get(file_id)
            .and_then(|f| f.metadata.clone())
    }

    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(&self.in_flight)
    }

    fn check_limits(config: &UploadConfig, filename: &str, size: u64) -> Result<(), TransportError> {
        if !config.allows_size(size) {
            return Err(rejected(400, format!("file size {size} exceeds limit")));
        }
        let mime = mime_for_filename(filename);
        if !config.allows_mime(mime) {
            return Err(rejected(400, format!("file type {mime} not allowed")));
        }
        Ok(())
    }

    fn register(&self, request: &InitChunkedRequest) -> Result<InitChunkedResponse, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::InitChunked {
            digest: request.md5_hash.clone(),
        });
        if let Some(e) = state.init_failures.pop_front() {
            return Err(e);
        }
        Self::check_limits(&state.config, &request.filename, request.file_size)?;
        if request.chunk_size == 0 {
            return Err(rejected(400, "chunk size must be positive"));
        }

        let existing = state.by_digest.get(&request.md5_hash).and_then(|id| {
            state.files.get(id).map(|f| {
                let chunk_total = if f.metadata.is_some() { 1 } else { f.chunk_total };
                (id.clone(), chunk_total)
            })
        });
        if let Some((file_id, chunk_total)) = existing {
            return Ok(InitChunkedResponse {
                file_id,
                chunk_size: request.chunk_size,
                chunk_total,
                upload_token: String::new(),
            });
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let chunk_total = u32::try_from(chunk_count(request.file_size, request.chunk_size))
            .map_err(|_| rejected(400, "too many chunks"))?;
        state.files.insert(
            file_id.clone(),
            StoredFile {
                filename: request.filename.clone(),
                file_size: request.file_size,
                digest: request.md5_hash.clone(),
                chunk_total,
                chunks: BTreeMap::new(),
                metadata: None,
            },
        );
        state
            .by_digest
            .insert(request.md5_hash.clone(), file_id.clone());
        Ok(InitChunkedResponse {
            file_id,
            chunk_size: request.chunk_size,
            chunk_total,
            upload_token: String::new(),
        })
    }

    fn take_chunk_failure(&self, index: u32) -> Option<TransportError> {
        self.lock()
            .chunk_failures
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
    }

    fn store_chunk(&self, chunk: ChunkPayload) -> Result<ChunkUploadResponse, TransportError> {
        if digest(&chunk.data) != chunk.digest {
            return Err(rejected(400, "chunk checksum mismatch"));
        }
        let mut state = self.lock();
        let file = state
            .files
            .get_mut(&chunk.file_id)
            .ok_or_else(|| rejected(404, "upload record not found"))?;
        if chunk.index >= file.chunk_total {
            return Err(rejected(400, format!("chunk index {} out of range", chunk.index)));
        }
        file.chunks.insert(chunk.index, chunk.data);
        let response = ChunkUploadResponse {
            file_id: chunk.file_id,
            chunk_index: chunk.index,
            chunk_uploaded: file.chunks.len() as u32,
            chunk_total: file.chunk_total,
            is_completed: file.chunks.len() as u32 == file.chunk_total,
        };
        state.calls.push(TransportCall::ChunkStored { index: chunk.index });
        Ok(response)
    }

    fn merge(&self, file_id: String) -> Result<FileMetadata, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Merge {
            file_id: file_id.clone(),
        });
        if let Some(e) = state.merge_failures.pop_front() {
            return Err(e);
        }
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or_else(|| rejected(404, "upload record not found"))?;
        if let Some(meta) = &file.metadata {
            return Ok(meta.clone());
        }
        if file.chunks.len() as u32 != file.chunk_total {
            return Err(rejected(
                400,
                format!(
                    "chunks incomplete: {}/{}",
                    file.chunks.len(),
                    file.chunk_total
                ),
            ));
        }
        let assembled: Vec<u8> = file.chunks.values().flatten().copied().collect();
        if digest(&assembled) != file.digest {
            return Err(rejected(400, "file checksum mismatch"));
        }
        let meta = build_metadata(&file_id, &file.filename, file.file_size, &file.digest);
        file.metadata = Some(meta.clone());
        Ok(meta)
    }

    fn store_simple(&self, file: SimplePayload) -> Result<FileMetadata, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Simple {
            filename: file.filename.clone(),
        });
        if let Some(e) = state.simple_failures.pop_front() {
            return Err(e);
        }
        let size = file.data.len() as u64;
        Self::check_limits(&state.config, &file.filename, size)?;

        let md5 = digest(&file.data);
        if let Some(existing) = state
            .by_digest
            .get(&md5)
            .and_then(|id| state.files.get(id))
            .and_then(|f| f.metadata.clone())
        {
            return Ok(existing);
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        let meta = build_metadata(&file_id, &file.filename, size, &md5);
        state.files.insert(
            file_id.clone(),
            StoredFile {
                filename: file.filename,
                file_size: size,
                digest: md5.clone(),
                chunk_total: 1,
                chunks: BTreeMap::from([(0, file.data)]),
                metadata: Some(meta.clone()),
            },
        );
        state.by_digest.insert(md5, file_id);
        Ok(meta)
    }

    fn progress_of(&self, file_id: String) -> Result<ServerProgress, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Progress {
            file_id: file_id.clone(),
        });
        let file = state
            .files
            .get(&file_id)
            .ok_or_else(|| rejected(404, "upload record not found"))?;
        let (uploaded, status) = if file.metadata.is_some() {
            (file.chunk_total, ServerUploadStatus::Completed)
        } else {
            (file.chunks.len() as u32, ServerUploadStatus::Uploading)
        };
        let progress = if file.chunk_total == 0 {
            0.0
        } else {
            f64::from(uploaded) / f64::from(file.chunk_total) * 100.0
        };
        Ok(ServerProgress {
            file_id,
            filename: file.filename.clone(),
            file_size: file.file_size,
            chunk_total: file.chunk_total,
            chunk_uploaded: uploaded,
            progress,
            status,
        })
    }
}

fn rejected(code: i32, message: impl Into<String>) -> TransportError {
    TransportError::Protocol {
        code,
        message: message.into(),
    }
}

fn build_metadata(file_id: &str, filename: &str, size: u64, md5: &str) -> FileMetadata {
    let extension = std::path::Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stored_name = format!("{}{}", uuid::Uuid::new_v4(), extension);
    FileMetadata {
        file_id: file_id.to_string(),
        filename: filename.to_string(),
        file_path: format!("uploads/{stored_name}"),
        stored_name,
        file_size: size,
        mime_type: mime_for_filename(filename).to_string(),
        extension,
        md5_hash: md5.to_string(),
        uploaded_at: Utc::now(),
    }
}

impl UploadTransport for InMemoryTransport {
    fn fetch_config(&self) -> TransportFuture<'_, UploadConfig> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(TransportCall::FetchConfig);
            Ok(state.config.clone())
        })
    }

    fn init_chunked_upload(
        &self,
        request: InitChunkedRequest,
    ) -> TransportFuture<'_, InitChunkedResponse> {
        Box::pin(async move { self.register(&request) })
    }

    fn upload_chunk(
        &self,
        chunk: ChunkPayload,
        progress: ProgressSender,
    ) -> TransportFuture<'_, ChunkUploadResponse> {
        Box::pin(async move {
            let index = chunk.index;
            let delay = {
                let mut state = self.lock();
                state.calls.push(TransportCall::UploadChunk { index });
                state.chunk_delays.get(&index).copied()
            };
            let _guard = self.enter();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(e) = self.take_chunk_failure(index) {
                return Err(e);
            }

            let total = chunk.data.len() as u64;
            progress.report(total / 2, total);
            let response = self.store_chunk(chunk)?;
            progress.report(total, total);
            Ok(response)
        })
    }

    fn merge_chunks(&self, file_id: String) -> TransportFuture<'_, FileMetadata> {
        Box::pin(async move { self.merge(file_id) })
    }

    fn simple_upload(
        &self,
        file: SimplePayload,
        progress: ProgressSender,
    ) -> TransportFuture<'_, FileMetadata> {
        Box::pin(async move {
            let total = file.data.len() as u64;
            progress.report(total / 2, total);
            let meta = self.store_simple(file)?;
            progress.report(total, total);
            Ok(meta)
        })
    }

    fn get_progress(&self, file_id: String) -> TransportFuture<'_, ServerProgress> {
        Box::pin(async move { self.progress_of(file_id) })
    }
}
