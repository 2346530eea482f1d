use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkup_protocol::mime_for_filename;

use crate::TransferError;

/// Random-access byte source for an upload.
///
/// Reads are blocking; callers run them off the async executor.
pub trait ByteSource: Send + Sync {
    /// Filename reported to the server.
    fn name(&self) -> &str;

    /// Total size in bytes.
    fn len(&self) -> u64;

    /// Returns `true` for a zero-length source.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// MIME type derived from the filename extension.
    fn mime_type(&self) -> &str {
        mime_for_filename(self.name())
    }

    /// Reads bytes `start..end`.
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, TransferError>;
}

fn check_range(start: u64, end: u64, len: u64) -> Result<(), TransferError> {
    if start > end || end > len {
        return Err(TransferError::InvalidRange { start, end, len });
    }
    Ok(())
}

/// File on disk, reopened for every read.
///
/// Reopening means a file that vanished or shrank after planning surfaces
/// as an I/O error on the next read instead of stale data.
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileSource {
    /// Opens `path` and records its current size.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let size = std::fs::metadata(path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Ok(Self {
            path: path.to_path_buf(),
            name,
            size,
        })
    }

    /// Path this source reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, TransferError> {
        check_range(start, end, self.size)?;
        let mut file = std::fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// In-memory bytes.
#[derive(Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>, TransferError> {
        check_range(start, end, self.len())?;
        Ok(self.data[start as usize..end as usize].to_vec())
    }
}
