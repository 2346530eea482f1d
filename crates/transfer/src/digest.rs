use md5::{Digest, Md5};

use crate::TransferError;
use crate::source::ByteSource;

/// Bytes read per step when hashing a source: 1 MiB.
pub const DEFAULT_SLICE_SIZE: u64 = 1024 * 1024;

/// Computes MD5 of `data` and returns the hex-encoded digest.
pub fn digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes MD5 of bytes `start..end` of `source`.
///
/// At most `slice_size` bytes are held in memory at a time. The result
/// does not depend on `slice_size`.
pub fn digest_range(
    source: &dyn ByteSource,
    start: u64,
    end: u64,
    slice_size: u64,
) -> Result<String, TransferError> {
    let slice_size = if slice_size == 0 {
        DEFAULT_SLICE_SIZE
    } else {
        slice_size
    };

    let mut hasher = Md5::new();
    let mut offset = start;
    while offset < end {
        let slice_end = end.min(offset.saturating_add(slice_size));
        let buf = source.read_range(offset, slice_end)?;
        hasher.update(&buf);
        offset = slice_end;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes MD5 of the whole source.
pub fn digest_source(source: &dyn ByteSource, slice_size: u64) -> Result<String, TransferError> {
    digest_range(source, 0, source.len(), slice_size)
}
