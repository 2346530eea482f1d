use crate::TransferError;
use crate::types::ChunkDescriptor;

/// Number of chunks needed for `total_size` bytes (ceiling division).
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Partitions `total_size` bytes into contiguous chunks of `chunk_size`.
///
/// Every chunk but the last is exactly `chunk_size` long; the last one holds
/// the remainder and is never empty. Chunk indices are `u32`, so a plan
/// that would need more chunks than that is rejected.
pub fn plan(total_size: u64, chunk_size: i64) -> Result<Vec<ChunkDescriptor>, TransferError> {
    if chunk_size <= 0 {
        return Err(TransferError::InvalidChunkSize(chunk_size));
    }
    if total_size == 0 {
        return Err(TransferError::EmptyFile);
    }

    let chunk_size = chunk_size as u64;
    let count = chunk_count(total_size, chunk_size);
    let count = u32::try_from(count).map_err(|_| TransferError::TooManyChunks(count))?;
    let chunks = (0..count)
        .map(|i| {
            let start = u64::from(i) * chunk_size;
            let end = total_size.min(start + chunk_size);
            ChunkDescriptor::new(i, start, end)
        })
        .collect();
    Ok(chunks)
}
