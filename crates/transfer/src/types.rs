use serde::{Deserialize, Serialize};

/// One planned byte range of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// 0-based position in the plan.
    pub index: u32,
    /// First byte (inclusive).
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
    /// MD5 hex of the chunk bytes, filled in when the chunk is read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Acknowledged by the server.
    #[serde(default)]
    pub uploaded: bool,
    /// Failed attempts since the last reset.
    #[serde(default)]
    pub attempts: u32,
}

impl ChunkDescriptor {
    /// Creates a fresh, not-yet-uploaded descriptor.
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            digest: None,
            uploaded: false,
            attempts: 0,
        }
    }

    /// Size of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always `false` for planner output.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}
