use serde::{Deserialize, Serialize};

/// A single record of the manifest: where the raw sample lives and its class label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Position of the entry in the manifest file. Stable across shuffles.
    pub sample_id: u64,
    pub path: String,
    pub label: i32,
}

/// Fixed shape of one packed buffer.
///
/// A buffer holds `batch_size` samples of `channels * height * width` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferDims {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub batch_size: usize,
}

impl BufferDims {
    /// Bytes occupied by a single sample, `None` on overflow.
    pub fn sample_bytes(&self) -> Option<usize> {
        self.channels
            .checked_mul(self.height)?
            .checked_mul(self.width)
    }

    /// Bytes occupied by the whole pixel block, `None` on overflow.
    pub fn pixel_bytes(&self) -> Option<usize> {
        self.sample_bytes()?.checked_mul(self.batch_size)
    }
}
