use std::io::Read;

use anyhow::{Context, Result};
use packfeed_core::ManifestEntry;

/// Turns one manifest record into the bytes of one sample.
///
/// `out` is exactly `channels * height * width` bytes and may hold data from an
/// earlier fill; implementations must overwrite all of it. Decoding runs on reader
/// threads, so a slow decoder slows production but never blocks consumers.
pub trait RecordDecoder: Send + Sync + 'static {
    fn decode(&self, entry: &ManifestEntry, out: &mut [u8]) -> Result<()>;
}

impl<F> RecordDecoder for F
where
    F: Fn(&ManifestEntry, &mut [u8]) -> Result<()> + Send + Sync + 'static,
{
    fn decode(&self, entry: &ManifestEntry, out: &mut [u8]) -> Result<()> {
        self(entry, out)
    }
}

/// Copies the record file verbatim into the sample slot.
///
/// Short files are zero-padded, long files truncated to the slot size.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFileDecoder;

impl RecordDecoder for RawFileDecoder {
    fn decode(&self, entry: &ManifestEntry, out: &mut [u8]) -> Result<()> {
        let mut f = std::fs::File::open(&entry.path)
            .with_context(|| format!("open record {} (sample_id={})", entry.path, entry.sample_id))?;
        let mut filled = 0usize;
        while filled < out.len() {
            let n = f
                .read(&mut out[filled..])
                .with_context(|| format!("read record {}", entry.path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < out.len() {
            tracing::trace!(
                path = %entry.path,
                bytes = filled as u64,
                slot_bytes = out.len() as u64,
                "short record zero-padded"
            );
        }
        out[filled..].fill(0);
        Ok(())
    }
}

/// Writes the record path into the slot instead of pixel data.
///
/// No I/O; lets a pipeline be exercised end to end with throwaway manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathStampDecoder;

impl PathStampDecoder {
    pub fn decode_into(entry: &ManifestEntry, out: &mut [u8]) {
        let bytes = entry.path.as_bytes();
        let n = bytes.len().min(out.len());
        out[..n].copy_from_slice(&bytes[..n]);
        out[n..].fill(0);
    }

    /// Recovers the path stamped into a sample.
    pub fn read_stamp(sample: &[u8]) -> &str {
        let end = sample.iter().position(|b| *b == 0).unwrap_or(sample.len());
        std::str::from_utf8(&sample[..end]).unwrap_or_default()
    }
}

impl RecordDecoder for PathStampDecoder {
    fn decode(&self, entry: &ManifestEntry, out: &mut [u8]) -> Result<()> {
        Self::decode_into(entry, out);
        Ok(())
    }
}
