use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::types::ManifestEntry;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot open manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest {origin} contains no entries")]
    Empty { origin: String },
    #[error("manifest line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Ordered list of `(path, label)` records.
///
/// Order is meaningful: it is the traversal order of the current epoch and the
/// input of the next shuffle. A loaded manifest is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Reads a whitespace separated `<path> <label>` manifest from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_named(&text, &path.display().to_string())
    }

    /// Strict: one malformed pair rejects the whole text, nothing read before it is kept.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        Self::parse_named(text, "<inline>")
    }

    /// Builds a manifest from already resolved pairs, assigning sample ids in order.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        let entries: Vec<ManifestEntry> = pairs
            .into_iter()
            .enumerate()
            .map(|(i, (path, label))| ManifestEntry {
                sample_id: i as u64,
                path: path.into(),
                label,
            })
            .collect();
        if entries.is_empty() {
            return Err(ManifestError::Empty {
                origin: "<pairs>".to_string(),
            });
        }
        Ok(Self { entries })
    }

    fn parse_named(text: &str, origin: &str) -> Result<Self, ManifestError> {
        // Tokens are consumed pairwise from the whole stream, so a record may
        // span lines. Line numbers are only used for error reporting.
        let mut tokens = text
            .lines()
            .enumerate()
            .flat_map(|(i, line)| line.split_whitespace().map(move |tok| (i + 1, tok)));

        let mut entries = Vec::new();
        while let Some((line, path)) = tokens.next() {
            let Some((label_line, raw_label)) = tokens.next() else {
                return Err(ManifestError::Parse {
                    line,
                    reason: format!("record {path} has no label"),
                });
            };
            let label: i32 = raw_label.parse().map_err(|_| ManifestError::Parse {
                line: label_line,
                reason: format!("bad label {raw_label:?} for {path}"),
            })?;
            entries.push(ManifestEntry {
                sample_id: entries.len() as u64,
                path: path.to_string(),
                label,
            });
        }

        if entries.is_empty() {
            return Err(ManifestError::Empty {
                origin: origin.to_string(),
            });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&ManifestEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn sample_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.sample_id).collect()
    }

    /// Permutes the entries in place. Identical seeds yield identical permutations.
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.entries.shuffle(&mut rng);
    }
}

/// Seed used for the shuffle that follows `epoch`.
///
/// splitmix64 over the base seed and epoch, so consecutive epochs get unrelated
/// permutations while a restart with the same base seed replays them exactly.
pub fn epoch_seed(base_seed: u64, epoch: u64) -> u64 {
    let mut z = base_seed.wrapping_add(epoch.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
