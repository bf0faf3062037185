use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BufferDims;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_BUFFERS_PER_QUEUE: usize = 32;
pub const MIN_RETRY_SLEEP_MS: u64 = 1;
pub const MAX_RETRY_SLEEP_MS: u64 = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("manifest_path must be set")]
    MissingManifest,
    #[error("{0} must be > 0")]
    Zero(&'static str),
    #[error("buffer of {channels}x{height}x{width} with batch_size {batch_size} overflows usize")]
    BufferTooLarge {
        channels: usize,
        height: usize,
        width: usize,
        batch_size: usize,
    },
    #[error("pool dims {pool:?} do not match configured dims {configured:?}")]
    DimsMismatch {
        pool: BufferDims,
        configured: BufferDims,
    },
}

/// Fully resolved reader settings.
///
/// Flag/env parsing happens in the binaries; the runtime only ever sees this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub manifest_path: PathBuf,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub batch_size: usize,
    /// Slots per handoff queue.
    pub queue_capacity: usize,
    /// Number of consumer queues (one per solver).
    pub queue_count: usize,
    pub worker_threads: usize,
    pub buffers_per_queue: usize,
    /// Reshuffle the manifest every time a pass over it completes.
    pub shuffle: bool,
    pub seed: u64,
    /// Poll interval of every retry loop; clamped into `1..=10` ms.
    pub retry_sleep_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::new(),
            channels: 3,
            height: 224,
            width: 224,
            batch_size: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_count: 1,
            worker_threads: 1,
            buffers_per_queue: DEFAULT_BUFFERS_PER_QUEUE,
            shuffle: true,
            seed: 0,
            retry_sleep_ms: MIN_RETRY_SLEEP_MS,
        }
    }
}

impl ReaderConfig {
    pub fn dims(&self) -> BufferDims {
        BufferDims {
            channels: self.channels,
            height: self.height,
            width: self.width,
            batch_size: self.batch_size,
        }
    }

    pub fn pool_buffers(&self) -> usize {
        self.buffers_per_queue.saturating_mul(self.queue_count)
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(
            self.retry_sleep_ms
                .clamp(MIN_RETRY_SLEEP_MS, MAX_RETRY_SLEEP_MS),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.manifest_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingManifest);
        }
        self.validate_shape()
    }

    /// Everything [`validate`](Self::validate) checks except the manifest location,
    /// for readers built from an in-memory manifest.
    pub fn validate_shape(&self) -> Result<(), ConfigError> {
        let positive = [
            ("channels", self.channels),
            ("height", self.height),
            ("width", self.width),
            ("batch_size", self.batch_size),
            ("queue_capacity", self.queue_capacity),
            ("queue_count", self.queue_count),
            ("worker_threads", self.worker_threads),
            ("buffers_per_queue", self.buffers_per_queue),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        validate_dims(self.dims())
    }
}

/// Shape checks shared by the config and by pool construction.
pub fn validate_dims(dims: BufferDims) -> Result<(), ConfigError> {
    for (name, v) in [
        ("channels", dims.channels),
        ("height", dims.height),
        ("width", dims.width),
        ("batch_size", dims.batch_size),
    ] {
        if v == 0 {
            return Err(ConfigError::Zero(name));
        }
    }
    if dims.pixel_bytes().is_none() {
        return Err(ConfigError::BufferTooLarge {
            channels: dims.channels,
            height: dims.height,
            width: dims.width,
            batch_size: dims.batch_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ReaderConfig {
        ReaderConfig {
            manifest_path: PathBuf::from("train.txt"),
            ..ReaderConfig::default()
        }
    }

    #[test]
    fn default_with_manifest_is_valid() {
        assert_eq!(valid().validate(), Ok(()));
        assert_eq!(valid().pool_buffers(), DEFAULT_BUFFERS_PER_QUEUE);
    }

    #[test]
    fn missing_manifest_is_rejected() {
        assert_eq!(
            ReaderConfig::default().validate(),
            Err(ConfigError::MissingManifest)
        );
        assert_eq!(ReaderConfig::default().validate_shape(), Ok(()));
    }

    #[test]
    fn zero_fields_are_named() {
        let cfg = ReaderConfig {
            worker_threads: 0,
            ..valid()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("worker_threads")));

        let cfg = ReaderConfig {
            width: 0,
            ..valid()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("width")));
    }

    #[test]
    fn oversized_buffer_is_rejected() {
        let cfg = ReaderConfig {
            channels: usize::MAX,
            height: 2,
            ..valid()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::BufferTooLarge { .. })
        ));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: ReaderConfig = serde_json::from_str(
            r#"{"manifest_path": "val.txt", "batch_size": 16, "queue_count": 2}"#,
        )
        .unwrap();
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.queue_count, 2);
        assert_eq!(cfg.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(cfg.shuffle);
        assert_eq!(cfg.pool_buffers(), 2 * DEFAULT_BUFFERS_PER_QUEUE);
    }

    #[test]
    fn retry_sleep_is_clamped() {
        let cfg = ReaderConfig {
            retry_sleep_ms: 0,
            ..valid()
        };
        assert_eq!(cfg.retry_sleep(), Duration::from_millis(1));
        let cfg = ReaderConfig {
            retry_sleep_ms: 500,
            ..valid()
        };
        assert_eq!(cfg.retry_sleep(), Duration::from_millis(10));
    }
}
