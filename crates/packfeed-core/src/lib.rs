#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod manifest;
pub mod types;

pub use config::{validate_dims, ConfigError, ReaderConfig};
pub use manifest::{epoch_seed, Manifest, ManifestError};
pub use types::{BufferDims, ManifestEntry};
