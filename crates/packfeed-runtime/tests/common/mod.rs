//! Helpers shared by the reader integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use anyhow::Result;
use packfeed_core::Manifest;
use packfeed_runtime::{FpgaReader, PackedBuffer};

/// Manifest of `n` records named `rec{i}` with label `i`.
pub fn numbered(n: usize) -> Result<Manifest> {
    Ok(Manifest::from_pairs(
        (0..n).map(|i| (format!("rec{i}"), i as i32)),
    )?)
}

/// Polls queue `rank` until a buffer shows up or `timeout` passes.
pub fn pop_within(reader: &FpgaReader, rank: usize, timeout: Duration) -> Result<PackedBuffer> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(buf) = reader.pop_packed_data(rank) {
            return Ok(buf);
        }
        anyhow::ensure!(
            Instant::now() < deadline,
            "queue {rank} produced nothing within {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(1));
    }
}
