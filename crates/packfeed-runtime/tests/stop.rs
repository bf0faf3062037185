use std::time::{Duration, Instant};

use anyhow::Result;

use packfeed_core::{Manifest, ManifestEntry, ReaderConfig};
use packfeed_runtime::{FpgaReader, PathStampDecoder, WorkerState};

mod common;

use common::{numbered, pop_within};

fn config(workers: usize) -> ReaderConfig {
    ReaderConfig {
        channels: 1,
        height: 1,
        width: 8,
        worker_threads: workers,
        buffers_per_queue: 6,
        retry_sleep_ms: 2,
        shuffle: false,
        ..ReaderConfig::default()
    }
}

#[test]
fn stop_joins_quickly_and_leaks_no_buffers() -> Result<()> {
    let slow = |entry: &ManifestEntry, out: &mut [u8]| -> Result<()> {
        std::thread::sleep(Duration::from_millis(5));
        PathStampDecoder::decode_into(entry, out);
        Ok(())
    };
    let reader = FpgaReader::with_manifest(config(2), numbered(32)?, slow)?;
    reader.start_reading();

    let held = pop_within(&reader, 0, Duration::from_secs(5))?;
    std::thread::sleep(Duration::from_millis(12));

    let start = Instant::now();
    reader.stop();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(200), "join took {elapsed:?}");
    assert_eq!(
        reader.worker_states(),
        vec![WorkerState::Stopped, WorkerState::Stopped]
    );

    let stats = reader.stats();
    let queued: usize = stats.queue_depths.iter().sum();
    assert_eq!(1 + queued + stats.free_buffers, stats.pool_buffers);

    // Already published buffers stay consumable after stop.
    if queued > 0 {
        let next = pop_within(&reader, 0, Duration::from_millis(10))?;
        assert!(next.sequence() > held.sequence());
        assert!(reader.recycle_packed_data(next));
    }
    assert!(reader.recycle_packed_data(held));
    reader.stop();
    Ok(())
}

#[test]
fn dropping_an_unstarted_reader_does_not_hang() -> Result<()> {
    let reader = FpgaReader::with_manifest(config(3), numbered(4)?, PathStampDecoder)?;
    std::thread::sleep(Duration::from_millis(10));
    assert!(reader
        .worker_states()
        .iter()
        .all(|s| *s == WorkerState::WaitingToStart));

    let start = Instant::now();
    drop(reader);
    assert!(start.elapsed() < Duration::from_millis(200));
    Ok(())
}

#[test]
fn decode_fault_stops_only_the_faulty_reader() -> Result<()> {
    let picky = |entry: &ManifestEntry, out: &mut [u8]| -> Result<()> {
        anyhow::ensure!(entry.path != "bad", "corrupt record {}", entry.path);
        PathStampDecoder::decode_into(entry, out);
        Ok(())
    };
    let manifest = Manifest::from_pairs([("ok0", 0), ("bad", 1), ("ok2", 2), ("ok3", 3)])?;
    let reader = FpgaReader::with_manifest(config(2), manifest, picky)?;
    reader.start_reading();

    let mut labels = Vec::new();
    for _ in 0..3 {
        let buf = pop_within(&reader, 0, Duration::from_secs(5))?;
        labels.push(buf.labels()[0]);
        assert!(reader.recycle_packed_data(buf));
    }
    assert_eq!(labels, vec![0, 2, 3]);
    assert!(reader.metrics().decode_failures_total.get() >= 1);

    // The faulty reader marks itself stopped right after unblocking its lane.
    let deadline = Instant::now() + Duration::from_secs(1);
    while !reader.worker_states().contains(&WorkerState::Stopped) {
        anyhow::ensure!(Instant::now() < deadline, "faulty reader never exited");
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

#[test]
fn decoder_panic_is_treated_as_a_decode_fault() -> Result<()> {
    let brittle = |entry: &ManifestEntry, out: &mut [u8]| -> Result<()> {
        if entry.path == "bad" {
            panic!("decoder blew up on {}", entry.path);
        }
        PathStampDecoder::decode_into(entry, out);
        Ok(())
    };
    let manifest = Manifest::from_pairs([("ok0", 0), ("bad", 1), ("ok2", 2), ("ok3", 3)])?;
    let reader = FpgaReader::with_manifest(config(2), manifest, brittle)?;
    reader.start_reading();

    let mut labels = Vec::new();
    for _ in 0..3 {
        let buf = pop_within(&reader, 0, Duration::from_secs(5))?;
        labels.push(buf.labels()[0]);
        assert!(reader.recycle_packed_data(buf));
    }
    assert_eq!(labels, vec![0, 2, 3]);
    assert!(reader.metrics().decode_failures_total.get() >= 1);

    let deadline = Instant::now() + Duration::from_secs(1);
    while !reader.worker_states().contains(&WorkerState::Stopped) {
        anyhow::ensure!(Instant::now() < deadline, "panicking reader never exited");
        std::thread::sleep(Duration::from_millis(1));
    }

    // The panicking reader's buffer went back to the pool.
    reader.stop();
    let stats = reader.stats();
    let queued: usize = stats.queue_depths.iter().sum();
    assert_eq!(queued + stats.free_buffers, stats.pool_buffers);
    Ok(())
}

#[test]
fn faulty_reader_reports_stopping_while_it_waits_for_its_turn() -> Result<()> {
    let uneven = |entry: &ManifestEntry, out: &mut [u8]| -> Result<()> {
        match entry.path.as_str() {
            "slow" => std::thread::sleep(Duration::from_millis(300)),
            "bad" => anyhow::bail!("corrupt record {}", entry.path),
            _ => {}
        }
        PathStampDecoder::decode_into(entry, out);
        Ok(())
    };
    let manifest = Manifest::from_pairs([("slow", 0), ("bad", 1), ("ok2", 2)])?;
    let reader = FpgaReader::with_manifest(config(2), manifest, uneven)?;
    reader.start_reading();

    // The faulty reader cannot skip its turn until the slow record is published.
    let deadline = Instant::now() + Duration::from_millis(250);
    while !reader.worker_states().contains(&WorkerState::Stopping) {
        anyhow::ensure!(Instant::now() < deadline, "faulty reader never reported stopping");
        std::thread::sleep(Duration::from_millis(1));
    }

    let first = pop_within(&reader, 0, Duration::from_secs(5))?;
    assert_eq!(first.labels(), &[0]);
    assert!(reader.recycle_packed_data(first));
    let next = pop_within(&reader, 0, Duration::from_secs(5))?;
    assert_eq!(next.labels(), &[2]);
    assert!(reader.recycle_packed_data(next));
    Ok(())
}
