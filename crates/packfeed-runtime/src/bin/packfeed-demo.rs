#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, info_span, warn};

use packfeed_core::ReaderConfig;
use packfeed_runtime::{FpgaReader, PathStampDecoder, RawFileDecoder, SolverHandle};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DecoderKind {
    /// Copy record files verbatim into the pixel block.
    Raw,
    /// Stamp record paths instead of reading files.
    Stamp,
}

#[derive(Debug, Parser)]
#[command(name = "packfeed-demo")]
struct Args {
    /// Manifest of `<path> <label>` lines.
    #[arg(long, env = "PACKFEED_MANIFEST")]
    manifest: PathBuf,

    #[arg(long, env = "PACKFEED_CHANNELS", default_value_t = 3)]
    channels: usize,

    #[arg(long, env = "PACKFEED_HEIGHT", default_value_t = 224)]
    height: usize,

    #[arg(long, env = "PACKFEED_WIDTH", default_value_t = 224)]
    width: usize,

    #[arg(long, env = "PACKFEED_BATCH_SIZE", default_value_t = 32)]
    batch_size: usize,

    #[arg(long, env = "PACKFEED_QUEUE_CAPACITY", default_value_t = 1024)]
    queue_capacity: usize,

    /// One handoff queue per solver.
    #[arg(long, env = "PACKFEED_SOLVERS", default_value_t = 1)]
    solvers: usize,

    #[arg(long, env = "PACKFEED_WORKERS", default_value_t = 2)]
    workers: usize,

    #[arg(long, env = "PACKFEED_BUFFERS_PER_QUEUE", default_value_t = 32)]
    buffers_per_queue: usize,

    #[arg(long, env = "PACKFEED_NO_SHUFFLE", default_value_t = false)]
    no_shuffle: bool,

    #[arg(long, env = "PACKFEED_SEED", default_value_t = 0)]
    seed: u64,

    #[arg(long, env = "PACKFEED_RETRY_SLEEP_MS", default_value_t = 1)]
    retry_sleep_ms: u64,

    #[arg(long, value_enum, env = "PACKFEED_DECODER", default_value_t = DecoderKind::Stamp)]
    decoder: DecoderKind,

    /// Buffers each solver consumes before the demo stops.
    #[arg(long, env = "PACKFEED_POPS_PER_SOLVER", default_value_t = 1000)]
    pops_per_solver: u64,

    /// Simulated training step time per buffer.
    #[arg(long, env = "PACKFEED_STEP_SLEEP_MS", default_value_t = 0)]
    step_sleep_ms: u64,

    /// Give up if a solver sees no data for this long.
    #[arg(long, env = "PACKFEED_STALL_TIMEOUT_MS", default_value_t = 10_000)]
    stall_timeout_ms: u64,
}

impl Args {
    fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            manifest_path: self.manifest.clone(),
            channels: self.channels,
            height: self.height,
            width: self.width,
            batch_size: self.batch_size,
            queue_capacity: self.queue_capacity,
            queue_count: self.solvers,
            worker_threads: self.workers,
            buffers_per_queue: self.buffers_per_queue,
            shuffle: !self.no_shuffle,
            seed: self.seed,
            retry_sleep_ms: self.retry_sleep_ms,
        }
    }
}

/// Pops and recycles `pops` buffers, returning how many records it saw.
fn consume(solver: SolverHandle, pops: u64, step: Duration, stall: Duration) -> Result<u64> {
    let mut records = 0u64;
    let mut last_data = Instant::now();
    let mut popped = 0u64;
    while popped < pops {
        let Some(buf) = solver.pop_packed_data() else {
            anyhow::ensure!(
                last_data.elapsed() < stall,
                "solver {} starved for {:?}",
                solver.rank(),
                stall
            );
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };
        last_data = Instant::now();
        if !step.is_zero() {
            std::thread::sleep(step);
        }
        records += buf.batch_size() as u64;
        popped += 1;
        if !solver.recycle_packed_data(buf) {
            warn!(rank = solver.rank(), "buffer recycle refused");
        }
    }
    Ok(records)
}

fn main() -> Result<()> {
    packfeed_observe::logging::init_tracing();
    let args = Args::parse();

    let span = info_span!(
        "packfeed-demo",
        manifest = %args.manifest.display(),
        solvers = args.solvers,
        workers = args.workers,
        batch_size = args.batch_size,
    );
    let _enter = span.enter();

    let cfg = args.reader_config();
    let reader = match args.decoder {
        DecoderKind::Raw => FpgaReader::new(cfg, RawFileDecoder)?,
        DecoderKind::Stamp => FpgaReader::new(cfg, PathStampDecoder)?,
    };

    let start = Instant::now();
    reader.start_reading();

    let step = Duration::from_millis(args.step_sleep_ms);
    let stall = Duration::from_millis(args.stall_timeout_ms.max(1));
    let pops = args.pops_per_solver;
    let results: Vec<Result<u64>> = std::thread::scope(|s| {
        let joins: Vec<_> = reader
            .solvers()
            .into_iter()
            .map(|solver| s.spawn(move || consume(solver, pops, step, stall)))
            .collect();
        joins
            .into_iter()
            .map(|j| {
                j.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("solver thread panicked")))
            })
            .collect()
    });

    reader.stop();
    let elapsed = start.elapsed();

    let mut records = 0u64;
    for res in results {
        records += res?;
    }

    let stats = reader.stats();
    let m = reader.metrics();
    let fill = m.fill_time.snapshot();
    let shuffle = reader.shuffle_time().snapshot();
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        records as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        target: "packfeed_metrics",
        produced_buffers_total = m.produced_buffers_total.get(),
        produced_records_total = m.produced_records_total.get(),
        push_retries_total = m.push_retries_total.get(),
        recycle_empty_total = m.recycle_empty_total.get(),
        decode_failures_total = m.decode_failures_total.get(),
        inflight_buffers_high_water = m.inflight_buffers_high_water.get(),
        fill_avg_ns = fill.avg_ns(),
        fill_max_ns = fill.max_ns,
        shuffle_avg_ns = shuffle.avg_ns(),
        epochs_completed = stats.epochs_completed,
        free_buffers = stats.free_buffers as u64,
        "metrics"
    );
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        records,
        records_per_sec = throughput,
        "demo complete"
    );
    Ok(())
}
