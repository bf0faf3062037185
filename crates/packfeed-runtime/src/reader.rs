use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use packfeed_core::{ConfigError, Manifest, ManifestError, ReaderConfig};
use packfeed_observe::metrics::{Counter, DurationAgg, Gauge};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::buffer::{BufferPool, PackedBuffer};
use crate::decode::RecordDecoder;
use crate::queue::Lane;
use crate::scheduler::EpochScheduler;
use crate::worker::{run_worker, PipelineContext, WorkerState};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn reader thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Default)]
pub struct ReaderMetrics {
    pub produced_buffers_total: Counter,
    pub produced_records_total: Counter,
    pub push_retries_total: Counter,
    /// Iterations that found no free buffer to fill.
    pub recycle_empty_total: Counter,
    pub decode_failures_total: Counter,
    pub popped_buffers_total: Counter,
    pub recycled_buffers_total: Counter,
    pub rejected_recycles_total: Counter,
    /// Buffers published to a queue and not yet recycled.
    pub inflight_buffers: Gauge,
    pub inflight_buffers_high_water: Gauge,
    pub fill_time: DurationAgg,
}

impl ReaderMetrics {
    pub(crate) fn on_published(&self) {
        let now = self.inflight_buffers.add(1);
        self.inflight_buffers_high_water.max(now);
    }

    pub(crate) fn on_returned(&self) {
        self.inflight_buffers.sub(1);
    }
}

/// Point-in-time view of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStats {
    pub pool_buffers: usize,
    pub free_buffers: usize,
    pub queue_depths: Vec<usize>,
    pub epoch: u64,
    pub position: usize,
    pub epochs_completed: u64,
    pub produced_buffers: u64,
    pub popped_buffers: u64,
    pub recycled_buffers: u64,
    pub inflight_buffers: u64,
}

impl PipelineContext {
    fn pop(&self, rank: usize) -> Option<PackedBuffer> {
        let buf = self.lanes.get(rank)?.queue.try_pop()?;
        self.metrics.popped_buffers_total.inc();
        Some(buf)
    }

    fn recycle(&self, buf: PackedBuffer) -> bool {
        let slot = buf.slot();
        match self.pool.release(buf) {
            Ok(()) => {
                self.metrics.recycled_buffers_total.inc();
                self.metrics.on_returned();
                true
            }
            Err(err) => {
                self.metrics.rejected_recycles_total.inc();
                warn!(slot, error = %err, "recycle rejected");
                false
            }
        }
    }
}

/// Background reader feeding fixed-shape buffers to one or more solvers.
///
/// Owns the manifest cursor, the buffer pool, one handoff queue per solver and the
/// reader threads. Threads are spawned at construction but produce nothing until
/// [`start_reading`](Self::start_reading); dropping the reader stops and joins them.
pub struct FpgaReader {
    ctx: Arc<PipelineContext>,
    config: ReaderConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FpgaReader {
    /// Loads the manifest named by `config` and starts the (gated) reader threads.
    pub fn new<D: RecordDecoder>(config: ReaderConfig, decoder: D) -> Result<Self, ReaderError> {
        config.validate()?;
        info!(path = %config.manifest_path.display(), "opening manifest");
        let manifest = Manifest::load(&config.manifest_path)?;
        Self::with_manifest(config, manifest, decoder)
    }

    pub fn with_manifest<D: RecordDecoder>(
        config: ReaderConfig,
        manifest: Manifest,
        decoder: D,
    ) -> Result<Self, ReaderError> {
        config.validate_shape()?;
        let pool = BufferPool::new(config.dims(), config.pool_buffers())?;
        Self::from_parts(config, manifest, pool, decoder)
    }

    /// Builds a reader around an existing pool, whose shape must match `config`.
    pub fn from_parts<D: RecordDecoder>(
        config: ReaderConfig,
        manifest: Manifest,
        pool: BufferPool,
        decoder: D,
    ) -> Result<Self, ReaderError> {
        config.validate_shape()?;
        if pool.dims() != config.dims() {
            return Err(ConfigError::DimsMismatch {
                pool: pool.dims(),
                configured: config.dims(),
            }
            .into());
        }
        info!(records = manifest.len() as u64, "manifest loaded");

        let lanes = (0..config.queue_count)
            .map(|_| Lane::new(config.queue_capacity))
            .collect();
        let scheduler = EpochScheduler::new(manifest, config.shuffle, config.seed);
        let ctx = Arc::new(PipelineContext::new(
            pool,
            lanes,
            scheduler,
            Arc::new(decoder),
            config.retry_sleep(),
            config.batch_size,
            config.worker_threads,
        ));

        let reader = Self {
            ctx,
            config,
            workers: Mutex::new(Vec::new()),
        };
        reader.spawn_workers()?;
        info!(
            workers = reader.config.worker_threads,
            queues = reader.config.queue_count,
            batch_size = reader.config.batch_size,
            "reader constructed"
        );
        Ok(reader)
    }

    fn spawn_workers(&self) -> Result<(), ReaderError> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..self.config.worker_threads {
            let ctx = self.ctx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("packfeed-reader-{worker}"))
                .spawn(move || run_worker(ctx, worker));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    drop(workers);
                    self.stop();
                    return Err(ReaderError::Spawn(err));
                }
            }
        }
        Ok(())
    }

    /// Lets the reader threads begin producing. Only the first call has any effect.
    pub fn start_reading(&self) {
        if self.ctx.gate.release() {
            info!("start gate released");
        }
    }

    /// Takes the next buffer from solver `rank`'s queue, if one is ready.
    pub fn pop_packed_data(&self, rank: usize) -> Option<PackedBuffer> {
        self.ctx.pop(rank)
    }

    /// Gives a consumed buffer back for refilling. False if the buffer is not ours.
    pub fn recycle_packed_data(&self, buf: PackedBuffer) -> bool {
        self.ctx.recycle(buf)
    }

    pub fn solver(&self, rank: usize) -> Option<SolverHandle> {
        (rank < self.ctx.lanes.len()).then(|| SolverHandle {
            ctx: self.ctx.clone(),
            rank,
        })
    }

    pub fn solvers(&self) -> Vec<SolverHandle> {
        (0..self.ctx.lanes.len())
            .filter_map(|rank| self.solver(rank))
            .collect()
    }

    /// Asks every reader thread to exit without waiting for them.
    pub fn request_stop(&self) {
        self.ctx.stop.request();
    }

    /// Stops and joins all reader threads. Safe to call repeatedly.
    pub fn stop(&self) {
        self.ctx.stop.request();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        let start = Instant::now();
        for handle in handles {
            if handle.join().is_err() {
                error!("reader thread panicked");
            }
        }
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "reader threads joined"
        );
    }

    pub fn is_stop_requested(&self) -> bool {
        self.ctx.stop.is_requested()
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ReaderMetrics {
        &self.ctx.metrics
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.ctx.worker_states()
    }

    /// Manifest in the order the current epoch walks it.
    pub fn manifest_snapshot(&self) -> Manifest {
        self.ctx.scheduler.manifest_snapshot()
    }

    pub fn shuffle_time(&self) -> &DurationAgg {
        self.ctx.scheduler.shuffle_time()
    }

    pub fn stats(&self) -> ReaderStats {
        let m = &self.ctx.metrics;
        ReaderStats {
            pool_buffers: self.ctx.pool.size(),
            free_buffers: self.ctx.pool.free_len(),
            queue_depths: self.ctx.lanes.iter().map(|l| l.queue.len()).collect(),
            epoch: self.ctx.scheduler.epoch(),
            position: self.ctx.scheduler.position(),
            epochs_completed: self.ctx.scheduler.epochs_completed(),
            produced_buffers: m.produced_buffers_total.get(),
            popped_buffers: m.popped_buffers_total.get(),
            recycled_buffers: m.recycled_buffers_total.get(),
            inflight_buffers: m.inflight_buffers.get(),
        }
    }
}

impl Drop for FpgaReader {
    fn drop(&mut self) {
        self.stop();
        info!("reader goodbye");
    }
}

/// Consumer-side view bound to one solver's queue. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct SolverHandle {
    ctx: Arc<PipelineContext>,
    rank: usize,
}

impl SolverHandle {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn pop_packed_data(&self) -> Option<PackedBuffer> {
        self.ctx.pop(self.rank)
    }

    pub fn recycle_packed_data(&self, buf: PackedBuffer) -> bool {
        self.ctx.recycle(buf)
    }

    pub fn queue_depth(&self) -> usize {
        self.ctx
            .lanes
            .get(self.rank)
            .map(|l| l.queue.len())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for SolverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverHandle").field("rank", &self.rank).finish()
    }
}
