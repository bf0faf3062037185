use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use packfeed_core::ManifestEntry;
use packfeed_observe::metrics::ScopedTimer;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferPool, PackedBuffer};
use crate::decode::RecordDecoder;
use crate::queue::Lane;
use crate::reader::ReaderMetrics;
use crate::scheduler::{BatchReservation, EpochScheduler};
use crate::signal::{StartGate, StopSignal};

/// Rejected pushes between two "queue full" warnings.
const PUSH_WARN_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    WaitingToStart = 0,
    Producing = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::WaitingToStart,
            1 => Self::Producing,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Everything the reader threads and the consumers share.
pub(crate) struct PipelineContext {
    pub(crate) pool: BufferPool,
    pub(crate) lanes: Vec<Lane>,
    pub(crate) scheduler: EpochScheduler,
    pub(crate) decoder: Arc<dyn RecordDecoder>,
    pub(crate) gate: StartGate,
    pub(crate) stop: StopSignal,
    pub(crate) metrics: ReaderMetrics,
    pub(crate) retry: Duration,
    pub(crate) batch_size: usize,
    states: Box<[AtomicU8]>,
}

impl PipelineContext {
    pub(crate) fn new(
        pool: BufferPool,
        lanes: Vec<Lane>,
        scheduler: EpochScheduler,
        decoder: Arc<dyn RecordDecoder>,
        retry: Duration,
        batch_size: usize,
        workers: usize,
    ) -> Self {
        Self {
            pool,
            lanes,
            scheduler,
            decoder,
            gate: StartGate::new(),
            stop: StopSignal::new(),
            metrics: ReaderMetrics::default(),
            retry,
            batch_size,
            states: (0..workers)
                .map(|_| AtomicU8::new(WorkerState::WaitingToStart as u8))
                .collect(),
        }
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.states
            .iter()
            .map(|s| WorkerState::from_u8(s.load(Ordering::Acquire)))
            .collect()
    }

    fn set_state(&self, worker: usize, state: WorkerState) {
        if let Some(s) = self.states.get(worker) {
            s.store(state as u8, Ordering::Release);
        }
    }

    fn lane_for(&self, sequence: u64) -> (usize, u64) {
        let lanes = self.lanes.len().max(1) as u64;
        ((sequence % lanes) as usize, sequence / lanes)
    }

    /// Hands a buffer the worker still owns back to the free list.
    fn give_back(&self, worker: usize, buf: PackedBuffer) {
        if let Err(err) = self.pool.release(buf) {
            error!(worker, error = %err, "failed to return buffer to pool");
        }
    }
}

/// Body of one reader thread.
///
/// Waits for the start gate, then loops: take a free buffer, reserve the next batch
/// of records, decode them into the buffer, publish it on its round-robin lane.
/// The stop flag is checked between steps, never in the middle of a decode. A decoder
/// error or panic ends only this thread, after its buffer and lane turn are released.
pub(crate) fn run_worker(ctx: Arc<PipelineContext>, worker: usize) {
    ctx.set_state(worker, WorkerState::WaitingToStart);
    debug!(worker, "reader waiting for start gate");
    if !ctx.gate.wait(&ctx.stop) {
        ctx.set_state(worker, WorkerState::Stopped);
        debug!(worker, "reader stopped before start");
        return;
    }
    ctx.set_state(worker, WorkerState::Producing);
    info!(worker, "reader producing");

    loop {
        if ctx.stop.is_requested() {
            ctx.set_state(worker, WorkerState::Stopping);
            break;
        }
        let Some(mut buf) = ctx.pool.try_acquire() else {
            ctx.metrics.recycle_empty_total.inc();
            std::thread::sleep(ctx.retry);
            continue;
        };

        let batch = ctx.scheduler.reserve_batch(ctx.batch_size);
        let (lane_idx, turn) = ctx.lane_for(batch.sequence);

        if let Err(err) = fill(&ctx, &mut buf, &batch) {
            ctx.set_state(worker, WorkerState::Stopping);
            ctx.metrics.decode_failures_total.inc();
            error!(
                worker,
                sequence = batch.sequence,
                error = ?err,
                "decode failed; reader exiting"
            );
            ctx.give_back(worker, buf);
            // Let the lane move past the sequence this worker will never publish.
            if let Some(lane) = ctx.lanes.get(lane_idx) {
                if lane.wait_turn(turn, &ctx.stop, ctx.retry) {
                    lane.finish_turn();
                }
            }
            break;
        }

        match publish(&ctx, worker, lane_idx, turn, buf) {
            Ok(()) => {
                ctx.metrics.produced_buffers_total.inc();
                ctx.metrics
                    .produced_records_total
                    .inc_by(batch.tickets.len() as u64);
            }
            Err(buf) => {
                ctx.set_state(worker, WorkerState::Stopping);
                ctx.give_back(worker, buf);
                break;
            }
        }
    }

    ctx.set_state(worker, WorkerState::Stopped);
    info!(worker, "reader exited");
}

fn fill(
    ctx: &PipelineContext,
    buf: &mut PackedBuffer,
    batch: &BatchReservation,
) -> anyhow::Result<()> {
    let _timer = ScopedTimer::new(&ctx.metrics.fill_time);
    for (i, ticket) in batch.tickets.iter().enumerate() {
        let out = buf
            .sample_mut(i)
            .ok_or_else(|| anyhow::anyhow!("batch slot {i} out of range"))?;
        decode_guarded(ctx.decoder.as_ref(), &ticket.entry, out)?;
        buf.set_record(i, &ticket.entry);
    }
    buf.stamp(batch.sequence, batch.epoch());
    Ok(())
}

/// Runs the decoder, turning a panic into an ordinary decode error.
fn decode_guarded(
    decoder: &dyn RecordDecoder,
    entry: &ManifestEntry,
    out: &mut [u8],
) -> anyhow::Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(entry, out))) {
        Ok(res) => res,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("decoder panicked on {}: {msg}", entry.path))
        }
    }
}

/// Waits for the lane's turn, then pushes with bounded-sleep retries.
///
/// The buffer is handed back only if a stop arrives first; a full queue is never a
/// reason to drop a produced buffer.
fn publish(
    ctx: &PipelineContext,
    worker: usize,
    lane_idx: usize,
    turn: u64,
    buf: PackedBuffer,
) -> Result<(), PackedBuffer> {
    let Some(lane) = ctx.lanes.get(lane_idx) else {
        error!(worker, queue = lane_idx, "no such queue");
        return Err(buf);
    };
    if !lane.wait_turn(turn, &ctx.stop, ctx.retry) {
        return Err(buf);
    }

    let sequence = buf.sequence();
    // Counted before the push: a consumer may pop and recycle it immediately.
    ctx.metrics.on_published();
    let res = lane
        .queue
        .push_with_backoff(buf, &ctx.stop, ctx.retry, |rejected| {
            ctx.metrics.push_retries_total.inc();
            if rejected % PUSH_WARN_EVERY == 0 {
                warn!(
                    worker,
                    queue = lane_idx,
                    sequence,
                    rejected,
                    "queue full; consumer is not keeping up"
                );
            }
        });
    match res {
        Ok(()) => lane.finish_turn(),
        Err(_) => ctx.metrics.on_returned(),
    }
    res
}
