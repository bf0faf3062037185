use std::sync::{Mutex, MutexGuard};

use packfeed_core::{epoch_seed, Manifest, ManifestEntry};
use packfeed_observe::metrics::{Counter, DurationAgg, ScopedTimer};

/// One record handed out by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    /// Global record number since the reader started.
    pub record: u64,
    pub epoch: u64,
    /// Position inside the epoch's manifest order.
    pub index: usize,
    pub entry: ManifestEntry,
}

/// A contiguous run of records destined for one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReservation {
    /// Global buffer sequence; drives round-robin queue selection.
    pub sequence: u64,
    pub tickets: Vec<Ticket>,
}

impl BatchReservation {
    pub fn epoch(&self) -> u64 {
        self.tickets.first().map(|t| t.epoch).unwrap_or_default()
    }
}

#[derive(Debug)]
struct Cursor {
    manifest: Manifest,
    position: usize,
    epoch: u64,
    next_record: u64,
    next_sequence: u64,
}

/// Shared manifest cursor.
///
/// The cursor and the manifest sit behind one lock, so handing out an index and
/// reshuffling at the wrap can never interleave: the worker that takes the last
/// record of a pass performs the shuffle while the others wait on the lock.
#[derive(Debug)]
pub struct EpochScheduler {
    cursor: Mutex<Cursor>,
    shuffle: bool,
    seed: u64,
    epochs_completed: Counter,
    shuffle_time: DurationAgg,
}

impl EpochScheduler {
    pub fn new(manifest: Manifest, shuffle: bool, seed: u64) -> Self {
        Self {
            cursor: Mutex::new(Cursor {
                manifest,
                position: 0,
                epoch: 0,
                next_record: 0,
                next_sequence: 0,
            }),
            shuffle,
            seed,
            epochs_completed: Counter::default(),
            shuffle_time: DurationAgg::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the next record and advances the cursor, wrapping at the end of a pass.
    pub fn next_index(&self) -> Ticket {
        let mut cursor = self.lock();
        self.take(&mut cursor)
    }

    /// Reserves `count` consecutive records under a single buffer sequence number.
    pub fn reserve_batch(&self, count: usize) -> BatchReservation {
        let mut cursor = self.lock();
        let sequence = cursor.next_sequence;
        cursor.next_sequence = cursor.next_sequence.wrapping_add(1);
        let tickets = (0..count).map(|_| self.take(&mut cursor)).collect();
        BatchReservation { sequence, tickets }
    }

    fn take(&self, cursor: &mut Cursor) -> Ticket {
        let index = cursor.position;
        // A loaded manifest is never empty and the position is wrapped eagerly,
        // so `index` is always in range.
        let entry = cursor.manifest.entries()[index].clone();
        let ticket = Ticket {
            record: cursor.next_record,
            epoch: cursor.epoch,
            index,
            entry,
        };
        cursor.next_record = cursor.next_record.wrapping_add(1);
        cursor.position += 1;
        if cursor.position >= cursor.manifest.len() {
            self.on_epoch_complete(cursor);
        }
        ticket
    }

    fn on_epoch_complete(&self, cursor: &mut Cursor) {
        let finished = cursor.epoch;
        let timer = ScopedTimer::new(&self.shuffle_time);
        if self.shuffle {
            cursor.manifest.shuffle(epoch_seed(self.seed, finished));
        }
        let elapsed = timer.stop();
        self.epochs_completed.inc();
        cursor.position = 0;
        cursor.epoch = finished + 1;
        tracing::info!(
            target: "packfeed_epoch",
            epoch = finished,
            records = cursor.manifest.len() as u64,
            shuffled = self.shuffle,
            elapsed_us = elapsed.as_micros() as u64,
            "pass over manifest complete"
        );
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn position(&self) -> usize {
        self.lock().position
    }

    pub fn manifest_len(&self) -> usize {
        self.lock().manifest.len()
    }

    /// Copy of the manifest in the order the current epoch traverses it.
    pub fn manifest_snapshot(&self) -> Manifest {
        self.lock().manifest.clone()
    }

    pub fn epochs_completed(&self) -> u64 {
        self.epochs_completed.get()
    }

    pub fn shuffle_time(&self) -> &DurationAgg {
        &self.shuffle_time
    }
}
