use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use packfeed_core::config::validate_dims;
use packfeed_core::{BufferDims, ConfigError, ManifestEntry};
use thiserror::Error;

use crate::queue::RecycleChannel;
use crate::signal::StopSignal;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of training data: `batch_size` samples plus their labels.
///
/// Storage is allocated once by the owning [`BufferPool`] and never resized. The type
/// is deliberately not `Clone`: holding the value is holding the buffer, so a buffer
/// is free, being filled, or in flight, never two of those at once.
#[derive(Debug)]
pub struct PackedBuffer {
    pool_id: u64,
    slot: usize,
    dims: BufferDims,
    sample_bytes: usize,
    pixels: Box<[u8]>,
    labels: Box<[i32]>,
    sample_ids: Box<[u64]>,
    sequence: u64,
    epoch: u64,
}

impl PackedBuffer {
    fn new(pool_id: u64, slot: usize, dims: BufferDims, sample_bytes: usize) -> Self {
        Self {
            pool_id,
            slot,
            dims,
            sample_bytes,
            pixels: vec![0u8; sample_bytes * dims.batch_size].into_boxed_slice(),
            labels: vec![0i32; dims.batch_size].into_boxed_slice(),
            sample_ids: vec![0u64; dims.batch_size].into_boxed_slice(),
            sequence: 0,
            epoch: 0,
        }
    }

    /// Index of this buffer inside its pool.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn dims(&self) -> BufferDims {
        self.dims
    }

    pub fn channels(&self) -> usize {
        self.dims.channels
    }

    pub fn height(&self) -> usize {
        self.dims.height
    }

    pub fn width(&self) -> usize {
        self.dims.width
    }

    pub fn batch_size(&self) -> usize {
        self.dims.batch_size
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    /// Manifest sample ids of the records packed into this buffer, in batch order.
    pub fn sample_ids(&self) -> &[u64] {
        &self.sample_ids
    }

    /// Global publication sequence; decides which solver queue received the buffer.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Epoch of the first record in the buffer.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn sample(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.sample_bytes)?;
        self.pixels.get(start..start.checked_add(self.sample_bytes)?)
    }

    pub(crate) fn sample_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let start = index.checked_mul(self.sample_bytes)?;
        let end = start.checked_add(self.sample_bytes)?;
        self.pixels.get_mut(start..end)
    }

    pub(crate) fn set_record(&mut self, index: usize, entry: &ManifestEntry) {
        if let (Some(label), Some(id)) = (self.labels.get_mut(index), self.sample_ids.get_mut(index))
        {
            *label = entry.label;
            *id = entry.sample_id;
        }
    }

    pub(crate) fn stamp(&mut self, sequence: u64, epoch: u64) {
        self.sequence = sequence;
        self.epoch = epoch;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("buffer slot {slot} belongs to another pool")]
    ForeignBuffer { slot: usize },
    #[error("free list already holds every buffer; slot {slot} released twice")]
    Overfull { slot: usize },
}

/// Fixed set of preallocated buffers.
///
/// The free list is a [`RecycleChannel`]: consumers hand buffers back through it and
/// producers take them out again, so no buffer memory is allocated after construction.
#[derive(Debug)]
pub struct BufferPool {
    id: u64,
    dims: BufferDims,
    size: usize,
    free: RecycleChannel,
}

impl BufferPool {
    /// Allocates `size` buffers of shape `dims`, all starting out free.
    pub fn new(dims: BufferDims, size: usize) -> Result<Self, ConfigError> {
        validate_dims(dims)?;
        if size == 0 {
            return Err(ConfigError::Zero("buffers_per_queue"));
        }
        let sample_bytes = dims.sample_bytes().ok_or(ConfigError::BufferTooLarge {
            channels: dims.channels,
            height: dims.height,
            width: dims.width,
            batch_size: dims.batch_size,
        })?;

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let free = RecycleChannel::new(size);
        for slot in 0..size {
            // Capacity equals size, so this cannot be rejected.
            let _ = free.try_push(PackedBuffer::new(id, slot, dims, sample_bytes));
        }
        tracing::info!(
            buffers = size,
            channels = dims.channels,
            height = dims.height,
            width = dims.width,
            batch_size = dims.batch_size,
            "buffer pool constructed"
        );
        Ok(Self {
            id,
            dims,
            size,
            free,
        })
    }

    pub fn dims(&self) -> BufferDims {
        self.dims
    }

    /// Total number of buffers owned by the pool, whatever their state.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Takes a free buffer without blocking.
    pub fn try_acquire(&self) -> Option<PackedBuffer> {
        self.free.try_pop()
    }

    /// Polls for a free buffer every `retry` until one shows up or `stop` is requested.
    pub fn acquire(&self, stop: &StopSignal, retry: Duration) -> Option<PackedBuffer> {
        loop {
            if let Some(buf) = self.free.try_pop() {
                return Some(buf);
            }
            if stop.is_requested() {
                return None;
            }
            std::thread::sleep(retry);
        }
    }

    /// Returns a buffer to the free list. Only buffers allocated by this pool are accepted.
    pub fn release(&self, buf: PackedBuffer) -> Result<(), ReleaseError> {
        if buf.pool_id != self.id || buf.slot >= self.size || buf.dims != self.dims {
            return Err(ReleaseError::ForeignBuffer { slot: buf.slot });
        }
        self.free
            .try_push(buf)
            .map_err(|buf| ReleaseError::Overfull { slot: buf.slot })
    }
}
