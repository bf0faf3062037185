#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod buffer;
pub mod decode;
pub mod queue;
pub mod reader;
pub mod scheduler;
pub mod signal;
mod worker;

pub use buffer::{BufferPool, PackedBuffer, ReleaseError};
pub use decode::{PathStampDecoder, RawFileDecoder, RecordDecoder};
pub use queue::{BoundedHandoffQueue, RecycleChannel};
pub use reader::{FpgaReader, ReaderError, ReaderMetrics, ReaderStats, SolverHandle};
pub use scheduler::{BatchReservation, EpochScheduler, Ticket};
pub use signal::{StartGate, StopSignal};
pub use worker::WorkerState;
