// =============================================================================
// Durable candle storage — fixed-size records, append-only files, and the
// gap-aware time-series repository built on top of them.
// =============================================================================

pub mod file;
pub mod record;
pub mod repository;

pub use record::{CandleRecord, RECORD_SIZE};
pub use repository::{Paths, TimeSeriesRepository};
