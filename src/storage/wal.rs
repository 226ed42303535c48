//! Write-ahead logging.
//!
//! - `record`: the on-disk record format
//! - `manager`: the append-only log file, forcing and rollback-by-log
//!
//! Checkpointing, truncation and crash recovery live in [`crate::recovery`]
//! and extend [`WriteAheadLog`] directly.

pub mod manager;
pub mod record;

pub use manager::WriteAheadLog;
pub use record::{LogRecord, RecordBounds, RecordType, HEADER_SIZE, NO_CHECKPOINT};
