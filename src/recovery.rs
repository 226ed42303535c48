//! Crash recovery and checkpointing.
//!
//! Both extend [`WriteAheadLog`](crate::storage::wal::WriteAheadLog) and
//! must run while no transaction is active.

pub mod checkpoint;
pub mod replay;

pub use replay::RecoveryReport;
