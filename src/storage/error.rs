//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;
use crate::transaction::TransactionId;

/// Errors that can occur in the storage core.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Deadlock: {txn} waiting for {page} would close a cycle in the wait-for graph")]
    Deadlock { txn: TransactionId, page: PageId },

    #[error("Lock wait timed out: {txn} waiting for {page}")]
    LockTimeout { txn: TransactionId, page: PageId },

    #[error("Page cache is exhausted: none of the {capacity} resident pages can be evicted")]
    CacheExhausted { capacity: usize },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Page size mismatch: expected {expected} bytes, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("Corrupt log record at offset {offset}: {reason}")]
    CorruptLog { offset: u64, reason: String },

    #[error("Log record at offset {offset} is cut short by end of file")]
    TornRecord { offset: u64 },

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    #[error("Transaction {0} has already begun")]
    DuplicateBegin(TransactionId),

    #[error("Log holds unrecovered records; run recovery before appending")]
    RecoveryPending,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true for errors that are resolved by aborting and retrying the
    /// transaction rather than by stopping the process.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Deadlock { .. } | Self::LockTimeout { .. } | Self::CacheExhausted { .. }
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
