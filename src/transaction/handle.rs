//! Transaction handle over the page cache.

use log::warn;
use std::sync::Arc;

use super::id::TransactionId;
use crate::concurrency::lock::LockMode;
use crate::storage::buffer::{PageCache, PageRef};
use crate::storage::error::StorageResult;
use crate::storage::page::PageId;

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// A running transaction. Locks are held until [`commit`](Self::commit) or
/// [`abort`](Self::abort); a handle dropped while still active is aborted.
pub struct Transaction {
    id: TransactionId,
    cache: Arc<PageCache>,
    state: TransactionState,
}

impl Transaction {
    pub fn begin(cache: Arc<PageCache>) -> StorageResult<Self> {
        let id = cache.begin()?;
        Ok(Self {
            id,
            cache,
            state: TransactionState::Active,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn fetch(&self, page_id: PageId, mode: LockMode) -> StorageResult<PageRef> {
        self.cache.fetch(self.id, page_id, mode)
    }

    /// Copy of the page bytes under a shared lock.
    pub fn read(&self, page_id: PageId) -> StorageResult<Vec<u8>> {
        let page = self.fetch(page_id, LockMode::Shared)?;
        let bytes = page.read().data().to_vec();
        Ok(bytes)
    }

    /// Applies `f` to the page bytes under an exclusive lock and marks the
    /// page dirty.
    pub fn write<F>(&self, page_id: PageId, f: F) -> StorageResult<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let page = self.fetch(page_id, LockMode::Exclusive)?;
        let mut guard = page.write();
        f(guard.data_mut());
        guard.mark_dirty(self.id);
        Ok(())
    }

    pub fn holds_lock(&self, page_id: PageId) -> bool {
        self.cache.holds_lock(self.id, page_id)
    }

    /// Commits the transaction. An error raised after the COMMIT record is
    /// durable still leaves the transaction committed.
    pub fn commit(mut self) -> StorageResult<()> {
        let result = self.cache.commit(self.id);
        if result.is_ok() || !self.cache.wal().is_active(self.id) {
            self.state = TransactionState::Committed;
        }
        result
    }

    pub fn abort(mut self) -> StorageResult<()> {
        self.state = TransactionState::Aborted;
        self.cache.abort(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state.is_active() {
            if let Err(e) = self.cache.abort(self.id) {
                warn!("failed to abort dropped {}: {e}", self.id);
            }
        }
    }
}
