//! Page-level reader/writer locks for strict two-phase locking.
//!
//! Each page id maps to a [`PageLock`] holding its own mutex and condition
//! variable, so a thread blocked on one page never holds the table's mutex.
//! Lock order is fixed: the table mutex, then a page lock's mutex, then the
//! wait-for graph's mutex. Nothing acquires them in any other order.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::concurrency::wait_for::WaitForGraph;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::transaction::TransactionId;

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for read access.
    Shared,
    /// Exclusive lock for write access.
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<TransactionId>,
    writer: Option<TransactionId>,
    /// Threads inside `acquire` for this page, counted from the moment the
    /// lock is looked up in the table so it cannot be reclaimed under them.
    waiters: usize,
}

impl LockState {
    fn is_clean(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty() && self.waiters == 0
    }

    fn held_by(&self, txn: TransactionId) -> Option<LockMode> {
        if self.writer == Some(txn) {
            Some(LockMode::Exclusive)
        } else if self.readers.contains(&txn) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    fn holders(&self) -> impl Iterator<Item = (TransactionId, LockMode)> + '_ {
        self.writer
            .map(|writer| (writer, LockMode::Exclusive))
            .into_iter()
            .chain(self.readers.iter().map(|&reader| (reader, LockMode::Shared)))
    }

    /// Grants the request if possible; otherwise returns the rival holders.
    /// A transaction never conflicts with itself, so the sole reader may
    /// upgrade without waiting.
    fn try_grant(&mut self, txn: TransactionId, mode: LockMode) -> Result<(), Vec<TransactionId>> {
        debug_assert!(self.readers.is_empty() || self.writer.is_none());

        // A writer also holds the reader grant.
        if self.writer == Some(txn) {
            return Ok(());
        }

        let rivals: Vec<_> = self
            .holders()
            .filter(|&(holder, held)| holder != txn && !mode.is_compatible_with(&held))
            .map(|(holder, _)| holder)
            .collect();
        if !rivals.is_empty() {
            return Err(rivals);
        }

        match mode {
            LockMode::Shared => {
                self.readers.insert(txn);
            }
            LockMode::Exclusive => {
                self.readers.clear();
                self.writer = Some(txn);
            }
        }
        Ok(())
    }

    fn release(&mut self, txn: TransactionId) -> bool {
        match self.writer {
            Some(writer) if writer == txn => {
                self.writer = None;
                true
            }
            Some(_) => false,
            None => self.readers.remove(&txn),
        }
    }
}

/// Lock state for a single page.
#[derive(Debug, Default)]
pub struct PageLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl PageLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `txn` holds the page in `mode`, or fails with a deadlock
    /// (or a timeout when `timeout` is set). The caller must have counted
    /// itself in `waiters`; this call uncounts it before returning.
    fn acquire(
        &self,
        txn: TransactionId,
        page: PageId,
        mode: LockMode,
        graph: &WaitForGraph,
        timeout: Option<Duration>,
    ) -> StorageResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        let result = loop {
            let rivals = match state.try_grant(txn, mode) {
                Ok(()) => break Ok(()),
                Err(rivals) => rivals,
            };

            if let Err(holder) = graph.wait_on(txn, &rivals) {
                debug!("{txn} aborts: waiting on {holder} for {page} closes a cycle");
                break Err(StorageError::Deadlock { txn, page });
            }

            debug!("{txn} waits for {page} held by {rivals:?}");
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.released.wait(&mut state);
                    false
                }
            };
            graph.stop_waiting(txn, &rivals);

            if timed_out {
                // One last attempt: the release may have raced the timeout.
                if state.try_grant(txn, mode).is_ok() {
                    break Ok(());
                }
                break Err(StorageError::LockTimeout { txn, page });
            }
        };

        state.waiters -= 1;
        result
    }

    /// Returns whether `txn` actually held the lock. Wakes waiters if so.
    pub fn release(&self, txn: TransactionId) -> bool {
        let mut state = self.state.lock();
        let released = state.release(txn);
        if released {
            self.released.notify_all();
        }
        released
    }

    pub fn held_by(&self, txn: TransactionId) -> Option<LockMode> {
        self.state.lock().held_by(txn)
    }

    pub fn is_exclusively_held(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.state.lock().is_clean()
    }
}

/// Table of page locks plus the wait-for graph they share.
#[derive(Debug)]
pub struct LockManager {
    locks: Mutex<HashMap<PageId, Arc<PageLock>>>,
    graph: WaitForGraph,
    wait_timeout: Option<Duration>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            graph: WaitForGraph::new(),
            wait_timeout: None,
        }
    }

    /// A lock manager whose waits also give up after `timeout`. Cycle
    /// detection stays active.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            wait_timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Acquires `mode` on `page` for `txn`. Re-acquiring a grant already held
    /// returns immediately; a sole reader upgrades to writer without waiting.
    pub fn acquire(&self, txn: TransactionId, page: PageId, mode: LockMode) -> StorageResult<()> {
        let lock = {
            let mut locks = self.locks.lock();
            let lock = Arc::clone(locks.entry(page).or_default());
            lock.state.lock().waiters += 1;
            lock
        };

        let result = lock.acquire(txn, page, mode, &self.graph, self.wait_timeout);
        if result.is_err() {
            self.reclaim(page, &lock);
        }
        result
    }

    /// Releases whatever `txn` holds on `page`. Releasing a lock that is not
    /// held is a no-op and returns false.
    pub fn release(&self, txn: TransactionId, page: PageId) -> bool {
        let mut locks = self.locks.lock();
        let Some(lock) = locks.get(&page).cloned() else {
            return false;
        };
        let released = lock.release(txn);
        if lock.is_clean() {
            locks.remove(&page);
        }
        released
    }

    /// Releases every lock in `pages` held by `txn`.
    pub fn release_all<'a>(&self, txn: TransactionId, pages: impl IntoIterator<Item = &'a PageId>) {
        for page in pages {
            self.release(txn, *page);
        }
    }

    pub fn holds_lock(&self, txn: TransactionId, page: PageId) -> bool {
        self.lock_mode(txn, page).is_some()
    }

    pub fn lock_mode(&self, txn: TransactionId, page: PageId) -> Option<LockMode> {
        let locks = self.locks.lock();
        locks.get(&page).and_then(|lock| lock.held_by(txn))
    }

    pub fn is_exclusively_locked(&self, page: PageId) -> bool {
        let locks = self.locks.lock();
        locks
            .get(&page)
            .map(|lock| lock.is_exclusively_held())
            .unwrap_or(false)
    }

    /// Number of page locks currently materialized in the table.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn wait_for_graph(&self) -> &WaitForGraph {
        &self.graph
    }

    fn reclaim(&self, page: PageId, lock: &Arc<PageLock>) {
        let mut locks = self.locks.lock();
        if let Some(current) = locks.get(&page) {
            if Arc::ptr_eq(current, lock) && current.is_clean() {
                locks.remove(&page);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
