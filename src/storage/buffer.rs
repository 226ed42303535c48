pub mod lru;

use dashmap::DashMap;
use log::{debug, warn};
use lru::LruTracker;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::concurrency::lock::{LockManager, LockMode};
use crate::recovery::RecoveryReport;
use crate::storage::disk::PageStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId, PageKind};
use crate::storage::wal::WriteAheadLog;
use crate::transaction::{TransactionId, TransactionIdGenerator};

/// Shared handle to a resident page. Readers take `read()`, the holder of
/// the page's exclusive lock takes `write()`.
pub type PageRef = Arc<RwLock<Page>>;

#[derive(Default)]
struct Frames {
    pages: HashMap<PageId, PageRef>,
    lru: LruTracker,
}

enum Victim {
    Clean(PageId),
    Dirty(PageId, PageRef),
}

impl Frames {
    fn remove(&mut self, page_id: PageId) -> Option<PageRef> {
        self.lru.remove(page_id);
        self.pages.remove(&page_id)
    }
}

/// Bounded page cache shared by concurrent transactions.
///
/// Pages are handed out only after the requesting transaction holds the
/// matching page lock. Commit is FORCE: a transaction's dirty pages are
/// logged, the log is forced, then the pages are written back. Eviction
/// may steal a dirty page that no transaction holds exclusively, after
/// forcing an UPDATE record for it.
pub struct PageCache {
    frames: Mutex<Frames>,
    /// Pages each live transaction has fetched.
    txn_pages: DashMap<TransactionId, HashSet<PageId>>,
    locks: Arc<LockManager>,
    store: Arc<dyn PageStore>,
    wal: Arc<WriteAheadLog>,
    ids: TransactionIdGenerator,
    capacity: usize,
}

impl PageCache {
    pub fn new(
        capacity: usize,
        store: Arc<dyn PageStore>,
        locks: Arc<LockManager>,
        wal: Arc<WriteAheadLog>,
    ) -> Self {
        Self {
            frames: Mutex::new(Frames::default()),
            txn_pages: DashMap::new(),
            locks,
            store,
            wal,
            ids: TransactionIdGenerator::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.frames.lock().pages.contains_key(&page_id)
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Starts a transaction: allocates its id and logs BEGIN.
    pub fn begin(&self) -> StorageResult<TransactionId> {
        let txn = self.ids.next();
        self.wal.log_begin(txn)?;
        Ok(txn)
    }

    /// Returns `page_id` once `txn` holds it in `mode`, loading it from the
    /// store on a miss. A deadlock aborts nothing by itself: the caller is
    /// expected to abort `txn`.
    ///
    /// Store reads and steals run without the frame table held, so a miss
    /// never stalls other threads' hits behind disk I/O.
    pub fn fetch(&self, txn: TransactionId, page_id: PageId, mode: LockMode) -> StorageResult<PageRef> {
        self.locks.acquire(txn, page_id, mode)?;
        self.txn_pages.entry(txn).or_default().insert(page_id);

        if let Some(page) = self.lookup(page_id) {
            return Ok(page);
        }

        // Holding the page lock keeps every other writer of this page away,
        // so the bytes read here cannot go stale before they are installed.
        let data = self.store.read_page(page_id)?;
        loop {
            let mut frames = self.frames.lock();
            // Another holder of a shared lock may have loaded it meanwhile.
            if let Some(page) = frames.pages.get(&page_id).cloned() {
                frames.lru.record_access(page_id);
                return Ok(page);
            }
            if frames.pages.len() < self.capacity {
                let page = Arc::new(RwLock::new(Page::new(page_id, PageKind::Heap, data)));
                frames.pages.insert(page_id, Arc::clone(&page));
                frames.lru.record_access(page_id);
                return Ok(page);
            }

            match self.choose_victim(&frames)? {
                Victim::Clean(victim) => {
                    frames.remove(victim);
                    debug!("evicted clean {victim}");
                }
                Victim::Dirty(victim, page) => {
                    drop(frames);
                    if !self.steal(victim, &page)? {
                        return Err(StorageError::CacheExhausted {
                            capacity: self.capacity,
                        });
                    }
                }
            }
        }
    }

    fn lookup(&self, page_id: PageId) -> Option<PageRef> {
        let mut frames = self.frames.lock();
        let page = frames.pages.get(&page_id).cloned()?;
        frames.lru.record_access(page_id);
        Some(page)
    }

    /// Marks a resident page dirty on behalf of `txn`, which must hold it
    /// exclusively.
    pub fn mark_dirty(&self, txn: TransactionId, page_id: PageId) -> StorageResult<()> {
        let page = self
            .frames
            .lock()
            .pages
            .get(&page_id)
            .cloned()
            .ok_or(StorageError::PageNotFound(page_id))?;
        page.write().mark_dirty(txn);
        Ok(())
    }

    /// Releases `txn`'s lock on one page before the transaction ends. This
    /// steps outside strict two-phase locking; only use it for pages the
    /// transaction has not modified.
    pub fn release_page(&self, txn: TransactionId, page_id: PageId) -> bool {
        if let Some(mut pages) = self.txn_pages.get_mut(&txn) {
            pages.remove(&page_id);
        }
        self.locks.release(txn, page_id)
    }

    pub fn holds_lock(&self, txn: TransactionId, page_id: PageId) -> bool {
        self.locks.holds_lock(txn, page_id)
    }

    fn resident(&self, pages: &HashSet<PageId>) -> Vec<PageRef> {
        let frames = self.frames.lock();
        pages
            .iter()
            .filter_map(|id| frames.pages.get(id).cloned())
            .collect()
    }

    fn touched_pages(&self, txn: TransactionId) -> HashSet<PageId> {
        self.txn_pages
            .get(&txn)
            .map(|pages| pages.value().clone())
            .unwrap_or_default()
    }

    fn finish(&self, txn: TransactionId, pages: &HashSet<PageId>) {
        self.locks.release_all(txn, pages);
        self.txn_pages.remove(&txn);
    }

    /// Makes `txn`'s changes durable and releases its locks.
    pub fn commit(&self, txn: TransactionId) -> StorageResult<()> {
        let pages = self.touched_pages(txn);
        let resident = self.resident(&pages);

        for page in &resident {
            let guard = page.read();
            if guard.dirtied_by() == Some(txn) {
                self.wal.log_update(txn, guard.before_image(), guard.after_image())?;
            }
        }
        self.wal.log_commit(txn)?;

        // The transaction is committed from here on, so its locks go even if
        // a page write fails. Recovery redoes whatever did not reach the store.
        let written = self.install_committed(txn, &resident);
        self.finish(txn, &pages);
        written?;
        debug!("{txn} committed, {} page(s) touched", pages.len());
        Ok(())
    }

    /// Writes `txn`'s dirty pages and moves every page it touched to a new
    /// stable point, including ones flushed earlier and left clean since. A
    /// page that cannot be written is dropped from the cache.
    fn install_committed(&self, txn: TransactionId, resident: &[PageRef]) -> StorageResult<()> {
        let mut failure = None;
        for page in resident {
            let mut guard = page.write();
            match guard.dirtied_by() {
                Some(owner) if owner == txn => {
                    if let Err(e) = self.store.write_page(guard.id(), guard.data()) {
                        let page_id = guard.id();
                        warn!("{txn} committed but {page_id} was not written: {e}");
                        drop(guard);
                        self.discard(page_id);
                        failure.get_or_insert(e);
                        continue;
                    }
                }
                Some(_) => continue,
                None => {}
            }
            guard.set_before_image();
            guard.mark_clean();
        }
        failure.map_or(Ok(()), Err)
    }

    /// Undoes `txn`'s changes and releases its locks.
    pub fn abort(&self, txn: TransactionId) -> StorageResult<()> {
        let pages = self.touched_pages(txn);

        for page in self.resident(&pages) {
            let mut guard = page.write();
            if guard.dirtied_by() == Some(txn) {
                guard.restore_before_image();
            }
        }

        // Pages stolen before the abort are only correct in the store once
        // the log has been rolled back; drop any cached copy.
        let rewritten = self.wal.log_abort(txn, self.store.as_ref())?;
        for page_id in rewritten {
            self.discard(page_id);
        }

        self.finish(txn, &pages);
        debug!("{txn} aborted");
        Ok(())
    }

    /// Drops a page from the cache without writing it back.
    pub fn discard(&self, page_id: PageId) {
        self.frames.lock().remove(page_id);
    }

    /// Logs (if needed) and writes one dirty page back to the store. The page
    /// is clean afterwards but keeps its before-image.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let Some(page) = self.frames.lock().pages.get(&page_id).cloned() else {
            return Ok(());
        };
        let mut guard = page.write();
        self.write_back(&mut guard)
    }

    /// Flushes every dirty resident page.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let pages: Vec<PageRef> = self.frames.lock().pages.values().cloned().collect();
        for page in pages {
            let mut guard = page.write();
            self.write_back(&mut guard)?;
        }
        Ok(())
    }

    /// Write-ahead rule: the UPDATE record is forced before the after-image
    /// reaches the store.
    fn write_back(&self, page: &mut Page) -> StorageResult<()> {
        let Some(owner) = page.dirtied_by() else {
            return Ok(());
        };
        self.wal.log_update(owner, page.before_image(), page.after_image())?;
        self.wal.force()?;
        self.store.write_page(page.id(), page.data())?;
        page.mark_clean();
        Ok(())
    }

    /// Picks the page to make room with. Clean pages go first, least
    /// recently used first; failing that a dirty page is stolen. Pages held
    /// exclusively, or currently borrowed by a caller, are never chosen.
    fn choose_victim(&self, frames: &Frames) -> StorageResult<Victim> {
        let mut steal = None;
        for page_id in frames.lru.oldest_first() {
            if self.locks.is_exclusively_locked(page_id) {
                continue;
            }
            let Some(page) = frames.pages.get(&page_id) else {
                continue;
            };
            let Some(guard) = page.try_read() else {
                continue;
            };
            if !guard.is_dirty() {
                return Ok(Victim::Clean(page_id));
            }
            if steal.is_none() {
                steal = Some(Victim::Dirty(page_id, Arc::clone(page)));
            }
        }

        steal.ok_or(StorageError::CacheExhausted {
            capacity: self.capacity,
        })
    }

    /// Writes a dirty victim back so the next pass can evict it as a clean
    /// page. Returns false if the page was borrowed or locked exclusively in
    /// the meantime.
    fn steal(&self, page_id: PageId, page: &PageRef) -> StorageResult<bool> {
        let Some(mut guard) = page.try_write() else {
            return Ok(false);
        };
        if self.locks.is_exclusively_locked(page_id) {
            return Ok(false);
        }
        warn!("stealing dirty {page_id} from {:?}", guard.dirtied_by());
        self.write_back(&mut guard)?;
        Ok(true)
    }

    /// Appends a CHECKPOINT after flushing every dirty page.
    pub fn checkpoint(&self) -> StorageResult<u64> {
        self.flush_all_pages()?;
        self.wal.log_checkpoint()
    }

    /// Runs crash recovery against the store, purges the pages it rewrote,
    /// and makes sure new transaction ids follow every id in the log.
    pub fn recover(&self) -> StorageResult<RecoveryReport> {
        let report = self.wal.recover(self.store.as_ref())?;
        for page_id in &report.pages_written {
            self.discard(*page_id);
        }
        if let Some(max) = report.max_txn {
            self.ids.resume_after(max);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::MemoryPageStore;
    use anyhow::Result;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    const SIZE: usize = 64;

    fn p(n: u32) -> PageId {
        PageId::new(1, n)
    }

    fn create_test_cache(capacity: usize, pages: u32) -> Result<(PageCache, Arc<MemoryPageStore>, TempDir)> {
        let dir = TempDir::new()?;
        let store = Arc::new(MemoryPageStore::new(SIZE));
        for n in 0..pages {
            store.write_page(p(n), &[0; SIZE])?;
        }
        let wal = Arc::new(WriteAheadLog::create(&dir.path().join("wal.log"))?);
        let cache = PageCache::new(capacity, store.clone(), Arc::new(LockManager::new()), wal);
        Ok((cache, store, dir))
    }

    fn write(cache: &PageCache, txn: TransactionId, page_id: PageId, byte: u8) -> Result<()> {
        let page = cache.fetch(txn, page_id, LockMode::Exclusive)?;
        let mut guard = page.write();
        guard.data_mut().fill(byte);
        guard.mark_dirty(txn);
        Ok(())
    }

    #[test]
    fn test_fetch_loads_and_caches() -> Result<()> {
        let (cache, _store, _dir) = create_test_cache(4, 2)?;
        let txn = cache.begin()?;

        let page = cache.fetch(txn, p(0), LockMode::Shared)?;
        assert_eq!(page.read().data(), &[0; SIZE][..]);
        assert!(cache.contains(p(0)));
        assert!(cache.holds_lock(txn, p(0)));
        assert_eq!(cache.len(), 1);
        Ok(())
    }

    #[test]
    fn test_missing_page_is_reported() -> Result<()> {
        let (cache, _store, _dir) = create_test_cache(4, 1)?;
        let txn = cache.begin()?;
        assert!(matches!(
            cache.fetch(txn, p(7), LockMode::Shared),
            Err(StorageError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_commit_writes_through() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(4, 1)?;
        let txn = cache.begin()?;
        write(&cache, txn, p(0), 9)?;
        assert_eq!(store.read_page(p(0))?, vec![0; SIZE]);

        cache.commit(txn)?;
        assert_eq!(store.read_page(p(0))?, vec![9; SIZE]);
        assert!(!cache.holds_lock(txn, p(0)));

        // The commit is the new stable point.
        let page = cache.fetch(cache.begin()?, p(0), LockMode::Shared)?;
        let guard = page.read();
        assert!(!guard.is_dirty());
        assert_eq!(guard.before_image().data, vec![9; SIZE]);
        Ok(())
    }

    #[test]
    fn test_abort_restores_before_image() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(4, 1)?;
        let first = cache.begin()?;
        write(&cache, first, p(0), 1)?;
        cache.commit(first)?;

        let second = cache.begin()?;
        write(&cache, second, p(0), 2)?;
        cache.abort(second)?;

        let page = cache.fetch(cache.begin()?, p(0), LockMode::Shared)?;
        assert_eq!(page.read().data(), &[1; SIZE][..]);
        assert_eq!(store.read_page(p(0))?, vec![1; SIZE]);
        Ok(())
    }

    #[test]
    fn test_commit_after_flush_moves_stable_point() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(4, 1)?;
        let first = cache.begin()?;
        write(&cache, first, p(0), 4)?;
        cache.flush_page(p(0))?;
        cache.commit(first)?;

        let second = cache.begin()?;
        write(&cache, second, p(0), 8)?;
        cache.abort(second)?;

        let page = cache.fetch(cache.begin()?, p(0), LockMode::Shared)?;
        assert_eq!(page.read().data(), &[4; SIZE][..]);
        assert_eq!(store.read_page(p(0))?, vec![4; SIZE]);
        Ok(())
    }

    #[test]
    fn test_mark_dirty_through_cache() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(4, 1)?;
        let txn = cache.begin()?;
        let page = cache.fetch(txn, p(0), LockMode::Exclusive)?;
        page.write().data_mut()[0] = 11;
        cache.mark_dirty(txn, p(0))?;
        assert_eq!(page.read().dirtied_by(), Some(txn));

        cache.commit(txn)?;
        assert_eq!(store.read_page(p(0))?[0], 11);
        assert!(matches!(
            cache.mark_dirty(txn, p(5)),
            Err(StorageError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_clean_pages_are_evicted_lru_first() -> Result<()> {
        let (cache, _store, _dir) = create_test_cache(2, 3)?;
        let txn = cache.begin()?;
        cache.fetch(txn, p(0), LockMode::Shared)?;
        cache.fetch(txn, p(1), LockMode::Shared)?;
        cache.fetch(txn, p(0), LockMode::Shared)?;
        cache.fetch(txn, p(2), LockMode::Shared)?;

        assert!(cache.contains(p(0)));
        assert!(!cache.contains(p(1)));
        assert!(cache.contains(p(2)));
        Ok(())
    }

    #[test]
    fn test_exclusively_locked_dirty_page_is_never_evicted() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(1, 2)?;
        let txn = cache.begin()?;
        write(&cache, txn, p(0), 5)?;

        let other = cache.begin()?;
        let result = cache.fetch(other, p(1), LockMode::Shared);
        assert!(matches!(result, Err(StorageError::CacheExhausted { capacity: 1 })));
        assert!(cache.contains(p(0)));
        assert_eq!(store.read_page(p(0))?, vec![0; SIZE]);
        Ok(())
    }

    #[test]
    fn test_released_dirty_page_is_stolen_after_logging() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(1, 2)?;
        let txn = cache.begin()?;
        write(&cache, txn, p(0), 5)?;
        assert!(cache.release_page(txn, p(0)));

        let other = cache.begin()?;
        cache.fetch(other, p(1), LockMode::Shared)?;
        assert!(!cache.contains(p(0)));
        assert_eq!(store.read_page(p(0))?, vec![5; SIZE]);

        // The stolen write is in the log, so an abort still undoes it.
        cache.abort(txn)?;
        assert_eq!(store.read_page(p(0))?, vec![0; SIZE]);
        Ok(())
    }

    #[test]
    fn test_checkpoint_flushes_dirty_pages() -> Result<()> {
        let (cache, store, _dir) = create_test_cache(4, 1)?;
        let txn = cache.begin()?;
        write(&cache, txn, p(0), 3)?;

        let offset = cache.checkpoint()?;
        assert_eq!(cache.wal().checkpoint_offset()?, Some(offset));
        assert_eq!(store.read_page(p(0))?, vec![3; SIZE]);

        cache.abort(txn)?;
        assert_eq!(store.read_page(p(0))?, vec![0; SIZE]);
        assert!(!cache.contains(p(0)));
        Ok(())
    }

    /// Memory store that refuses writes while `full` is set.
    struct FullDiskStore {
        inner: MemoryPageStore,
        full: AtomicBool,
    }

    impl PageStore for FullDiskStore {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        fn read_page(&self, page_id: PageId) -> StorageResult<Vec<u8>> {
            self.inner.read_page(page_id)
        }

        fn write_page(&self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
            if self.full.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.write_page(page_id, data)
        }
    }

    #[test]
    fn test_failed_page_write_after_commit_releases_locks() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(FullDiskStore {
            inner: MemoryPageStore::new(SIZE),
            full: AtomicBool::new(false),
        });
        store.write_page(p(0), &[0; SIZE])?;
        let path = dir.path().join("wal.log");
        let cache = PageCache::new(
            4,
            store.clone(),
            Arc::new(LockManager::with_timeout(Duration::from_millis(200))),
            Arc::new(WriteAheadLog::create(&path)?),
        );

        let txn = cache.begin()?;
        write(&cache, txn, p(0), 9)?;
        store.full.store(true, Ordering::SeqCst);
        assert!(matches!(cache.commit(txn), Err(StorageError::Io(_))));

        // Committed in the log, finished in memory.
        assert!(!cache.wal().is_active(txn));
        assert!(!cache.holds_lock(txn, p(0)));
        assert!(!cache.contains(p(0)));

        store.full.store(false, Ordering::SeqCst);
        let other = cache.begin()?;
        cache.fetch(other, p(0), LockMode::Exclusive)?;
        cache.commit(other)?;
        assert_eq!(store.inner.read_page(p(0))?, vec![0; SIZE]);

        // Replaying the log installs the committed bytes.
        WriteAheadLog::open(&path)?.recover(&store.inner)?;
        assert_eq!(store.inner.read_page(p(0))?, vec![9; SIZE]);
        Ok(())
    }

    /// Commits 1s to pages 0 and 1, then leaves a second transaction with
    /// both pages rewritten and partly stolen.
    fn half_done_workload() -> Result<(PageCache, Arc<MemoryPageStore>, TempDir, TransactionId)> {
        let (cache, store, dir) = create_test_cache(4, 2)?;
        let first = cache.begin()?;
        write(&cache, first, p(0), 1)?;
        write(&cache, first, p(1), 1)?;
        cache.commit(first)?;

        let txn = cache.begin()?;
        write(&cache, txn, p(0), 5)?;
        cache.flush_page(p(0))?;
        write(&cache, txn, p(0), 7)?;
        write(&cache, txn, p(1), 6)?;
        cache.flush_all_pages()?;
        Ok((cache, store, dir, txn))
    }

    #[test]
    fn test_rollback_by_log_matches_in_cache_abort() -> Result<()> {
        let (cache, store, _dir, txn) = half_done_workload()?;
        cache.abort(txn)?;
        let reader = cache.begin()?;
        let in_cache: Vec<Vec<u8>> = (0..2)
            .map(|n| Ok(cache.fetch(reader, p(n), LockMode::Shared)?.read().data().to_vec()))
            .collect::<Result<_>>()?;
        let stored_after_abort: Vec<Vec<u8>> = (0..2)
            .map(|n| store.read_page(p(n)))
            .collect::<StorageResult<_>>()?;

        let (cache, store, _dir, txn) = half_done_workload()?;
        cache.wal().rollback(txn, &*store)?;
        let by_log: Vec<Vec<u8>> = (0..2)
            .map(|n| store.read_page(p(n)))
            .collect::<StorageResult<_>>()?;

        assert_eq!(by_log, in_cache);
        assert_eq!(by_log, stored_after_abort);
        assert_eq!(by_log, vec![vec![1; SIZE]; 2]);
        Ok(())
    }

    /// Memory store whose reads wait on `gate`.
    struct GatedStore {
        inner: MemoryPageStore,
        gate: Mutex<()>,
        reads_waiting: AtomicUsize,
    }

    impl PageStore for GatedStore {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        fn read_page(&self, page_id: PageId) -> StorageResult<Vec<u8>> {
            self.reads_waiting.fetch_add(1, Ordering::SeqCst);
            let _gate = self.gate.lock();
            self.reads_waiting.fetch_sub(1, Ordering::SeqCst);
            self.inner.read_page(page_id)
        }

        fn write_page(&self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
            self.inner.write_page(page_id, data)
        }
    }

    #[test]
    fn test_hit_is_served_while_a_miss_waits_on_the_store() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Arc::new(GatedStore {
            inner: MemoryPageStore::new(SIZE),
            gate: Mutex::new(()),
            reads_waiting: AtomicUsize::new(0),
        });
        store.write_page(p(0), &[1; SIZE])?;
        store.write_page(p(1), &[2; SIZE])?;
        let cache = Arc::new(PageCache::new(
            4,
            store.clone(),
            Arc::new(LockManager::new()),
            Arc::new(WriteAheadLog::create(&dir.path().join("wal.log"))?),
        ));
        let reader = cache.begin()?;
        cache.fetch(reader, p(0), LockMode::Shared)?;

        let gate = store.gate.lock();
        let loader = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || -> StorageResult<Vec<u8>> {
                let txn = cache.begin()?;
                let page = cache.fetch(txn, p(1), LockMode::Shared)?;
                let data = page.read().data().to_vec();
                Ok(data)
            })
        };
        while store.reads_waiting.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let (tx, rx) = mpsc::channel();
        let hitter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let result = cache
                    .begin()
                    .and_then(|txn| cache.fetch(txn, p(0), LockMode::Shared))
                    .map(|page| {
                        let data = page.read().data().to_vec();
                        data
                    });
                tx.send(result).unwrap();
            })
        };
        let hit = rx.recv_timeout(Duration::from_secs(5)).expect("hit served during the load")?;
        assert_eq!(hit, vec![1; SIZE]);

        drop(gate);
        hitter.join().unwrap();
        assert_eq!(loader.join().unwrap()?, vec![2; SIZE]);
        Ok(())
    }
}
