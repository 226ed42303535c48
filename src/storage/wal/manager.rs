//! Write-ahead log manager.
//!
//! The log is a single append-only file. Appends go straight to the file;
//! [`WriteAheadLog::force`] syncs it. COMMIT and ABORT records are forced
//! before the call returns, so an acknowledged commit is on stable storage.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::record::{LogRecord, RecordBounds, HEADER_SIZE, NO_CHECKPOINT};
use crate::storage::disk::PageStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageImage};
use crate::transaction::TransactionId;

/// Open log file plus the in-memory index derived from it.
pub(crate) struct LogFile {
    pub(crate) path: PathBuf,
    pub(crate) file: File,
    /// Offset at which the next record will be written.
    pub(crate) tail: u64,
    /// First record offset of every transaction that has begun but not ended.
    pub(crate) first_record: HashMap<TransactionId, u64>,
    /// Set when an existing log was opened and has not been recovered yet.
    pub(crate) recovery_pending: bool,
}

impl LogFile {
    fn append(&mut self, record: &LogRecord) -> StorageResult<u64> {
        if self.recovery_pending {
            return Err(StorageError::RecoveryPending);
        }
        self.append_unchecked(record)
    }

    pub(crate) fn append_unchecked(&mut self, record: &LogRecord) -> StorageResult<u64> {
        let start = self.tail;
        let bytes = record.encode(start);
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&bytes)?;
        self.tail += bytes.len() as u64;
        Ok(start)
    }

    pub(crate) fn force(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn checkpoint_pointer(&mut self) -> StorageResult<Option<u64>> {
        self.file.seek(SeekFrom::Start(0))?;
        let pointer = self.file.read_i64::<BigEndian>()?;
        Ok((pointer != NO_CHECKPOINT).then_some(pointer as u64))
    }

    pub(crate) fn set_checkpoint_pointer(&mut self, offset: u64) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_i64::<BigEndian>(offset as i64)?;
        Ok(())
    }

    pub(crate) fn bounds(&self, page_size: Option<usize>) -> RecordBounds {
        RecordBounds {
            end: self.tail,
            page_size,
        }
    }

    /// Reads records in `[from, to)`. A record torn by end of file is
    /// reported as [`StorageError::TornRecord`].
    pub(crate) fn read_range(&mut self, from: u64, to: u64) -> StorageResult<Vec<(u64, LogRecord)>> {
        let mut records = Vec::new();
        self.scan(from, to, None, |offset, record| {
            records.push((offset, record));
            Ok(())
        })?;
        Ok(records)
    }

    /// Visits records in `[from, to)` in log order. With `page_size` set,
    /// an UPDATE whose images have any other length is corrupt.
    pub(crate) fn scan(
        &mut self,
        from: u64,
        to: u64,
        page_size: Option<usize>,
        mut visit: impl FnMut(u64, LogRecord) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let bounds = self.bounds(page_size);
        self.file.seek(SeekFrom::Start(from))?;
        let mut reader = BufReader::new(&mut self.file);
        let mut offset = from;
        while offset < to {
            match LogRecord::decode(&mut reader, offset, bounds)? {
                Some((record, len)) => {
                    visit(offset, record)?;
                    offset += len;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Restores before-images of every UPDATE `txn` logged since its first
    /// record, latest first so the oldest image is the one left on disk.
    fn rollback(&mut self, txn: TransactionId, store: &dyn PageStore) -> StorageResult<Vec<PageId>> {
        let first = *self
            .first_record
            .get(&txn)
            .ok_or(StorageError::UnknownTransaction(txn))?;

        let mut before_images: Vec<PageImage> = Vec::new();
        let tail = self.tail;
        self.scan(first, tail, Some(store.page_size()), |_, record| {
            if let LogRecord::Update { txn: owner, before, .. } = record {
                if owner == txn {
                    before_images.push(before);
                }
            }
            Ok(())
        })?;

        let mut pages = Vec::with_capacity(before_images.len());
        for image in before_images.iter().rev() {
            store.write_page(image.id, &image.data)?;
            if !pages.contains(&image.id) {
                pages.push(image.id);
            }
        }
        Ok(pages)
    }
}

pub struct WriteAheadLog {
    pub(crate) inner: Mutex<LogFile>,
}

impl WriteAheadLog {
    /// Creates a fresh, empty log at `path`, discarding any existing file.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_i64::<BigEndian>(NO_CHECKPOINT)?;
        file.sync_all()?;

        Ok(Self::from_file(path, file, HEADER_SIZE, false))
    }

    /// Opens the log at `path`, creating it if missing. A log that already
    /// holds records must be recovered before anything new is appended.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Self::create(path);
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            warn!("log {path:?} is shorter than its header; starting a fresh log");
            drop(file);
            return Self::create(path);
        }

        Ok(Self::from_file(path, file, len, len > HEADER_SIZE))
    }

    fn from_file(path: &Path, file: File, tail: u64, recovery_pending: bool) -> Self {
        Self {
            inner: Mutex::new(LogFile {
                path: path.to_path_buf(),
                file,
                tail,
                first_record: HashMap::new(),
                recovery_pending,
            }),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Offset at which the next record will be written.
    pub fn tail(&self) -> u64 {
        self.inner.lock().tail
    }

    pub fn recovery_pending(&self) -> bool {
        self.inner.lock().recovery_pending
    }

    /// Transactions with a BEGIN but no COMMIT/ABORT yet, with their first
    /// record offsets.
    pub fn active_transactions(&self) -> Vec<(TransactionId, u64)> {
        let mut active: Vec<_> = self
            .inner
            .lock()
            .first_record
            .iter()
            .map(|(txn, offset)| (*txn, *offset))
            .collect();
        active.sort();
        active
    }

    pub fn is_active(&self, txn: TransactionId) -> bool {
        self.inner.lock().first_record.contains_key(&txn)
    }

    pub fn log_begin(&self, txn: TransactionId) -> StorageResult<()> {
        let mut log = self.inner.lock();
        if log.first_record.contains_key(&txn) {
            return Err(StorageError::DuplicateBegin(txn));
        }
        let offset = log.append(&LogRecord::Begin { txn })?;
        log.first_record.insert(txn, offset);
        debug!("BEGIN {txn} at {offset}");
        Ok(())
    }

    /// Appends an UPDATE record. Not forced; the caller forces before the
    /// after-image is written to the page store.
    pub fn log_update(
        &self,
        txn: TransactionId,
        before: PageImage,
        after: PageImage,
    ) -> StorageResult<()> {
        let mut log = self.inner.lock();
        if !log.first_record.contains_key(&txn) {
            return Err(StorageError::UnknownTransaction(txn));
        }
        let page = after.id;
        let offset = log.append(&LogRecord::Update { txn, before, after })?;
        debug!("UPDATE {txn} {page} at {offset}");
        Ok(())
    }

    /// Appends COMMIT and forces the log.
    pub fn log_commit(&self, txn: TransactionId) -> StorageResult<()> {
        let mut log = self.inner.lock();
        if !log.first_record.contains_key(&txn) {
            return Err(StorageError::UnknownTransaction(txn));
        }
        log.append(&LogRecord::Commit { txn })?;
        log.force()?;
        log.first_record.remove(&txn);
        debug!("COMMIT {txn}");
        Ok(())
    }

    /// Rolls `txn` back by log, appends ABORT and forces. Returns the pages
    /// whose stored image was rewritten; the cache must discard them.
    pub fn log_abort(&self, txn: TransactionId, store: &dyn PageStore) -> StorageResult<Vec<PageId>> {
        let mut log = self.inner.lock();
        if log.recovery_pending {
            return Err(StorageError::RecoveryPending);
        }
        let pages = log.rollback(txn, store)?;
        log.append(&LogRecord::Abort { txn })?;
        log.force()?;
        log.first_record.remove(&txn);
        debug!("ABORT {txn}, restored {} page(s)", pages.len());
        Ok(pages)
    }

    /// Writes the before-image of every UPDATE `txn` logged back to `store`
    /// without ending the transaction. Records of other transactions in the
    /// same range are skipped.
    pub fn rollback(&self, txn: TransactionId, store: &dyn PageStore) -> StorageResult<Vec<PageId>> {
        self.inner.lock().rollback(txn, store)
    }

    /// Ensures everything appended so far is on stable storage.
    pub fn force(&self) -> StorageResult<()> {
        self.inner.lock().force()
    }

    /// Offset of the latest CHECKPOINT record, if any.
    pub fn checkpoint_offset(&self) -> StorageResult<Option<u64>> {
        self.inner.lock().checkpoint_pointer()
    }

    /// Every record in the log with its offset.
    pub fn records(&self) -> StorageResult<Vec<(u64, LogRecord)>> {
        let mut log = self.inner.lock();
        let tail = log.tail;
        log.read_range(HEADER_SIZE, tail)
    }
}
