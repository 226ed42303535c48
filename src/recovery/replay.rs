//! Crash recovery by log replay.
//!
//! Recovery scans forward from the latest checkpoint (or the start of the
//! log), buffering each transaction's UPDATE records. A COMMIT redoes the
//! buffered after-images, an ABORT undoes the buffered before-images, and
//! whatever is still buffered at the end of the log belonged to a
//! transaction that was in flight at the crash and is undone.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, Seek, SeekFrom};

use crate::storage::disk::PageStore;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageImage};
use crate::storage::wal::manager::LogFile;
use crate::storage::wal::{LogRecord, WriteAheadLog, HEADER_SIZE};
use crate::transaction::TransactionId;

/// Outcome of a recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Committed transactions whose after-images were reapplied.
    pub redone: usize,
    /// Aborted or in-flight transactions whose before-images were reapplied.
    pub undone: usize,
    /// Pages whose stored image was overwritten, in first-write order.
    pub pages_written: Vec<PageId>,
    /// Largest transaction id anywhere in the log.
    pub max_txn: Option<TransactionId>,
    /// Offset the scan started at.
    pub start_offset: u64,
}

impl RecoveryReport {
    fn note_page(&mut self, page: PageId) {
        if !self.pages_written.contains(&page) {
            self.pages_written.push(page);
        }
    }

    fn note_txn(&mut self, txn: TransactionId) {
        if self.max_txn.map_or(true, |max| txn > max) {
            self.max_txn = Some(txn);
        }
    }
}

#[derive(Default)]
struct PendingUpdates {
    before: Vec<PageImage>,
    after: Vec<PageImage>,
}

struct Replay<'a> {
    store: &'a dyn PageStore,
    pending: BTreeMap<TransactionId, PendingUpdates>,
    report: RecoveryReport,
}

impl<'a> Replay<'a> {
    fn apply(&mut self, offset: u64, record: LogRecord) -> StorageResult<()> {
        if let Some(txn) = record.txn() {
            self.report.note_txn(txn);
        }
        match record {
            LogRecord::Begin { txn } => {
                self.pending.entry(txn).or_default();
            }
            LogRecord::Update { txn, before, after } => match self.pending.get_mut(&txn) {
                Some(updates) => {
                    updates.before.push(before);
                    updates.after.push(after);
                }
                None => warn!("UPDATE at {offset} for untracked {txn}; skipped"),
            },
            LogRecord::Commit { txn } => {
                if let Some(updates) = self.pending.remove(&txn) {
                    self.redo(&updates.after)?;
                    self.report.redone += 1;
                    debug!("redo {txn}: {} update(s)", updates.after.len());
                }
            }
            LogRecord::Abort { txn } => {
                if let Some(updates) = self.pending.remove(&txn) {
                    self.undo(&updates.before)?;
                    self.report.undone += 1;
                    debug!("undo aborted {txn}: {} update(s)", updates.before.len());
                }
            }
            LogRecord::Checkpoint { .. } => {}
        }
        Ok(())
    }

    fn redo(&mut self, images: &[PageImage]) -> StorageResult<()> {
        for image in images {
            self.store.write_page(image.id, &image.data)?;
            self.report.note_page(image.id);
        }
        Ok(())
    }

    /// Latest first, so the oldest before-image is what remains.
    fn undo(&mut self, images: &[PageImage]) -> StorageResult<()> {
        for image in images.iter().rev() {
            self.store.write_page(image.id, &image.data)?;
            self.report.note_page(image.id);
        }
        Ok(())
    }
}

impl LogFile {
    /// Reads the single record at `offset`.
    pub(crate) fn read_record_at(&mut self, offset: u64) -> StorageResult<LogRecord> {
        let bounds = self.bounds(None);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut self.file);
        LogRecord::decode(&mut reader, offset, bounds)?
            .map(|(record, _)| record)
            .ok_or_else(|| StorageError::CorruptLog {
                offset,
                reason: "no record at offset".to_string(),
            })
    }
}

impl WriteAheadLog {
    /// Brings `store` to the state where every committed transaction's
    /// updates are applied and no uncommitted one's are.
    ///
    /// Must run before any transaction starts. Transactions left in flight
    /// by the crash get an ABORT record so a later recovery treats them the
    /// same way. The caller must discard [`RecoveryReport::pages_written`]
    /// from any cache.
    pub fn recover(&self, store: &dyn PageStore) -> StorageResult<RecoveryReport> {
        let mut log = self.inner.lock();
        let mut replay = Replay {
            store,
            pending: BTreeMap::new(),
            report: RecoveryReport::default(),
        };

        let start = match log.checkpoint_pointer()? {
            Some(checkpoint) => match log.read_record_at(checkpoint)? {
                LogRecord::Checkpoint { active } => {
                    for (txn, _) in &active {
                        replay.pending.entry(*txn).or_default();
                        replay.report.note_txn(*txn);
                    }
                    active
                        .iter()
                        .map(|(_, first)| *first)
                        .min()
                        .unwrap_or(checkpoint)
                }
                other => {
                    return Err(StorageError::CorruptLog {
                        offset: checkpoint,
                        reason: format!("checkpoint pointer names a {:?} record", other.record_type()),
                    })
                }
            },
            None => HEADER_SIZE,
        };
        replay.report.start_offset = start;
        let page_size = Some(store.page_size());

        // Records before the start point are settled, but their ids must not
        // be handed out again.
        if start > HEADER_SIZE {
            log.scan(HEADER_SIZE, start, page_size, |_, record| {
                if let Some(txn) = record.txn() {
                    replay.report.note_txn(txn);
                }
                Ok(())
            })?;
        }

        let tail = log.tail;
        match log.scan(start, tail, page_size, |offset, record| replay.apply(offset, record)) {
            Ok(()) => {}
            Err(StorageError::TornRecord { offset }) => {
                warn!("log ends with a torn record at {offset}; discarding {} byte(s)", tail - offset);
                log.file.set_len(offset)?;
                log.tail = offset;
            }
            Err(e) => return Err(e),
        }

        let in_flight: Vec<_> = std::mem::take(&mut replay.pending).into_iter().collect();
        for (txn, updates) in in_flight {
            replay.undo(&updates.before)?;
            replay.report.undone += 1;
            log.append_unchecked(&LogRecord::Abort { txn })?;
            debug!("undo in-flight {txn}: {} update(s)", updates.before.len());
        }
        log.force()?;

        log.first_record = HashMap::new();
        log.recovery_pending = false;

        let report = replay.report;
        info!(
            "recovery from offset {}: {} redone, {} undone, {} page(s) written",
            report.start_offset,
            report.redone,
            report.undone,
            report.pages_written.len()
        );
        Ok(report)
    }
}
