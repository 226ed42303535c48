//! Checkpoint records and log truncation.
//!
//! A checkpoint lists every active transaction with the offset of its first
//! record; recovery starts at the smallest of those offsets. Truncation
//! drops everything before that point by rewriting the log into a temporary
//! file and renaming it over the original.

use log::info;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, WriteBytesExt};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::wal::{LogRecord, WriteAheadLog, HEADER_SIZE, NO_CHECKPOINT};

fn shift(offset: u64, cut: u64) -> u64 {
    offset.saturating_sub(cut) + HEADER_SIZE
}

impl WriteAheadLog {
    /// Appends a CHECKPOINT record for the currently active transactions,
    /// forces it, then points the header at it. Returns its offset.
    ///
    /// Dirty pages must already have been flushed by the cache.
    pub fn log_checkpoint(&self) -> StorageResult<u64> {
        let mut log = self.inner.lock();
        if log.recovery_pending {
            return Err(StorageError::RecoveryPending);
        }

        let mut active: Vec<_> = log
            .first_record
            .iter()
            .map(|(txn, first)| (*txn, *first))
            .collect();
        active.sort();
        let count = active.len();

        let offset = log.append_unchecked(&LogRecord::Checkpoint { active })?;
        log.force()?;
        log.set_checkpoint_pointer(offset)?;
        log.force()?;

        info!("checkpoint at {offset} with {count} active transaction(s)");
        Ok(offset)
    }

    /// The offset recovery would start scanning from.
    pub fn recovery_start(&self) -> StorageResult<u64> {
        let mut log = self.inner.lock();
        let Some(checkpoint) = log.checkpoint_pointer()? else {
            return Ok(HEADER_SIZE);
        };
        match log.read_record_at(checkpoint)? {
            LogRecord::Checkpoint { active } => Ok(active
                .iter()
                .map(|(_, first)| *first)
                .min()
                .unwrap_or(checkpoint)),
            other => Err(StorageError::CorruptLog {
                offset: checkpoint,
                reason: format!("checkpoint pointer names a {:?} record", other.record_type()),
            }),
        }
    }

    /// Discards every record recovery would no longer read. Returns the
    /// number of bytes removed; zero when there is nothing to drop.
    pub fn truncate(&self) -> StorageResult<u64> {
        let cut = self.recovery_start()?;
        let mut log = self.inner.lock();
        if log.recovery_pending {
            return Err(StorageError::RecoveryPending);
        }
        if cut <= HEADER_SIZE {
            return Ok(0);
        }

        let checkpoint = log.checkpoint_pointer()?;
        let tail = log.tail;
        let records = log.read_range(cut, tail)?;

        let tmp_path = PathBuf::from(format!("{}.tmp", log.path.display()));
        let new_tail = {
            let tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            let header = checkpoint.map_or(NO_CHECKPOINT, |cp| shift(cp, cut) as i64);
            writer.write_i64::<BigEndian>(header)?;

            let mut position = HEADER_SIZE;
            for (offset, record) in records {
                let record = match record {
                    LogRecord::Checkpoint { active } => LogRecord::Checkpoint {
                        active: active
                            .into_iter()
                            .map(|(txn, first)| (txn, shift(first, cut)))
                            .collect(),
                    },
                    other => other,
                };
                debug_assert_eq!(shift(offset, cut), position);
                let bytes = record.encode(position);
                writer.write_all(&bytes)?;
                position += bytes.len() as u64;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
            position
        };

        fs::rename(&tmp_path, &log.path)?;
        if let Some(dir) = log.path.parent() {
            // Make the rename itself durable.
            File::open(dir)?.sync_all()?;
        }
        log.file = OpenOptions::new().read(true).write(true).open(&log.path)?;
        log.tail = new_tail;
        for first in log.first_record.values_mut() {
            *first = shift(*first, cut);
        }

        let removed = cut - HEADER_SIZE;
        info!("log truncated: {removed} byte(s) before offset {cut} dropped");
        Ok(removed)
    }
}
