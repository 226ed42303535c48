use crate::concurrency::lock::LockManager;
use crate::recovery::RecoveryReport;
use crate::storage::buffer::PageCache;
use crate::storage::disk::{FilePageStore, PAGE_SIZE};
use crate::storage::page::PageId;
use crate::storage::wal::WriteAheadLog;
use crate::transaction::Transaction;
use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Settings for opening a [`Database`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the table files and the log.
    pub data_dir: PathBuf,
    /// Number of pages the cache holds.
    pub cache_capacity: usize,
    pub page_size: usize,
    /// Upper bound on a single lock wait. Deadlocks are detected regardless.
    pub lock_wait_timeout: Option<Duration>,
    pub log_file_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pagevault_data"),
            cache_capacity: 50,
            page_size: PAGE_SIZE,
            lock_wait_timeout: None,
            log_file_name: "wal.log".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file_name)
    }
}

/// Store, lock manager, log and cache wired together.
pub struct Database {
    config: DatabaseConfig,
    store: Arc<FilePageStore>,
    cache: Arc<PageCache>,
    recovery: RecoveryReport,
}

impl Database {
    /// Create a new database in an empty (or missing) data directory
    pub fn create(config: DatabaseConfig) -> Result<Self> {
        let log_path = config.log_path();
        if log_path.exists() {
            bail!("Database already exists at {:?}", config.data_dir);
        }
        std::fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;

        let wal = WriteAheadLog::create(&log_path)?;
        Self::assemble(config, wal, false)
    }

    /// Open an existing database, running crash recovery first
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let log_path = config.log_path();
        if !log_path.exists() {
            bail!("No database log at {:?}", log_path);
        }

        let wal = WriteAheadLog::open(&log_path)?;
        Self::assemble(config, wal, true)
    }

    /// Open the database if it exists, otherwise create it
    pub fn open_or_create(config: DatabaseConfig) -> Result<Self> {
        if config.log_path().exists() {
            Self::open(config)
        } else {
            Self::create(config)
        }
    }

    fn assemble(config: DatabaseConfig, wal: WriteAheadLog, recover: bool) -> Result<Self> {
        let store = Arc::new(FilePageStore::open(&config.data_dir, config.page_size)?);
        let locks = match config.lock_wait_timeout {
            Some(timeout) => LockManager::with_timeout(timeout),
            None => LockManager::new(),
        };
        let cache = Arc::new(PageCache::new(
            config.cache_capacity,
            store.clone(),
            Arc::new(locks),
            Arc::new(wal),
        ));

        let recovery = if recover {
            cache.recover().context("Recovery failed")?
        } else {
            RecoveryReport::default()
        };

        info!(
            "database ready at {:?} ({} page cache)",
            config.data_dir, config.cache_capacity
        );
        Ok(Self {
            config,
            store,
            cache,
            recovery,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<FilePageStore> {
        &self.store
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        self.cache.wal()
    }

    /// What recovery did when this database was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn begin(&self) -> Result<Transaction> {
        Ok(Transaction::begin(self.cache.clone())?)
    }

    /// Append a zeroed page to a table
    pub fn allocate_page(&self, table_id: u32) -> Result<PageId> {
        Ok(self.store.allocate_page(table_id)?)
    }

    /// Flush dirty pages and write a checkpoint. No transaction may be
    /// running.
    pub fn checkpoint(&self) -> Result<u64> {
        Ok(self.cache.checkpoint()?)
    }

    /// Drop log records recovery no longer needs
    pub fn truncate_log(&self) -> Result<u64> {
        Ok(self.wal().truncate()?)
    }

    /// Checkpoint and truncate so the next open recovers quickly
    pub fn shutdown(self) -> Result<()> {
        self.checkpoint()?;
        let removed = self.truncate_log()?;
        info!("shutdown complete, {removed} log byte(s) reclaimed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::PageStore;
    use tempfile::tempdir;

    fn small_config(dir: &Path) -> DatabaseConfig {
        DatabaseConfig {
            page_size: 64,
            cache_capacity: 4,
            ..DatabaseConfig::new(dir.join("db"))
        }
    }

    #[test]
    fn test_create_database() -> Result<()> {
        let dir = tempdir()?;
        let config = small_config(dir.path());
        let db = Database::create(config.clone())?;

        assert!(config.log_path().exists());
        assert_eq!(db.recovery_report(), &RecoveryReport::default());
        assert_eq!(db.cache().capacity(), 4);
        Ok(())
    }

    #[test]
    fn test_create_duplicate_database() -> Result<()> {
        let dir = tempdir()?;
        let config = small_config(dir.path());
        let _db = Database::create(config.clone())?;

        assert!(Database::create(config).is_err());
        Ok(())
    }

    #[test]
    fn test_open_nonexistent_database() -> Result<()> {
        let dir = tempdir()?;
        assert!(Database::open(small_config(dir.path())).is_err());
        Ok(())
    }

    #[test]
    fn test_config_defaults_and_serde() -> Result<()> {
        let config = DatabaseConfig::default();
        assert_eq!(config.cache_capacity, 50);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.lock_wait_timeout, None);
        assert_eq!(config.log_path(), PathBuf::from("./pagevault_data/wal.log"));

        let config = DatabaseConfig {
            lock_wait_timeout: Some(Duration::from_millis(250)),
            ..DatabaseConfig::new("/var/lib/pagevault")
        };
        let bytes = bincode::serialize(&config)?;
        let decoded: DatabaseConfig = bincode::deserialize(&bytes)?;
        assert_eq!(decoded, config);
        Ok(())
    }

    #[test]
    fn test_persistence() -> Result<()> {
        let dir = tempdir()?;
        let config = small_config(dir.path());
        let page = {
            let db = Database::create(config.clone())?;
            let page = db.allocate_page(1)?;
            let txn = db.begin()?;
            txn.write(page, |data| data[..5].copy_from_slice(b"hello"))?;
            txn.commit()?;
            db.shutdown()?;
            page
        };

        let db = Database::open(config)?;
        assert_eq!(&db.store().read_page(page)?[..5], b"hello");
        let txn = db.begin()?;
        assert_eq!(&txn.read(page)?[..5], b"hello");
        Ok(())
    }

    #[test]
    fn test_ids_resume_after_recovery() -> Result<()> {
        let dir = tempdir()?;
        let config = small_config(dir.path());
        let last = {
            let db = Database::create(config.clone())?;
            let page = db.allocate_page(1)?;
            let mut last = None;
            for _ in 0..3 {
                let txn = db.begin()?;
                txn.write(page, |data| data[0] += 1)?;
                last = Some(txn.id());
                txn.commit()?;
            }
            last
        };

        let db = Database::open(config)?;
        assert_eq!(db.recovery_report().max_txn, last);
        let txn = db.begin()?;
        assert!(Some(txn.id()) > last);
        Ok(())
    }

    #[test]
    fn test_ids_resume_past_checkpointed_records() -> Result<()> {
        let dir = tempdir()?;
        let config = small_config(dir.path());
        let last = {
            let db = Database::create(config.clone())?;
            let page = db.allocate_page(1)?;
            let mut last = None;
            for _ in 0..3 {
                let txn = db.begin()?;
                txn.write(page, |data| data[0] += 1)?;
                last = Some(txn.id());
                txn.commit()?;
            }
            // Checkpoint without truncating: the old records stay in the log
            // but recovery starts after them.
            db.checkpoint()?;
            last
        };

        let db = Database::open(config)?;
        assert!(db.recovery_report().start_offset > crate::storage::wal::HEADER_SIZE);
        assert_eq!(db.recovery_report().max_txn, last);
        let txn = db.begin()?;
        assert!(Some(txn.id()) > last);
        Ok(())
    }
}
