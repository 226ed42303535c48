//! Backing page stores.
//!
//! The cache and the log only see the [`PageStore`] trait. [`FilePageStore`]
//! keeps one file per table; [`MemoryPageStore`] is a volatile store for
//! embedding and tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;

pub const PAGE_SIZE: usize = 4096;

/// Page-granular storage underneath the cache. A single `write_page` is
/// assumed never to be observed half-written.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    fn read_page(&self, page_id: PageId) -> StorageResult<Vec<u8>>;

    fn write_page(&self, page_id: PageId, data: &[u8]) -> StorageResult<()>;
}

fn check_len(expected: usize, actual: usize) -> StorageResult<()> {
    if expected != actual {
        return Err(StorageError::PageSizeMismatch { expected, actual });
    }
    Ok(())
}

pub struct FilePageStore {
    dir: PathBuf,
    page_size: usize,
    files: Mutex<HashMap<u32, File>>,
}

impl FilePageStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: &Path, page_size: usize) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn table_path(&self, table_id: u32) -> PathBuf {
        self.dir.join(format!("table_{table_id}.dat"))
    }

    pub fn num_pages(&self, table_id: u32) -> StorageResult<u32> {
        let mut files = self.files.lock();
        let file = self.file_for(&mut files, table_id)?;
        Ok((file.metadata()?.len() / self.page_size as u64) as u32)
    }

    /// Appends a zeroed page to `table_id` and returns its id.
    pub fn allocate_page(&self, table_id: u32) -> StorageResult<PageId> {
        let page_id = PageId::new(table_id, self.num_pages(table_id)?);
        self.write_page(page_id, &vec![0u8; self.page_size])?;
        Ok(page_id)
    }

    fn file_for<'a>(
        &self,
        files: &'a mut HashMap<u32, File>,
        table_id: u32,
    ) -> StorageResult<&'a mut File> {
        if !files.contains_key(&table_id) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.table_path(table_id))?;
            files.insert(table_id, file);
        }
        files
            .get_mut(&table_id)
            .ok_or_else(|| StorageError::Io(std::io::Error::other("table file vanished")))
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.page_number as u64 * self.page_size as u64
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> StorageResult<Vec<u8>> {
        let offset = self.page_offset(page_id);
        let mut files = self.files.lock();
        let file = self.file_for(&mut files, page_id.table_id)?;

        if offset + self.page_size as u64 > file.metadata()?.len() {
            return Err(StorageError::PageNotFound(page_id));
        }

        let mut buf = vec![0u8; self.page_size];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        check_len(self.page_size, data.len())?;

        let offset = self.page_offset(page_id);
        let mut files = self.files.lock();
        let file = self.file_for(&mut files, page_id.table_id)?;

        // Extend file if necessary
        if offset >= file.metadata()?.len() {
            file.set_len(offset + self.page_size as u64)?;
        }

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Volatile store keyed by page id.
pub struct MemoryPageStore {
    page_size: usize,
    pages: Mutex<HashMap<PageId, Vec<u8>>>,
}

impl MemoryPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> StorageResult<Vec<u8>> {
        self.pages
            .lock()
            .get(&page_id)
            .cloned()
            .ok_or(StorageError::PageNotFound(page_id))
    }

    fn write_page(&self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        check_len(self.page_size, data.len())?;
        self.pages.lock().insert(page_id, data.to_vec());
        Ok(())
    }
}
