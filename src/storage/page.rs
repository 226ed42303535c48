//! In-memory pages and their identifiers.
//!
//! A [`Page`] carries its bytes plus the bookkeeping the cache and the log
//! need: which transaction dirtied it, and the before-image captured at its
//! last stable point (load, commit, or rollback).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transaction::TransactionId;

/// Identifies a page by table and page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    pub table_id: u32,
    pub page_number: u32,
}

impl PageId {
    pub fn new(table_id: u32, page_number: u32) -> Self {
        Self {
            table_id,
            page_number,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page(table {}, #{})", self.table_id, self.page_number)
    }
}

/// Concrete page layouts known to the log codec. Each variant is written to
/// the log as its tag, so adding a layout means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    /// Slotted heap page.
    Heap,
}

impl PageKind {
    pub fn tag(&self) -> i32 {
        match self {
            PageKind::Heap => 1,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(PageKind::Heap),
            _ => None,
        }
    }
}

/// A byte snapshot of one page, as stored in UPDATE log records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub id: PageId,
    pub kind: PageKind,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Page {
    id: PageId,
    kind: PageKind,
    data: Vec<u8>,
    before_image: Vec<u8>,
    dirtied_by: Option<TransactionId>,
}

impl Page {
    /// Creates a clean page whose before-image equals `data`.
    pub fn new(id: PageId, kind: PageKind, data: Vec<u8>) -> Self {
        Self {
            id,
            kind,
            before_image: data.clone(),
            data,
            dirtied_by: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access to the page bytes. Callers must hold the page's
    /// exclusive lock and call [`mark_dirty`](Self::mark_dirty).
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirtied_by.is_some()
    }

    pub fn dirtied_by(&self) -> Option<TransactionId> {
        self.dirtied_by
    }

    /// Records `txn` as the dirtying transaction unless the page is already
    /// dirty. The before-image is left at the last stable point.
    pub fn mark_dirty(&mut self, txn: TransactionId) {
        if self.dirtied_by.is_none() {
            self.dirtied_by = Some(txn);
        }
    }

    pub fn mark_clean(&mut self) {
        self.dirtied_by = None;
    }

    pub fn before_image(&self) -> PageImage {
        PageImage {
            id: self.id,
            kind: self.kind,
            data: self.before_image.clone(),
        }
    }

    pub fn after_image(&self) -> PageImage {
        PageImage {
            id: self.id,
            kind: self.kind,
            data: self.data.clone(),
        }
    }

    /// Makes the current bytes the new stable point.
    pub fn set_before_image(&mut self) {
        self.before_image.clone_from(&self.data);
    }

    /// Discards in-place changes, returning the page to its last stable
    /// point. The page is clean afterwards.
    pub fn restore_before_image(&mut self) {
        self.data.clone_from(&self.before_image);
        self.dirtied_by = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(byte: u8) -> Page {
        Page::new(PageId::new(1, 0), PageKind::Heap, vec![byte; 16])
    }

    #[test]
    fn test_first_dirtier_wins() {
        let mut page = page_with(0);
        page.mark_dirty(TransactionId::new(1));
        page.mark_dirty(TransactionId::new(2));
        assert_eq!(page.dirtied_by(), Some(TransactionId::new(1)));
    }

    #[test]
    fn test_restore_returns_to_load_state() {
        let mut page = page_with(7);
        page.data_mut()[0] = 42;
        page.mark_dirty(TransactionId::new(1));

        page.restore_before_image();
        assert!(!page.is_dirty());
        assert_eq!(page.data(), &[7u8; 16][..]);
    }

    #[test]
    fn test_commit_point_moves_before_image() {
        let mut page = page_with(0);
        page.data_mut()[3] = 9;
        page.mark_dirty(TransactionId::new(1));
        page.set_before_image();
        page.mark_clean();

        // A later abort only rolls back to the committed bytes.
        page.data_mut()[3] = 10;
        page.mark_dirty(TransactionId::new(2));
        page.restore_before_image();
        assert_eq!(page.data()[3], 9);
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(PageKind::from_tag(PageKind::Heap.tag()), Some(PageKind::Heap));
        assert_eq!(PageKind::from_tag(99), None);
    }
}
