use std::collections::{HashMap, VecDeque};

use crate::storage::page::PageId;

/// Recency order of resident pages. The cache walks it oldest-first when it
/// looks for an eviction victim; whether a page may actually be evicted is
/// decided by the cache, not here.
#[derive(Debug, Default)]
pub struct LruTracker {
    /// Least recently used at front.
    lru_list: VecDeque<PageId>,
    /// Access stamp of each tracked page; entries in `lru_list` whose stamp
    /// does not match are stale and skipped.
    stamps: HashMap<PageId, u64>,
    stamped: VecDeque<u64>,
    clock: u64,
}

impl LruTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_access(&mut self, page_id: PageId) {
        self.clock += 1;
        self.stamps.insert(page_id, self.clock);
        self.lru_list.push_back(page_id);
        self.stamped.push_back(self.clock);
        self.compact();
    }

    pub fn remove(&mut self, page_id: PageId) {
        self.stamps.remove(&page_id);
        self.compact();
    }

    /// Tracked pages, least recently used first.
    pub fn oldest_first(&self) -> impl Iterator<Item = PageId> + '_ {
        self.lru_list
            .iter()
            .zip(self.stamped.iter())
            .filter(|(id, stamp)| self.stamps.get(*id) == Some(*stamp))
            .map(|(id, _)| *id)
    }

    pub fn size(&self) -> usize {
        self.stamps.len()
    }

    fn compact(&mut self) {
        // Drop stale entries from the front, and rebuild when stale entries
        // outnumber live ones.
        while let (Some(id), Some(stamp)) = (self.lru_list.front(), self.stamped.front()) {
            if self.stamps.get(id) == Some(stamp) {
                break;
            }
            self.lru_list.pop_front();
            self.stamped.pop_front();
        }
        if self.lru_list.len() > 2 * self.stamps.len() + 16 {
            let live: Vec<(PageId, u64)> = self
                .lru_list
                .iter()
                .zip(self.stamped.iter())
                .filter(|(id, stamp)| self.stamps.get(*id) == Some(*stamp))
                .map(|(id, stamp)| (*id, *stamp))
                .collect();
            self.lru_list = live.iter().map(|(id, _)| *id).collect();
            self.stamped = live.iter().map(|(_, stamp)| *stamp).collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u32) -> PageId {
        PageId::new(1, n)
    }

    #[test]
    fn test_oldest_first_order() {
        let mut lru = LruTracker::new();
        lru.record_access(p(1));
        lru.record_access(p(2));
        lru.record_access(p(3));
        assert_eq!(lru.oldest_first().collect::<Vec<_>>(), vec![p(1), p(2), p(3)]);
    }

    #[test]
    fn test_access_moves_to_back() {
        let mut lru = LruTracker::new();
        lru.record_access(p(1));
        lru.record_access(p(2));
        lru.record_access(p(1));
        assert_eq!(lru.oldest_first().collect::<Vec<_>>(), vec![p(2), p(1)]);
        assert_eq!(lru.size(), 2);
    }

    #[test]
    fn test_remove() {
        let mut lru = LruTracker::new();
        lru.record_access(p(1));
        lru.record_access(p(2));
        lru.remove(p(1));
        lru.remove(p(99));
        assert_eq!(lru.oldest_first().collect::<Vec<_>>(), vec![p(2)]);
        assert_eq!(lru.size(), 1);
    }

    #[test]
    fn test_stale_entries_are_compacted() {
        let mut lru = LruTracker::new();
        for _ in 0..1000 {
            lru.record_access(p(1));
        }
        assert!(lru.lru_list.len() <= 2 * lru.size() + 16);
        assert_eq!(lru.oldest_first().collect::<Vec<_>>(), vec![p(1)]);
    }
}
