//! Backing storage for pages.

pub mod page_manager;

pub use page_manager::{FilePageStore, MemoryPageStore, PageStore, PAGE_SIZE};
