//! Storage layer.
//!
//! - **Page**: in-memory page bytes with dirty tracking and a before-image
//! - **PageStore**: page-granular backing storage (file-per-table or memory)
//! - **PageCache**: bounded cache of pages shared by concurrent transactions
//! - **WriteAheadLog**: durability and atomicity for transactions
//!
//! Every component is handed its collaborators at construction time.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{PageCache, PageRef};
pub use disk::{FilePageStore, MemoryPageStore, PageStore, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{Page, PageId, PageImage, PageKind};
pub use wal::{LogRecord, WriteAheadLog};
