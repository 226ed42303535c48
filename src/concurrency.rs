//! Concurrency control.
//!
//! - `lock`: per-page shared/exclusive locks held under strict two-phase locking
//! - `wait_for`: the wait-for graph used to refuse requests that would deadlock

pub mod lock;
pub mod wait_for;

pub use lock::{LockManager, LockMode, PageLock};
pub use wait_for::WaitForGraph;
