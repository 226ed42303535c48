//! Transactions.
//!
//! - `id`: process-wide unique transaction ids
//! - `handle`: the [`Transaction`] handle used by callers

pub mod handle;
pub mod id;

pub use handle::{Transaction, TransactionState};
pub use id::{TransactionId, TransactionIdGenerator};
