//! Transaction module
//!
//! Transaction lifecycle, undo logging, and row locks.

pub mod transaction;

pub use transaction::{LockManager, TransactionManager, TxnState, UndoKind, UndoLog};
