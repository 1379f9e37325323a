//! Transaction manager and lock manager
//!
//! Transactions carry an undo log of the row mutations they performed;
//! aborting hands the log back to the executor so inserted rows can be
//! tombstoned. Locks are per-row exclusive, granted without blocking, and
//! held to end of transaction.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::heap::RecordId;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// What an undo entry reverses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    Insert,
    Update,
    Delete,
}

/// One recorded mutation
#[derive(Debug, Clone)]
pub struct UndoLog {
    pub kind: UndoKind,
    pub table: String,
    pub rid: RecordId,
}

#[derive(Debug)]
struct Transaction {
    state: TxnState,
    undo_log: Vec<UndoLog>,
}

/// Per-row exclusive lock table
#[derive(Debug, Default)]
pub struct LockManager {
    /// (table, rid) -> owning transaction
    locks: Mutex<HashMap<(String, RecordId), u64>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take an exclusive lock. Re-acquisition by the owner succeeds;
    /// a lock held by anyone else fails immediately.
    pub fn acquire_exclusive(&self, txn_id: u64, table: &str, rid: RecordId) -> bool {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(&(table.to_string(), rid)) {
            Some(&owner) => owner == txn_id,
            None => {
                locks.insert((table.to_string(), rid), txn_id);
                true
            }
        }
    }

    /// Drop every lock a transaction holds
    pub fn release_all(&self, txn_id: u64) {
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, owner| *owner != txn_id);
    }

    /// Number of held locks, for tests and stats
    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Transaction manager
#[derive(Debug)]
pub struct TransactionManager {
    transactions: RwLock<HashMap<u64, Transaction>>,
    next_txn_id: Mutex<u64>,
    locks: std::sync::Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(locks: std::sync::Arc<LockManager>) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            next_txn_id: Mutex::new(1),
            locks,
        }
    }

    /// Start a new transaction and return its id
    pub fn begin(&self) -> u64 {
        let mut next = self.next_txn_id.lock().unwrap();
        let txn_id = *next;
        *next += 1;

        self.transactions.write().unwrap().insert(
            txn_id,
            Transaction {
                state: TxnState::Active,
                undo_log: Vec::new(),
            },
        );
        debug!(txn_id, "transaction started");
        txn_id
    }

    /// Commit: mark the transaction and release its locks
    pub fn commit(&self, txn_id: u64) -> Result<()> {
        {
            let mut transactions = self.transactions.write().unwrap();
            let txn = transactions
                .get_mut(&txn_id)
                .ok_or(Error::TransactionNotFound(txn_id))?;
            if txn.state != TxnState::Active {
                return Err(Error::TransactionNotFound(txn_id));
            }
            txn.state = TxnState::Committed;
            txn.undo_log.clear();
        }
        self.locks.release_all(txn_id);
        debug!(txn_id, "transaction committed");
        Ok(())
    }

    /// Abort: mark the transaction, release its locks, and hand the undo
    /// log back (in recording order) for the executor to reverse.
    pub fn abort(&self, txn_id: u64) -> Result<Vec<UndoLog>> {
        let undo_log = {
            let mut transactions = self.transactions.write().unwrap();
            let txn = transactions
                .get_mut(&txn_id)
                .ok_or(Error::TransactionNotFound(txn_id))?;
            if txn.state != TxnState::Active {
                return Err(Error::TransactionNotFound(txn_id));
            }
            txn.state = TxnState::Aborted;
            std::mem::take(&mut txn.undo_log)
        };
        self.locks.release_all(txn_id);
        debug!(txn_id, entries = undo_log.len(), "transaction aborted");
        Ok(undo_log)
    }

    /// Record a mutation under an active transaction
    pub fn add_undo(&self, txn_id: u64, kind: UndoKind, table: &str, rid: RecordId) -> Result<()> {
        let mut transactions = self.transactions.write().unwrap();
        let txn = transactions
            .get_mut(&txn_id)
            .ok_or(Error::TransactionNotFound(txn_id))?;
        if txn.state != TxnState::Active {
            return Err(Error::TransactionNotFound(txn_id));
        }
        txn.undo_log.push(UndoLog {
            kind,
            table: table.to_string(),
            rid,
        });
        Ok(())
    }

    /// Whether the transaction exists and is active
    pub fn is_active(&self, txn_id: u64) -> bool {
        self.transactions
            .read()
            .unwrap()
            .get(&txn_id)
            .map(|t| t.state == TxnState::Active)
            .unwrap_or(false)
    }

    /// The lock manager transactions acquire through
    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn setup() -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    #[test]
    fn test_lifecycle() {
        let manager = setup();
        let txn = manager.begin();
        assert!(manager.is_active(txn));

        manager.commit(txn).unwrap();
        assert!(!manager.is_active(txn));

        // double commit fails
        assert!(manager.commit(txn).is_err());
    }

    #[test]
    fn test_ids_monotonic() {
        let manager = setup();
        let a = manager.begin();
        let b = manager.begin();
        assert!(b > a);
    }

    #[test]
    fn test_abort_returns_undo_log() {
        let manager = setup();
        let txn = manager.begin();
        manager
            .add_undo(txn, UndoKind::Insert, "t", RecordId::new(0, 0))
            .unwrap();
        manager
            .add_undo(txn, UndoKind::Delete, "t", RecordId::new(0, 1))
            .unwrap();

        let undo = manager.abort(txn).unwrap();
        assert_eq!(undo.len(), 2);
        assert_eq!(undo[0].kind, UndoKind::Insert);
        assert!(!manager.is_active(txn));
        assert!(manager.add_undo(txn, UndoKind::Insert, "t", RecordId::new(0, 2)).is_err());
    }

    #[test]
    fn test_exclusive_locks() {
        let locks = Arc::new(LockManager::new());
        let manager = TransactionManager::new(locks.clone());
        let t1 = manager.begin();
        let t2 = manager.begin();
        let rid = RecordId::new(0, 0);

        assert!(locks.acquire_exclusive(t1, "t", rid));
        // re-entrant for the owner
        assert!(locks.acquire_exclusive(t1, "t", rid));
        // denied for anyone else
        assert!(!locks.acquire_exclusive(t2, "t", rid));
        // a different row is free
        assert!(locks.acquire_exclusive(t2, "t", RecordId::new(0, 1)));

        manager.commit(t1).unwrap();
        assert!(locks.acquire_exclusive(t2, "t", rid));
        assert_eq!(locks.lock_count(), 2);
    }
}
