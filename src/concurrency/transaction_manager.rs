use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{Result, TxnId};

use super::lock_manager::LockManager;
use super::transaction::{IsolationLevel, Transaction, TransactionState, WriteOp};

/// Hands out transactions with process-wide monotonic ids and drives their
/// lifecycle. Commit releases locks; abort first undoes the index write set
/// (newest record first), then releases locks.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_manager: Arc<LockManager>,
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(0),
            lock_manager,
            txns: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a new transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.txns.lock().insert(id, Arc::clone(&txn));
        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().get(&txn_id).cloned()
    }

    /// Commits: releases every held lock and marks the transaction committed.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Committed);
    }

    /// Aborts: rolls back logged index writes in reverse order, hands the
    /// table write set back for the external heap, releases locks, and marks
    /// the transaction aborted.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        for record in txn.take_index_write_set().into_iter().rev() {
            match record.op {
                WriteOp::Insert => {
                    record.index.remove(&record.key)?;
                }
                WriteOp::Delete => {
                    record.index.insert(&record.key, record.rid)?;
                }
            }
        }
        txn.take_table_write_set();

        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Aborted);
        Ok(())
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DEFAULT_DEADLOCK_DETECTION_INTERVAL;

    #[test]
    fn test_begin_assigns_monotonic_ids() {
        let lock_manager = Arc::new(LockManager::new(DEFAULT_DEADLOCK_DETECTION_INTERVAL));
        let txn_manager = TransactionManager::new(lock_manager);

        let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
        let t2 = txn_manager.begin(IsolationLevel::ReadCommitted);

        assert!(t1.id() < t2.id());
        assert_eq!(txn_manager.get_transaction(t1.id()).unwrap().id(), t1.id());
    }

    #[test]
    fn test_commit_marks_committed() {
        let lock_manager = Arc::new(LockManager::new(DEFAULT_DEADLOCK_DETECTION_INTERVAL));
        let txn_manager = TransactionManager::new(lock_manager);

        let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
        txn_manager.commit(&txn);
        assert_eq!(txn.state(), TransactionState::Committed);
    }
}
