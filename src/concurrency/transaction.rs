use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::{RecordId, TableId, TxnId};
use crate::index::BPlusTree;

use super::lock_manager::LockMode;

/// Isolation level, fixed for the lifetime of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking state machine:
/// GROWING -> SHRINKING -> { COMMITTED, ABORTED }
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Reason codes carried by a transaction abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
    Deadlock,
}

/// Typed abort raised by the lock manager. The transaction's state has
/// already been set to ABORTED when this error is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{txn_id} aborted: {reason:?}")]
pub struct TransactionAbortError {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

pub type LockResult<T> = std::result::Result<T, TransactionAbortError>;

/// The kind of a logged write, for rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Delete,
}

/// A logged table-heap write. The table heap itself is an external
/// collaborator; these records are carried for it to undo.
#[derive(Debug, Clone)]
pub struct TableWriteRecord {
    pub table_id: TableId,
    pub rid: RecordId,
    pub op: WriteOp,
}

/// A logged index write, undone against the index on abort.
pub struct IndexWriteRecord {
    pub op: WriteOp,
    pub key: Vec<u8>,
    pub rid: RecordId,
    pub index: Arc<BPlusTree>,
}

/// Per-mode lock bookkeeping, behind the transaction's own latch.
#[derive(Default)]
struct LockSets {
    intention_shared_tables: HashSet<TableId>,
    intention_exclusive_tables: HashSet<TableId>,
    shared_tables: HashSet<TableId>,
    shared_intention_exclusive_tables: HashSet<TableId>,
    exclusive_tables: HashSet<TableId>,
    shared_rows: HashMap<TableId, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableId, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableId> {
        match mode {
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::Shared => &mut self.shared_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
        }
    }

    fn table_set(&self, mode: LockMode) -> &HashSet<TableId> {
        match mode {
            LockMode::IntentionShared => &self.intention_shared_tables,
            LockMode::IntentionExclusive => &self.intention_exclusive_tables,
            LockMode::Shared => &self.shared_tables,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_tables,
            LockMode::Exclusive => &self.exclusive_tables,
        }
    }
}

/// A transaction: identity, isolation level, 2PL state, lock bookkeeping and
/// write-record logs. Shared across threads as Arc<Transaction>; every field
/// is behind its own latch so the lock manager, the deadlock detector and the
/// owning thread can all touch it.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSets>,
    write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
            write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, table_id: TableId) {
        self.locks.lock().table_set_mut(mode).insert(table_id);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, table_id: TableId) {
        self.locks.lock().table_set_mut(mode).remove(&table_id);
    }

    /// Whether the transaction holds the table in exactly this mode.
    pub fn holds_table_lock(&self, table_id: TableId, mode: LockMode) -> bool {
        self.locks.lock().table_set(mode).contains(&table_id)
    }

    /// Whether the transaction holds the table in any of the given modes.
    pub fn holds_any_table_lock(&self, table_id: TableId, modes: &[LockMode]) -> bool {
        let locks = self.locks.lock();
        modes.iter().any(|&m| locks.table_set(m).contains(&table_id))
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, table_id: TableId, rid: RecordId) {
        let mut locks = self.locks.lock();
        let map = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("intention locks are never taken on rows"),
        };
        map.entry(table_id).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, table_id: TableId, rid: RecordId) {
        let mut locks = self.locks.lock();
        let map = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => unreachable!("intention locks are never taken on rows"),
        };
        if let Some(rows) = map.get_mut(&table_id) {
            rows.remove(&rid);
        }
    }

    /// Whether the transaction holds the row in the given mode.
    pub fn holds_row_lock(&self, table_id: TableId, rid: RecordId, mode: LockMode) -> bool {
        let locks = self.locks.lock();
        let map = match mode {
            LockMode::Shared => &locks.shared_rows,
            LockMode::Exclusive => &locks.exclusive_rows,
            _ => return false,
        };
        map.get(&table_id).map(|rows| rows.contains(&rid)).unwrap_or(false)
    }

    /// Whether the transaction still holds any row lock on the table.
    pub fn has_row_locks_on(&self, table_id: TableId) -> bool {
        let locks = self.locks.lock();
        let shared = locks
            .shared_rows
            .get(&table_id)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false);
        let exclusive = locks
            .exclusive_rows
            .get(&table_id)
            .map(|rows| !rows.is_empty())
            .unwrap_or(false);
        shared || exclusive
    }

    /// Drains all lock bookkeeping, returning what was held. Used by lock
    /// release on commit/abort; a second call finds nothing, so releasing
    /// twice is harmless.
    pub(crate) fn take_held_locks(
        &self,
    ) -> (Vec<(LockMode, TableId)>, Vec<(LockMode, TableId, RecordId)>) {
        let mut locks = self.locks.lock();
        let mut tables = Vec::new();
        let mut rows = Vec::new();

        for mode in [
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ] {
            for table_id in locks.table_set_mut(mode).drain() {
                tables.push((mode, table_id));
            }
        }

        for (table_id, rids) in locks.shared_rows.drain() {
            for rid in rids {
                rows.push((LockMode::Shared, table_id, rid));
            }
        }
        for (table_id, rids) in locks.exclusive_rows.drain() {
            for rid in rids {
                rows.push((LockMode::Exclusive, table_id, rid));
            }
        }

        (tables, rows)
    }

    /// Logs a table-heap write for the external heap to undo on abort.
    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Logs an index write, undone against the index on abort.
    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    pub fn take_table_write_set(&self) -> Vec<TableWriteRecord> {
        std::mem::take(&mut *self.write_set.lock())
    }

    pub(crate) fn take_index_write_set(&self) -> Vec<IndexWriteRecord> {
        std::mem::take(&mut *self.index_write_set.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{PageId, SlotId};

    fn rid(v: u32) -> RecordId {
        RecordId::new(PageId::new(v), SlotId::new(0))
    }

    #[test]
    fn test_transaction_initial_state() {
        let txn = Transaction::new(TxnId::new(1), IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), TxnId::new(1));
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_table_lock_bookkeeping() {
        let txn = Transaction::new(TxnId::new(1), IsolationLevel::RepeatableRead);
        let table = TableId::new(3);

        txn.insert_table_lock(LockMode::IntentionExclusive, table);
        assert!(txn.holds_table_lock(table, LockMode::IntentionExclusive));
        assert!(!txn.holds_table_lock(table, LockMode::Exclusive));
        assert!(txn.holds_any_table_lock(
            table,
            &[LockMode::IntentionExclusive, LockMode::Exclusive]
        ));

        txn.remove_table_lock(LockMode::IntentionExclusive, table);
        assert!(!txn.holds_table_lock(table, LockMode::IntentionExclusive));
    }

    #[test]
    fn test_row_lock_bookkeeping() {
        let txn = Transaction::new(TxnId::new(1), IsolationLevel::RepeatableRead);
        let table = TableId::new(3);

        txn.insert_row_lock(LockMode::Shared, table, rid(1));
        txn.insert_row_lock(LockMode::Exclusive, table, rid(2));
        assert!(txn.holds_row_lock(table, rid(1), LockMode::Shared));
        assert!(txn.holds_row_lock(table, rid(2), LockMode::Exclusive));
        assert!(txn.has_row_locks_on(table));

        txn.remove_row_lock(LockMode::Shared, table, rid(1));
        assert!(txn.has_row_locks_on(table));
        txn.remove_row_lock(LockMode::Exclusive, table, rid(2));
        assert!(!txn.has_row_locks_on(table));
    }

    #[test]
    fn test_take_held_locks_drains() {
        let txn = Transaction::new(TxnId::new(1), IsolationLevel::RepeatableRead);
        let table = TableId::new(3);

        txn.insert_table_lock(LockMode::Shared, table);
        txn.insert_row_lock(LockMode::Shared, table, rid(1));

        let (tables, rows) = txn.take_held_locks();
        assert_eq!(tables, vec![(LockMode::Shared, table)]);
        assert_eq!(rows, vec![(LockMode::Shared, table, rid(1))]);

        let (tables, rows) = txn.take_held_locks();
        assert!(tables.is_empty());
        assert!(rows.is_empty());
    }
}
