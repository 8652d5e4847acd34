use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::common::{RecordId, TableId, TxnId};

use super::transaction::{
    AbortReason, IsolationLevel, LockResult, Transaction, TransactionAbortError, TransactionState,
};
use super::wait_for_graph::WaitForGraph;

/// Hierarchical lock modes over tables and rows. Rows only ever take
/// Shared or Exclusive; the intention modes exist at the table level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// Compatibility matrix, self = held lock, other = requested lock:
    ///
    /// ```text
    ///        IS  IX  S   SIX  X
    /// IS     +   +   +   +    -
    /// IX     +   +   -   -    -
    /// S      +   -   +   -    -
    /// SIX    +   -   -   -    -
    /// X      -   -   -   -    -
    /// ```
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => other != Exclusive,
            IntentionExclusive => matches!(other, IntentionShared | IntentionExclusive),
            Shared => matches!(other, IntentionShared | Shared),
            SharedIntentionExclusive => other == IntentionShared,
            Exclusive => false,
        }
    }

    /// Legal upgrades: IS -> {S, IX, SIX, X}; S -> {SIX, X};
    /// IX -> {SIX, X}; SIX -> X.
    pub fn upgrade_allowed(from: LockMode, to: LockMode) -> bool {
        use LockMode::*;
        match from {
            IntentionShared => {
                matches!(to, Shared | IntentionExclusive | SharedIntentionExclusive | Exclusive)
            }
            Shared | IntentionExclusive => matches!(to, SharedIntentionExclusive | Exclusive),
            SharedIntentionExclusive => to == Exclusive,
            Exclusive => false,
        }
    }
}

/// One entry in a lock request queue.
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

/// Queue state: FIFO request list plus the transaction currently upgrading,
/// if any. At most one upgrade is in flight per queue.
#[derive(Default)]
struct QueueState {
    requests: Vec<LockRequest>,
    upgrading: Option<TxnId>,
}

/// Per-object lock request queue with its condition variable. Waiters block
/// on the condvar and are re-checked whenever the queue changes.
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

/// Shared lock-manager state, also referenced by the detector thread.
struct LockManagerInner {
    table_lock_map: Mutex<HashMap<TableId, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
    /// Transactions seen by this lock manager, so the detector can abort
    /// victims without a back-reference to the transaction manager.
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl LockManagerInner {
    fn table_queue(&self, table_id: TableId) -> Arc<LockRequestQueue> {
        let mut map = self.table_lock_map.lock();
        Arc::clone(
            map.entry(table_id)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        let mut map = self.row_lock_map.lock();
        Arc::clone(
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new())),
        )
    }

    fn find_table_queue(&self, table_id: TableId) -> Option<Arc<LockRequestQueue>> {
        self.table_lock_map.lock().get(&table_id).cloned()
    }

    fn find_row_queue(&self, rid: RecordId) -> Option<Arc<LockRequestQueue>> {
        self.row_lock_map.lock().get(&rid).cloned()
    }

    fn all_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let mut queues: Vec<_> = self.table_lock_map.lock().values().cloned().collect();
        queues.extend(self.row_lock_map.lock().values().cloned());
        queues
    }

    fn txn(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().get(&txn_id).cloned()
    }
}

/// Two-phase-locking lock manager with hierarchical table/row locks,
/// upgrade queues and cycle-based deadlock detection.
///
/// Granting is FIFO modulo upgrade priority: a waiter is granted once every
/// granted lock is compatible with it and either it is the designated
/// upgrader or no upgrade is pending and no earlier incompatible waiter
/// exists. A background thread periodically rebuilds the waits-for graph and
/// aborts the youngest transaction on every cycle.
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    shutdown: Arc<AtomicBool>,
    detector_handle: Option<JoinHandle<()>>,
}

impl LockManager {
    /// Creates the lock manager and starts its deadlock detection thread
    /// with the given pass interval.
    pub fn new(detection_interval: Duration) -> Self {
        let inner = Arc::new(LockManagerInner {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            txns: Mutex::new(HashMap::new()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let inner_clone = Arc::clone(&inner);
        let shutdown_clone = Arc::clone(&shutdown);
        let detector_handle = thread::spawn(move || {
            Self::run_cycle_detection(inner_clone, shutdown_clone, detection_interval);
        });

        Self {
            inner,
            shutdown,
            detector_handle: Some(detector_handle),
        }
    }

    /// Acquires (or upgrades to) a table lock. Blocks until granted; aborts
    /// the transaction on isolation violations, illegal upgrades or when it
    /// is chosen as a deadlock victim while waiting.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
    ) -> LockResult<()> {
        Self::check_isolation(txn, mode)?;
        self.register(txn);

        let queue = self.inner.table_queue(table_id);
        self.lock_on_queue(
            txn,
            &queue,
            mode,
            |old| txn.remove_table_lock(old, table_id),
            |granted| txn.insert_table_lock(granted, table_id),
        )
    }

    /// Acquires (or upgrades to) a row lock. Rows take only S or X, and the
    /// table must already be locked in a mode that covers the request.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
        rid: RecordId,
    ) -> LockResult<()> {
        use LockMode::*;

        if !matches!(mode, Shared | Exclusive) {
            return Err(Self::abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }

        let required: &[LockMode] = if mode == Shared {
            &[IntentionShared, IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive]
        } else {
            &[IntentionExclusive, SharedIntentionExclusive, Exclusive]
        };
        if !txn.holds_any_table_lock(table_id, required) {
            return Err(Self::abort_txn(txn, AbortReason::TableLockNotPresent));
        }

        Self::check_isolation(txn, mode)?;
        self.register(txn);

        let queue = self.inner.row_queue(rid);
        self.lock_on_queue(
            txn,
            &queue,
            mode,
            |old| txn.remove_row_lock(old, table_id, rid),
            |granted| txn.insert_row_lock(granted, table_id, rid),
        )
    }

    /// Releases a table lock, applying the 2PL state transition. Fails if no
    /// lock is held or row locks on the table are still outstanding.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, table_id: TableId) -> LockResult<()> {
        let queue = match self.inner.find_table_queue(table_id) {
            Some(queue) => queue,
            None => return Err(Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mut state = queue.state.lock();
        let pos = match state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            Some(pos) => pos,
            None => return Err(Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        if txn.has_row_locks_on(table_id) {
            return Err(Self::abort_txn(
                txn,
                AbortReason::TableUnlockedBeforeUnlockingRows,
            ));
        }

        let mode = state.requests[pos].mode;
        Self::apply_unlock_transition(txn, mode);

        txn.remove_table_lock(mode, table_id);
        state.requests.remove(pos);
        drop(state);
        queue.cv.notify_all();

        Ok(())
    }

    /// Releases a row lock. `force` skips the 2PL state transition, so a
    /// predicate filter can give a row back without ending the growth phase.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
        rid: RecordId,
        force: bool,
    ) -> LockResult<()> {
        let queue = match self.inner.find_row_queue(rid) {
            Some(queue) => queue,
            None => return Err(Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mut state = queue.state.lock();
        let pos = match state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            Some(pos) => pos,
            None => return Err(Self::abort_txn(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mode = state.requests[pos].mode;
        if !force {
            Self::apply_unlock_transition(txn, mode);
        }

        txn.remove_row_lock(mode, table_id, rid);
        state.requests.remove(pos);
        drop(state);
        queue.cv.notify_all();

        Ok(())
    }

    /// Removes every granted lock of the transaction from its queues and
    /// wakes the waiters. Called on commit and abort; releasing twice is a
    /// no-op because the bookkeeping drains on the first call.
    pub fn release_all(&self, txn: &Arc<Transaction>) {
        Self::release_all_on(&self.inner, txn);
    }

    fn release_all_on(inner: &LockManagerInner, txn: &Arc<Transaction>) {
        let (tables, rows) = txn.take_held_locks();

        // Rows first, so the row-before-table unlock order is preserved
        for (_, _, rid) in rows {
            if let Some(queue) = inner.find_row_queue(rid) {
                let mut state = queue.state.lock();
                if let Some(pos) = state
                    .requests
                    .iter()
                    .position(|r| r.txn_id == txn.id() && r.granted)
                {
                    state.requests.remove(pos);
                }
                drop(state);
                queue.cv.notify_all();
            }
        }

        for (_, table_id) in tables {
            if let Some(queue) = inner.find_table_queue(table_id) {
                let mut state = queue.state.lock();
                if let Some(pos) = state
                    .requests
                    .iter()
                    .position(|r| r.txn_id == txn.id() && r.granted)
                {
                    state.requests.remove(pos);
                }
                drop(state);
                queue.cv.notify_all();
            }
        }
    }

    /// Enqueues a request (or an upgrade) and waits until it can be granted.
    /// On wakeup with the transaction aborted, the request is unlinked, the
    /// upgrade slot freed, the queue notified, and failure returned.
    fn lock_on_queue<FRem, FIns>(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        mode: LockMode,
        remove_bookkeeping: FRem,
        insert_bookkeeping: FIns,
    ) -> LockResult<()>
    where
        FRem: Fn(LockMode),
        FIns: Fn(LockMode),
    {
        let mut state = queue.state.lock();

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id == txn.id()) {
            let old_mode = state.requests[pos].mode;
            if old_mode == mode {
                // Re-request in the held mode is a no-op
                return Ok(());
            }
            if state.upgrading.is_some() {
                return Err(Self::abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !LockMode::upgrade_allowed(old_mode, mode) {
                return Err(Self::abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }

            // Drop the held lock and reserve the queue's single upgrade slot
            state.requests.remove(pos);
            remove_bookkeeping(old_mode);
            state.requests.push(LockRequest::new(txn.id(), mode));
            state.upgrading = Some(txn.id());
        } else {
            state.requests.push(LockRequest::new(txn.id(), mode));
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::unlink_request(&mut state, txn.id());
                drop(state);
                queue.cv.notify_all();
                return Err(TransactionAbortError {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::grant_allowed(&state, txn.id(), mode) {
                break;
            }
            queue.cv.wait(&mut state);
        }

        let pos = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
            .expect("pending lock request disappeared");
        state.requests[pos].granted = true;
        if state.upgrading == Some(txn.id()) {
            state.upgrading = None;
        }
        insert_bookkeeping(mode);

        Ok(())
    }

    /// FIFO-with-upgrade-priority grant check. The queue latch is held.
    fn grant_allowed(state: &QueueState, txn_id: TxnId, mode: LockMode) -> bool {
        for request in &state.requests {
            if request.granted && !request.mode.compatible_with(mode) {
                return false;
            }
        }

        // The designated upgrader jumps the queue; everyone else waits for it
        if state.upgrading == Some(txn_id) {
            return true;
        }
        if state.upgrading.is_some() {
            return false;
        }

        for request in &state.requests {
            if request.txn_id == txn_id {
                return true;
            }
            if !request.granted && !request.mode.compatible_with(mode) {
                return false;
            }
        }

        false
    }

    fn unlink_request(state: &mut QueueState, txn_id: TxnId) {
        if let Some(pos) = state.requests.iter().position(|r| r.txn_id == txn_id) {
            state.requests.remove(pos);
        }
        if state.upgrading == Some(txn_id) {
            state.upgrading = None;
        }
    }

    /// Isolation-level gates on lock acquisition.
    fn check_isolation(txn: &Arc<Transaction>, mode: LockMode) -> LockResult<()> {
        use LockMode::*;
        match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(Self::abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(Self::abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadUncommitted => {
                if !matches!(mode, IntentionExclusive | Exclusive) {
                    return Err(Self::abort_txn(
                        txn,
                        AbortReason::LockSharedOnReadUncommitted,
                    ));
                }
                if txn.state() != TransactionState::Growing {
                    return Err(Self::abort_txn(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// 2PL transition on unlock: releasing X always starts SHRINKING;
    /// releasing S does so only under Repeatable Read.
    fn apply_unlock_transition(txn: &Arc<Transaction>, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                if txn.isolation_level() == IsolationLevel::RepeatableRead
                    && txn.state() == TransactionState::Growing
                {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            LockMode::Exclusive => {
                if txn.state() == TransactionState::Growing {
                    txn.set_state(TransactionState::Shrinking);
                }
            }
            _ => {}
        }
    }

    fn abort_txn(txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbortError {
        txn.set_state(TransactionState::Aborted);
        TransactionAbortError {
            txn_id: txn.id(),
            reason,
        }
    }

    fn register(&self, txn: &Arc<Transaction>) {
        self.inner
            .txns
            .lock()
            .entry(txn.id())
            .or_insert_with(|| Arc::clone(txn));
    }

    /// Detection thread: rebuild the waits-for graph from every queue, abort
    /// the youngest transaction on each cycle, repeat until acyclic.
    fn run_cycle_detection(
        inner: Arc<LockManagerInner>,
        shutdown: Arc<AtomicBool>,
        interval: Duration,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            Self::sleep_interruptible(&shutdown, interval);
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            Self::detect_once(&inner);
        }
    }

    fn sleep_interruptible(shutdown: &AtomicBool, interval: Duration) {
        let slice = Duration::from_millis(10);
        let mut remaining = interval;
        while remaining > Duration::ZERO && !shutdown.load(Ordering::Relaxed) {
            let nap = remaining.min(slice);
            thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
    }

    fn detect_once(inner: &LockManagerInner) {
        let queues = inner.all_queues();

        let mut graph = WaitForGraph::new();
        for queue in &queues {
            let mut waiters = Vec::new();
            let mut holders = Vec::new();
            {
                let state = queue.state.lock();
                for request in &state.requests {
                    let alive = inner
                        .txn(request.txn_id)
                        .map(|t| t.state() != TransactionState::Aborted)
                        .unwrap_or(false);
                    if !alive {
                        continue;
                    }
                    if request.granted {
                        holders.push(request.txn_id);
                    } else {
                        waiters.push(request.txn_id);
                    }
                }
            }
            for &waiter in &waiters {
                for &holder in &holders {
                    graph.add_edge(waiter, holder);
                }
            }
        }

        while let Some(cycle) = graph.find_cycle() {
            let victim = *cycle.iter().max().unwrap();
            warn!("deadlock cycle {:?}, aborting youngest {}", cycle, victim);

            if let Some(txn) = inner.txn(victim) {
                txn.set_state(TransactionState::Aborted);
                Self::release_all_on(inner, &txn);
            }
            graph.remove_txn(victim);

            // Wake every waiter: victims unlink their own pending requests,
            // survivors re-check whether they can now be granted
            for queue in &queues {
                queue.cv.notify_all();
            }
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [IntentionShared, IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive];

        let expected = [
            // IS     IX     S      SIX    X
            [true, true, true, true, false],    // IS held
            [true, true, false, false, false],  // IX held
            [true, false, true, false, false],  // S held
            [true, false, false, false, false], // SIX held
            [false, false, false, false, false], // X held
        ];

        for (i, &held) in modes.iter().enumerate() {
            for (j, &requested) in modes.iter().enumerate() {
                assert_eq!(
                    held.compatible_with(requested),
                    expected[i][j],
                    "held={:?} requested={:?}",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_upgrade_paths() {
        use LockMode::*;

        assert!(LockMode::upgrade_allowed(IntentionShared, Shared));
        assert!(LockMode::upgrade_allowed(IntentionShared, IntentionExclusive));
        assert!(LockMode::upgrade_allowed(IntentionShared, SharedIntentionExclusive));
        assert!(LockMode::upgrade_allowed(IntentionShared, Exclusive));
        assert!(LockMode::upgrade_allowed(Shared, Exclusive));
        assert!(LockMode::upgrade_allowed(Shared, SharedIntentionExclusive));
        assert!(LockMode::upgrade_allowed(IntentionExclusive, Exclusive));
        assert!(LockMode::upgrade_allowed(IntentionExclusive, SharedIntentionExclusive));
        assert!(LockMode::upgrade_allowed(SharedIntentionExclusive, Exclusive));

        assert!(!LockMode::upgrade_allowed(Shared, IntentionShared));
        assert!(!LockMode::upgrade_allowed(Shared, IntentionExclusive));
        assert!(!LockMode::upgrade_allowed(Exclusive, Shared));
        assert!(!LockMode::upgrade_allowed(SharedIntentionExclusive, Shared));
    }
}
