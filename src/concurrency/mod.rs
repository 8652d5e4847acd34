pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;
pub mod wait_for_graph;

pub use lock_manager::{LockManager, LockMode};
pub use transaction::{
    AbortReason, IndexWriteRecord, IsolationLevel, LockResult, TableWriteRecord, Transaction,
    TransactionAbortError, TransactionState, WriteOp,
};
pub use transaction_manager::TransactionManager;
pub use wait_for_graph::WaitForGraph;
