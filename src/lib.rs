//! Stratum - the storage and concurrency core of a disk-oriented RDBMS
//!
//! This crate provides the lower half of a relational database engine:
//! durable page storage, an in-memory buffer pool, a concurrent ordered
//! index, and a two-phase-locking transaction layer. The query layers
//! (planner, executors, catalog, table heap) are external collaborators
//! that consume these components through their public interfaces.
//!
//! # Architecture
//!
//! - **Storage Layer** (`storage`): disk I/O
//!   - `DiskManager`: reads and writes fixed-size pages in the database file
//!   - `DiskScheduler`: background worker processing queued I/O requests
//!
//! - **Buffer Pool** (`buffer`): memory management for database pages
//!   - `BufferPoolManager`: page residency, pin counts, dirty write-back
//!   - `LruKReplacer`: LRU-K victim selection by backward k-distance
//!   - `FrameHeader`: per-frame metadata, data and reader-writer latch
//!   - `PageGuard`/`ReadPageGuard`/`WritePageGuard`: scoped pin + latch guards
//!
//! - **Index** (`index`): a concurrent B+ tree
//!   - `BPlusTree`: crab-latched point lookup, unique insert, delete
//!   - `BPlusTreeIterator`: forward scan over the leaf chain
//!   - `KeyComparator`: pluggable total order over fixed-width keys
//!
//! - **Concurrency** (`concurrency`): transactions and locking
//!   - `LockManager`: hierarchical table/row locks, upgrades, deadlock
//!     detection
//!   - `Transaction` / `TransactionManager`: 2PL lifecycle and rollback
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stratum::buffer::BufferPoolManager;
//! use stratum::index::{BPlusTree, IntegerComparator};
//! use stratum::storage::disk::DiskManager;
//! use stratum::common::{PageId, RecordId, SlotId};
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, 2, disk_manager));
//!
//! let tree = BPlusTree::new(bpm, Arc::new(IntegerComparator), 4, 32, 32).unwrap();
//! let key = 42u32.to_le_bytes();
//! tree.insert(&key, RecordId::new(PageId::new(7), SlotId::new(0))).unwrap();
//! assert!(tree.get_value(&key).unwrap().is_some());
//! ```

pub mod buffer;
pub mod common;
pub mod concurrency;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{PageId, RecordId, Result, SlotId, StratumError, TableId, TxnId};
