use std::sync::Arc;

use stratum::buffer::BufferPoolManager;
use stratum::common::{PageId, RecordId, SlotId};
use stratum::concurrency::{IsolationLevel, LockManager, LockMode, TransactionManager};
use stratum::index::{BPlusTree, IntegerComparator};
use stratum::storage::disk::DiskManager;

fn main() {
    env_logger::init();

    println!("Stratum - storage and concurrency core of a disk-oriented RDBMS");
    println!("================================================================\n");

    let db_path = "demo.db";

    let disk_manager = Arc::new(DiskManager::new(db_path).expect("Failed to create disk manager"));
    println!("Created disk manager for: {}", db_path);

    let bpm = Arc::new(BufferPoolManager::new(16, 2, disk_manager));
    println!("Created buffer pool manager with 16 frames\n");

    // Build a small index over u32 keys
    let tree = BPlusTree::new(Arc::clone(&bpm), Arc::new(IntegerComparator), 4, 4, 4)
        .expect("Failed to create index");

    for v in [5u32, 10, 15, 20, 25] {
        let key = v.to_le_bytes();
        let rid = RecordId::new(PageId::new(v), SlotId::new(0));
        tree.insert(&key, rid).expect("Failed to insert");
        println!("Inserted key {}", v);
    }

    print!("\nForward scan:");
    let mut iter = tree.begin().expect("Failed to open iterator");
    while let Some((key, _rid)) = iter.next_entry().expect("Scan failed") {
        let v = u32::from_le_bytes(key[..4].try_into().unwrap());
        print!(" {}", v);
    }
    println!();

    // Drive a tiny two-phase-locking session
    let lock_manager = Arc::new(LockManager::new(std::time::Duration::from_millis(50)));
    let txn_manager = TransactionManager::new(Arc::clone(&lock_manager));

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let table = stratum::TableId::new(1);
    lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, table)
        .expect("Failed to lock table");
    lock_manager
        .lock_row(&txn, LockMode::Exclusive, table, RecordId::new(PageId::new(5), SlotId::new(0)))
        .expect("Failed to lock row");
    println!("\n{} locked table_1 (IX) and one row (X)", txn.id());

    txn_manager.commit(&txn);
    println!("{} committed", txn.id());

    bpm.flush_all_pages().expect("Failed to flush");
    std::fs::remove_file(db_path).ok();
    println!("\nDemo completed successfully!");
}
