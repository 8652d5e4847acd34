//! Integration tests for the buffer pool manager

use std::sync::Arc;
use std::thread;

use stratum::buffer::BufferPoolManager;
use stratum::common::{StratumError, PAGE_SIZE};
use stratum::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (BufferPoolManager, Arc<DiskManager>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = BufferPoolManager::new(pool_size, 2, Arc::clone(&dm));
    (bpm, dm, temp_file)
}

#[test]
fn test_buffer_pool_basic_operations() {
    let (bpm, _dm, _temp) = create_bpm(10);

    let page_id = bpm.new_page().unwrap().page_id();

    {
        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        guard.data_mut()[0] = 0xDE;
        guard.data_mut()[1] = 0xAD;
        guard.data_mut()[2] = 0xBE;
        guard.data_mut()[3] = 0xEF;
    }

    {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 0xDE);
        assert_eq!(guard.data()[1], 0xAD);
        assert_eq!(guard.data()[2], 0xBE);
        assert_eq!(guard.data()[3], 0xEF);
    }
}

#[test]
fn test_buffer_pool_new_page_starts_pinned() {
    let (bpm, _dm, _temp) = create_bpm(10);

    let guard = bpm.new_page().unwrap();
    let page_id = guard.page_id();

    // The allocation guard owns the pin; the frame is not an eviction
    // candidate until it is dropped.
    assert_eq!(bpm.get_pin_count(page_id), Some(1));
    drop(guard);
    assert_eq!(bpm.get_pin_count(page_id), Some(0));
}

#[test]
fn test_buffer_pool_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_id;
    let test_data = b"Persistence test data";

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        page_id = bpm.new_page().unwrap().page_id();

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[..test_data.len()].copy_from_slice(test_data);
        }

        bpm.flush_page(page_id).unwrap();
    }

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..test_data.len()], test_data);
    }
}

#[test]
fn test_buffer_pool_eviction_writes_back_dirty_page() {
    // Pool of 3: fetching a 4th page must evict one and write it back
    let (bpm, dm, _temp) = create_bpm(3);

    let first = bpm.new_page().unwrap().page_id();
    let second = bpm.new_page().unwrap().page_id();
    let third = bpm.new_page().unwrap().page_id();

    {
        let mut guard = bpm.fetch_page_write(first).unwrap();
        guard.data_mut()[0] = 99;
        guard.data_mut()[PAGE_SIZE - 1] = 42;
    }
    {
        let _g2 = bpm.fetch_page_read(second).unwrap();
        let _g3 = bpm.fetch_page_read(third).unwrap();
    }

    // `first` has the largest backward k-distance, so this evicts it
    let fourth = bpm.new_page().unwrap();
    assert_eq!(bpm.get_pin_count(first), None);

    // Its contents must have reached the disk on eviction
    let mut data = [0u8; PAGE_SIZE];
    dm.read_page(first, &mut data).unwrap();
    assert_eq!(data[0], 99);
    assert_eq!(data[PAGE_SIZE - 1], 42);

    drop(fourth);

    // Refetching reads the written contents back through the pool
    let guard = bpm.fetch_page_read(first).unwrap();
    assert_eq!(guard.data()[0], 99);
}

#[test]
fn test_buffer_pool_pin_prevents_eviction() {
    let (bpm, _dm, _temp) = create_bpm(2);

    // Both allocation guards stay alive, so both frames stay pinned
    let _guard1 = bpm.new_page().unwrap();
    let _guard2 = bpm.new_page().unwrap();

    let result = bpm.new_page();
    assert!(matches!(result, Err(StratumError::BufferPoolFull)));
}

#[test]
fn test_buffer_pool_delete_page() {
    let (bpm, _dm, _temp) = create_bpm(10);

    let pid = bpm.new_page().unwrap().page_id();

    {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        guard.data_mut()[0] = 42;
    }

    assert!(bpm.delete_page(pid).unwrap());
    assert_eq!(bpm.get_pin_count(pid), None);
}

#[test]
fn test_buffer_pool_cannot_delete_pinned_page() {
    let (bpm, _dm, _temp) = create_bpm(10);

    let guard = bpm.new_page().unwrap();

    // The allocation pin alone blocks deletion
    let result = bpm.delete_page(guard.page_id());
    assert!(matches!(result, Err(StratumError::PageStillPinned(_))));
}

#[test]
fn test_buffer_pool_flush_all() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_ids;

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        page_ids = (0..5)
            .map(|i| {
                let pid = bpm.new_page().unwrap().page_id();
                {
                    let mut guard = bpm.fetch_page_write(pid).unwrap();
                    guard.data_mut()[0] = i as u8;
                }
                pid
            })
            .collect::<Vec<_>>();

        bpm.flush_all_pages().unwrap();
    }

    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, 2, dm);

        for (i, &pid) in page_ids.iter().enumerate() {
            let guard = bpm.fetch_page_read(pid).unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }
}

#[test]
fn test_buffer_pool_guard_latching() {
    let (bpm, _dm, _temp) = create_bpm(10);
    let bpm = Arc::new(bpm);

    let page_id = bpm.new_page().unwrap().page_id();
    {
        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        guard.data_mut()[0] = 1;
    }

    // A writer excludes a reader until dropped
    let write_guard = bpm.fetch_page_write(page_id).unwrap();

    let bpm_clone = Arc::clone(&bpm);
    let (tx, rx) = std::sync::mpsc::channel();
    let reader = thread::spawn(move || {
        let guard = bpm_clone.fetch_page_read(page_id).unwrap();
        tx.send(guard.data()[0]).unwrap();
    });

    assert!(rx
        .recv_timeout(std::time::Duration::from_millis(100))
        .is_err());

    drop(write_guard);
    assert_eq!(
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(),
        1
    );
    reader.join().unwrap();
}

#[test]
fn test_buffer_pool_concurrent_access() {
    let (bpm, _dm, _temp) = create_bpm(10);
    let bpm = Arc::new(bpm);

    let page_id = bpm.new_page().unwrap().page_id();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                for _ in 0..100 {
                    let guard = bpm.fetch_page_read(page_id).unwrap();
                    let _ = guard.data()[0];
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(bpm.get_pin_count(page_id), Some(0));
}

#[test]
fn test_buffer_pool_concurrent_fetch_single_residency() {
    // Many threads fetching the same non-resident page must agree on one
    // frame; every pin taken must be released.
    let (bpm, _dm, _temp) = create_bpm(4);

    // Create a page and push it out of the pool
    let target = bpm.new_page().unwrap().page_id();
    {
        let mut guard = bpm.fetch_page_write(target).unwrap();
        guard.data_mut()[0] = 77;
    }
    for _ in 0..4 {
        let pid = bpm.new_page().unwrap().page_id();
        let _ = bpm.fetch_page_read(pid).unwrap();
    }
    assert_eq!(bpm.get_pin_count(target), None);

    let bpm = Arc::new(bpm);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                for _ in 0..50 {
                    let guard = bpm.fetch_page_read(target).unwrap();
                    assert_eq!(guard.data()[0], 77);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(bpm.get_pin_count(target), Some(0));
}

#[test]
fn test_buffer_pool_large_workload() {
    let (bpm, _dm, _temp) = create_bpm(5); // Small pool to force evictions

    let page_ids: Vec<_> = (0..20)
        .map(|_| bpm.new_page().unwrap().page_id())
        .collect();

    for &pid in &page_ids {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        let id_bytes = pid.as_u32().to_le_bytes();
        guard.data_mut()[..4].copy_from_slice(&id_bytes);
    }

    for &pid in &page_ids {
        let guard = bpm.fetch_page_read(pid).unwrap();
        let id_bytes: [u8; 4] = guard.data()[..4].try_into().unwrap();
        assert_eq!(u32::from_le_bytes(id_bytes), pid.as_u32());
    }
}
