use std::collections::{HashMap, LinkedList};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::common::{FrameId, PageId, Result, StratumError, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::disk::{DiskManager, DiskScheduler};

use super::page_guard::ReleaseCallback;
use super::{FrameHeader, LruKReplacer, PageGuard, ReadPageGuard, WritePageGuard};

/// Internal state shared between the manager and its guards
struct BufferPoolState {
    /// The buffer pool frames
    frames: Vec<Arc<FrameHeader>>,
    /// Page table: maps page IDs to frame IDs
    page_table: Mutex<HashMap<PageId, FrameId>>,
    /// Free list: frames that are not currently bound to a page
    free_list: Mutex<LinkedList<FrameId>>,
    /// LRU-K replacer for eviction decisions
    replacer: LruKReplacer,
}

/// BufferPoolManager mediates page residency between disk and memory.
/// It owns a fixed number of frames and uses the LRU-K replacement policy
/// to choose victims when the free list runs dry. Access to resident pages
/// goes through scoped guards that pin the page for their lifetime.
pub struct BufferPoolManager {
    /// Number of frames in the buffer pool
    pool_size: usize,
    /// Shared state
    state: Arc<BufferPoolState>,
    /// Disk scheduler for I/O
    disk_scheduler: DiskScheduler,
}

impl BufferPoolManager {
    /// Creates a new BufferPoolManager with the given pool size, k value for
    /// LRU-K, and disk manager.
    pub fn new(pool_size: usize, k: usize, disk_manager: Arc<DiskManager>) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = LinkedList::new();

        for i in 0..pool_size {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(FrameHeader::new(frame_id)));
            free_list.push_back(frame_id);
        }

        let state = Arc::new(BufferPoolState {
            frames,
            page_table: Mutex::new(HashMap::new()),
            free_list: Mutex::new(free_list),
            replacer: LruKReplacer::new(k, pool_size),
        });

        Self {
            pool_size,
            state,
            disk_scheduler: DiskScheduler::new(disk_manager),
        }
    }

    /// Allocates a new page and installs it in a frame, pinned and
    /// non-evictable. The returned basic guard owns the unpin obligation, so
    /// the page cannot be recycled before the caller latches or releases it.
    pub fn new_page(&self) -> Result<PageGuard> {
        let mut page_table = self.state.page_table.lock();

        let frame_id = self.get_free_frame(&mut page_table)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let page_id = match self.disk_scheduler.disk_manager().allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.state.free_list.lock().push_back(frame_id);
                return Err(e);
            }
        };

        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();

        page_table.insert(page_id, frame_id);

        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Ok(PageGuard::new(
            page_id,
            Arc::clone(frame),
            self.release_callback(),
        ))
    }

    /// Fetches a page and returns a basic guard (pin only, no latch).
    pub fn fetch_page_basic(&self, page_id: PageId) -> Result<PageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);

        Ok(PageGuard::new(page_id, frame, self.release_callback()))
    }

    /// Fetches a page for read access. Blocks until the page's reader latch
    /// is available.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<ReadPageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);

        let guard = unsafe { ReadPageGuard::new(page_id, frame, self.release_callback()) };

        Ok(guard)
    }

    /// Fetches a page for write access. Blocks until the page's writer latch
    /// is available.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<WritePageGuard> {
        if page_id == INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }

        let frame_id = self.fetch_page(page_id)?;
        let frame = Arc::clone(&self.state.frames[frame_id.as_usize()]);

        let guard = unsafe { WritePageGuard::new(page_id, frame, self.release_callback()) };

        Ok(guard)
    }

    /// Deletes a page from the buffer pool and disk. Refuses while pinned.
    /// A page that is not resident is deallocated on disk and reported as
    /// deleted.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut page_table = self.state.page_table.lock();

        if let Some(frame_id) = page_table.remove(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];

            if frame.pin_count() > 0 {
                page_table.insert(page_id, frame_id);
                return Err(StratumError::PageStillPinned(page_id));
            }

            if let Err(e) = self.state.replacer.remove(frame_id) {
                page_table.insert(page_id, frame_id);
                return Err(e);
            }
            frame.reset();
            self.state.free_list.lock().push_back(frame_id);
        }

        self.disk_scheduler.disk_manager().deallocate_page(page_id)?;

        Ok(true)
    }

    /// Flushes a specific page to disk and clears its dirty flag.
    /// Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if page_id == INVALID_PAGE_ID {
            return Err(StratumError::InvalidPageId(page_id));
        }

        let page_table = self.state.page_table.lock();

        if let Some(&frame_id) = page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];

            let mut data = [0u8; PAGE_SIZE];
            frame.copy_to(&mut data);

            self.disk_scheduler.schedule_write_sync(page_id, &data)?;

            frame.set_dirty(false);

            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Flushes every dirty resident page to disk.
    pub fn flush_all_pages(&self) -> Result<()> {
        let page_table = self.state.page_table.lock();

        for (&page_id, &frame_id) in page_table.iter() {
            let frame = &self.state.frames[frame_id.as_usize()];

            if frame.is_dirty() {
                let mut data = [0u8; PAGE_SIZE];
                frame.copy_to(&mut data);

                self.disk_scheduler.schedule_write_sync(page_id, &data)?;
                frame.set_dirty(false);
            }
        }

        Ok(())
    }

    /// Returns the pin count for a page, or None if it is not resident.
    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let page_table = self.state.page_table.lock();

        page_table
            .get(&page_id)
            .map(|&frame_id| self.state.frames[frame_id.as_usize()].pin_count())
    }

    /// Returns the pool size.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_frame_count(&self) -> usize {
        self.state.free_list.lock().len()
    }

    /// Builds the guard release callback: stick the dirty flag, unpin, and
    /// mark the frame evictable once the pin count reaches zero.
    fn release_callback(&self) -> ReleaseCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |page_id, is_dirty| {
            let page_table = state.page_table.lock();
            if let Some(&frame_id) = page_table.get(&page_id) {
                let frame = &state.frames[frame_id.as_usize()];
                if is_dirty {
                    frame.set_dirty(true);
                }
                if let Some(0) = frame.unpin() {
                    state.replacer.set_evictable(frame_id, true);
                }
            }
        })
    }

    /// Fetches a page into the buffer pool and returns its frame ID with the
    /// pin count already bumped. The page table latch is held across the
    /// whole miss path (residency check, frame allocation, disk read and
    /// mapping install), so two fetchers of the same page cannot both miss
    /// and load it into distinct frames.
    fn fetch_page(&self, page_id: PageId) -> Result<FrameId> {
        let mut page_table = self.state.page_table.lock();

        if let Some(&frame_id) = page_table.get(&page_id) {
            let frame = &self.state.frames[frame_id.as_usize()];
            frame.pin();
            self.state.replacer.record_access(frame_id);
            self.state.replacer.set_evictable(frame_id, false);
            return Ok(frame_id);
        }

        let frame_id = self.get_free_frame(&mut page_table)?;
        let frame = &self.state.frames[frame_id.as_usize()];

        let mut data = [0u8; PAGE_SIZE];
        if let Err(e) = self.disk_scheduler.schedule_read_sync(page_id, &mut data) {
            self.state.free_list.lock().push_back(frame_id);
            return Err(e);
        }

        frame.set_page_id(page_id);
        frame.copy_from(&data);
        frame.set_dirty(false);
        frame.pin();

        page_table.insert(page_id, frame_id);

        self.state.replacer.record_access(frame_id);
        self.state.replacer.set_evictable(frame_id, false);

        Ok(frame_id)
    }

    /// Gets a free frame, either from the free list or by evicting a page.
    /// The caller holds the page table latch; a dirty victim is written back
    /// under it, across victim selection and frame reset, so a concurrent
    /// fetch can neither resurrect the dying mapping nor read the page from
    /// disk before the write-back lands.
    fn get_free_frame(&self, page_table: &mut HashMap<PageId, FrameId>) -> Result<FrameId> {
        {
            let mut free_list = self.state.free_list.lock();
            if let Some(frame_id) = free_list.pop_front() {
                return Ok(frame_id);
            }
        }

        if let Some(frame_id) = self.state.replacer.evict() {
            let frame = &self.state.frames[frame_id.as_usize()];
            let old_page_id = frame.page_id();
            page_table.remove(&old_page_id);

            if frame.is_dirty() {
                debug!("evicting dirty page {}, writing back", old_page_id);
                let mut data = [0u8; PAGE_SIZE];
                frame.copy_to(&mut data);
                self.disk_scheduler.schedule_write_sync(old_page_id, &data)?;
            }

            frame.reset();

            Ok(frame_id)
        } else {
            Err(StratumError::BufferPoolFull)
        }
    }
}
