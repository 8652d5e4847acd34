use std::cmp::Ordering;
use std::sync::Arc;

use log::warn;

use crate::buffer::{BufferPoolManager, ReadPageGuard, WritePageGuard};
use crate::common::{PageId, RecordId, Result, StratumError, INVALID_PAGE_ID, PAGE_SIZE};

use super::btree_page::{
    BTreeNode, BTreeNodeRef, HeaderPageMut, HeaderPageRef, CHILD_SIZE, NODE_HEADER_SIZE, RID_SIZE,
};
use super::btree_iterator::BPlusTreeIterator;
use super::key_comparator::KeyComparator;

/// Latch held on the parent while crabbing down during the optimistic
/// insert pass. Held purely for its release-on-drop effect.
enum ParentLatch {
    Header { _guard: WritePageGuard },
    Node { _guard: ReadPageGuard },
}

/// A concurrent B+ tree index mapping fixed-width keys to record ids.
///
/// A dedicated header page stores the current root page id, so the root can
/// move without re-registering the index anywhere. All entries live in leaf
/// pages, which are chained left to right for range scans. Concurrent
/// operations latch-crab root to leaf: searches hand over read latches,
/// inserts try a read-latched descent first and fall back to a write-latched
/// one when the leaf must split, removes descend with write latches. A node
/// that cannot split (or underflow) releases every ancestor latch above it.
pub struct BPlusTree {
    header_page_id: PageId,
    bpm: Arc<BufferPoolManager>,
    comparator: Arc<dyn KeyComparator>,
    key_size: usize,
    leaf_max_size: u16,
    internal_max_size: u16,
}

impl BPlusTree {
    /// Creates a new empty tree, allocating its header page.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        key_size: usize,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Result<Self> {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3, "node capacity too small");
        assert!(
            NODE_HEADER_SIZE + leaf_max_size as usize * (key_size + RID_SIZE) <= PAGE_SIZE,
            "leaf_max_size does not fit in a page"
        );
        // One slot of headroom: merging two minimally filled internal nodes
        // can briefly leave max_size + 1 entries in the survivor.
        assert!(
            NODE_HEADER_SIZE + (internal_max_size as usize + 1) * (key_size + CHILD_SIZE)
                <= PAGE_SIZE,
            "internal_max_size does not fit in a page"
        );

        let header_pin = bpm.new_page()?;
        let header_page_id = header_pin.page_id();
        {
            let mut guard = bpm.fetch_page_write(header_page_id)?;
            HeaderPageMut::new(guard.data_mut()).set_root_page_id(INVALID_PAGE_ID);
        }
        drop(header_pin);

        Ok(Self {
            header_page_id,
            bpm,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
        })
    }

    /// Opens an existing tree given its header page.
    pub fn open(
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: Arc<dyn KeyComparator>,
        key_size: usize,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> Self {
        Self {
            header_page_id,
            bpm,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
        }
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Returns the current root page id, or INVALID_PAGE_ID for an empty tree.
    pub fn root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderPageRef::new(guard.data()).root_page_id())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.root_page_id()? == INVALID_PAGE_ID)
    }

    /// Point lookup. Crabs read latches from the header down to the leaf.
    pub fn get_value(&self, key: &[u8]) -> Result<Option<RecordId>> {
        assert_eq!(key.len(), self.key_size);

        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data(), self.key_size);
                if node.is_leaf() {
                    return Ok(node
                        .leaf_find(key, &*self.comparator)
                        .map(|pos| node.rid_at(pos)));
                }
                node.child_at(node.child_index_for(key, &*self.comparator))
            };

            // Hand over: latch the child before releasing the parent
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            guard = child_guard;
        }
    }

    /// Inserts a unique key. Returns false if the key already exists.
    ///
    /// Tries an optimistic descent first (read latches, write latch only on
    /// the leaf); if the leaf is full, all latches are released and the
    /// insert restarts pessimistically with a write-latched path.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> Result<bool> {
        assert_eq!(key.len(), self.key_size);

        if let Some(inserted) = self.insert_optimistic(key, rid)? {
            return Ok(inserted);
        }
        self.insert_pessimistic(key, rid)
    }

    /// Optimistic insert pass. Returns None when the leaf is full and the
    /// caller must retry with the pessimistic pass.
    fn insert_optimistic(&self, key: &[u8], rid: RecordId) -> Result<Option<bool>> {
        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();

        if root_id == INVALID_PAGE_ID {
            self.start_new_tree(&mut header_guard, key, rid)?;
            return Ok(Some(true));
        }

        let mut parent = ParentLatch::Header {
            _guard: header_guard,
        };
        let mut cur_id = root_id;

        loop {
            let cur_guard = self.bpm.fetch_page_read(cur_id)?;
            let child_id = {
                let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                if node.is_leaf() {
                    None
                } else {
                    Some(node.child_at(node.child_index_for(key, &*self.comparator)))
                }
            };

            match child_id {
                Some(child_id) => {
                    // Release the grandparent, keep this node as the parent
                    parent = ParentLatch::Node { _guard: cur_guard };
                    cur_id = child_id;
                }
                None => {
                    // Promote the leaf to a write latch via a retry while the
                    // parent read latch blocks structural changes beneath it.
                    drop(cur_guard);
                    let mut leaf_guard = self.bpm.fetch_page_write(cur_id)?;
                    drop(parent);

                    let (pos, duplicate, full) = {
                        let node = BTreeNodeRef::new(leaf_guard.data(), self.key_size);
                        let pos = node.leaf_lower_bound(key, &*self.comparator);
                        let duplicate = pos < node.size()
                            && self.comparator.compare(node.key_at(pos), key) == Ordering::Equal;
                        (pos, duplicate, node.size() >= self.leaf_max_size as usize)
                    };

                    if duplicate {
                        return Ok(Some(false));
                    }
                    if full {
                        return Ok(None);
                    }

                    let mut node = BTreeNode::new(leaf_guard.data_mut(), self.key_size);
                    node.leaf_insert_at(pos, key, rid);
                    return Ok(Some(true));
                }
            }
        }
    }

    /// Pessimistic insert pass: write latches from the header down, keeping
    /// ancestors only while a split can still propagate into them.
    fn insert_pessimistic(&self, key: &[u8], rid: RecordId) -> Result<bool> {
        let mut ctx: Vec<WritePageGuard> = Vec::new();

        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();

        if root_id == INVALID_PAGE_ID {
            self.start_new_tree(&mut header_guard, key, rid)?;
            return Ok(true);
        }

        ctx.push(header_guard);
        let mut cur_guard = self.bpm.fetch_page_write(root_id)?;

        loop {
            let (is_leaf, child_id, safe) = {
                let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                let max = if node.is_leaf() {
                    self.leaf_max_size
                } else {
                    self.internal_max_size
                } as usize;
                let safe = node.size() < max;
                if node.is_leaf() {
                    (true, INVALID_PAGE_ID, safe)
                } else {
                    (
                        false,
                        node.child_at(node.child_index_for(key, &*self.comparator)),
                        safe,
                    )
                }
            };

            // A node with room absorbs any split from below; release ancestors
            if safe {
                ctx.clear();
            }
            if is_leaf {
                break;
            }

            let child_guard = self.bpm.fetch_page_write(child_id)?;
            ctx.push(cur_guard);
            cur_guard = child_guard;
        }

        // cur_guard is the write-latched leaf
        let (pos, duplicate) = {
            let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
            let pos = node.leaf_lower_bound(key, &*self.comparator);
            let duplicate = pos < node.size()
                && self.comparator.compare(node.key_at(pos), key) == Ordering::Equal;
            (pos, duplicate)
        };

        if duplicate {
            return Ok(false);
        }

        if BTreeNodeRef::new(cur_guard.data(), self.key_size).size()
            < self.leaf_max_size as usize
        {
            let mut node = BTreeNode::new(cur_guard.data_mut(), self.key_size);
            node.leaf_insert_at(pos, key, rid);
            return Ok(true);
        }

        // Split the leaf: partition max_size + 1 entries, right half >= left
        let mut entries: Vec<(Vec<u8>, RecordId)> = {
            let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
            (0..node.size())
                .map(|i| (node.key_at(i).to_vec(), node.rid_at(i)))
                .collect()
        };
        entries.insert(pos, (key.to_vec(), rid));

        let left_count = entries.len() / 2;
        let right_entries = entries.split_off(left_count);
        let separator = right_entries[0].0.clone();

        let right_pin = self.bpm.new_page()?;
        let right_id = right_pin.page_id();
        {
            let mut right_guard = self.bpm.fetch_page_write(right_id)?;
            drop(right_pin);
            let old_next = BTreeNodeRef::new(cur_guard.data(), self.key_size).next_page_id();
            let mut right = BTreeNode::new(right_guard.data_mut(), self.key_size);
            right.init_leaf(self.leaf_max_size);
            right.leaf_set_entries(&right_entries);
            right.set_next_page_id(old_next);
        }
        {
            let mut left = BTreeNode::new(cur_guard.data_mut(), self.key_size);
            left.leaf_set_entries(&entries);
            left.set_next_page_id(Some(right_id));
        }

        let left_pid = cur_guard.page_id();
        drop(cur_guard);

        self.propagate_split(ctx, left_pid, separator, right_id)?;
        Ok(true)
    }

    /// Pushes a separator up through the retained ancestor stack, splitting
    /// full internal nodes and growing a new root when the header is reached.
    fn propagate_split(
        &self,
        mut ctx: Vec<WritePageGuard>,
        mut left_pid: PageId,
        mut separator: Vec<u8>,
        mut right_pid: PageId,
    ) -> Result<()> {
        while let Some(mut parent_guard) = ctx.pop() {
            if parent_guard.page_id() == self.header_page_id {
                // The split reached the top: grow a new root
                let root_pin = self.bpm.new_page()?;
                let new_root_id = root_pin.page_id();
                {
                    let mut root_guard = self.bpm.fetch_page_write(new_root_id)?;
                    drop(root_pin);
                    let mut root = BTreeNode::new(root_guard.data_mut(), self.key_size);
                    root.init_internal(self.internal_max_size);
                    root.internal_set_entries(&[
                        (vec![0u8; self.key_size], left_pid),
                        (separator, right_pid),
                    ]);
                }
                HeaderPageMut::new(parent_guard.data_mut()).set_root_page_id(new_root_id);
                return Ok(());
            }

            let (pos, size) = {
                let node = BTreeNodeRef::new(parent_guard.data(), self.key_size);
                let pos = node
                    .child_position(left_pid)
                    .expect("split child not found in parent");
                (pos, node.size())
            };

            if size < self.internal_max_size as usize {
                let mut node = BTreeNode::new(parent_guard.data_mut(), self.key_size);
                node.internal_insert_at(pos + 1, &separator, right_pid);
                return Ok(());
            }

            // Parent is full too: split it and keep propagating
            let mut entries: Vec<(Vec<u8>, PageId)> = {
                let node = BTreeNodeRef::new(parent_guard.data(), self.key_size);
                (0..size)
                    .map(|i| (node.key_at(i).to_vec(), node.child_at(i)))
                    .collect()
            };
            entries.insert(pos + 1, (separator, right_pid));

            // Left keeps max/2 + 1 children; the middle key migrates up
            let left_count = self.internal_max_size as usize / 2 + 1;
            let right_entries = entries.split_off(left_count);
            let promoted = right_entries[0].0.clone();

            let new_pin = self.bpm.new_page()?;
            let new_right_id = new_pin.page_id();
            {
                let mut new_guard = self.bpm.fetch_page_write(new_right_id)?;
                drop(new_pin);
                let mut node = BTreeNode::new(new_guard.data_mut(), self.key_size);
                node.init_internal(self.internal_max_size);
                node.internal_set_entries(&right_entries);
            }
            {
                let mut node = BTreeNode::new(parent_guard.data_mut(), self.key_size);
                node.internal_set_entries(&entries);
            }

            left_pid = parent_guard.page_id();
            separator = promoted;
            right_pid = new_right_id;
        }

        unreachable!("split propagated past the retained ancestor stack");
    }

    /// Creates the first leaf and points the header at it.
    fn start_new_tree(
        &self,
        header_guard: &mut WritePageGuard,
        key: &[u8],
        rid: RecordId,
    ) -> Result<()> {
        let root_pin = self.bpm.new_page()?;
        let root_id = root_pin.page_id();
        {
            let mut root_guard = self.bpm.fetch_page_write(root_id)?;
            drop(root_pin);
            let mut node = BTreeNode::new(root_guard.data_mut(), self.key_size);
            node.init_leaf(self.leaf_max_size);
            node.leaf_insert_at(0, key, rid);
        }
        HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(root_id);
        Ok(())
    }

    /// Removes a key. Returns false if the key is not present.
    ///
    /// Descends with write latches; an underfull node first borrows from the
    /// right sibling, then the left, and otherwise merges (right preferred),
    /// propagating parent underflow upward. The root collapses when an
    /// internal root is left with a single child or a leaf root empties.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        assert_eq!(key.len(), self.key_size);

        let mut ctx: Vec<WritePageGuard> = Vec::new();

        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        ctx.push(header_guard);
        let mut cur_guard = self.bpm.fetch_page_write(root_id)?;

        loop {
            let parent_is_header = ctx
                .last()
                .map(|g| g.page_id() == self.header_page_id)
                .unwrap_or(false);

            let (is_leaf, child_id, safe) = {
                let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                let safe = if parent_is_header {
                    // Root rules: a leaf root tolerates any delete that keeps
                    // it non-empty; an internal root needs three children so a
                    // child merge cannot collapse it.
                    if node.is_leaf() {
                        node.size() > 1
                    } else {
                        node.size() > 2
                    }
                } else {
                    node.size() > node.min_size()
                };
                if node.is_leaf() {
                    (true, INVALID_PAGE_ID, safe)
                } else {
                    (
                        false,
                        node.child_at(node.child_index_for(key, &*self.comparator)),
                        safe,
                    )
                }
            };

            if safe {
                ctx.clear();
            }
            if is_leaf {
                break;
            }

            let child_guard = self.bpm.fetch_page_write(child_id)?;
            ctx.push(cur_guard);
            cur_guard = child_guard;
        }

        // Delete from the write-latched leaf
        let pos = {
            let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
            match node.leaf_find(key, &*self.comparator) {
                Some(pos) => pos,
                None => return Ok(false),
            }
        };
        BTreeNode::new(cur_guard.data_mut(), self.key_size).leaf_remove_at(pos);

        self.rebalance_after_remove(ctx, cur_guard)?;
        Ok(true)
    }

    /// Walks the retained ancestor stack fixing underflow, starting from the
    /// leaf that just lost an entry.
    fn rebalance_after_remove(
        &self,
        mut ctx: Vec<WritePageGuard>,
        mut cur_guard: WritePageGuard,
    ) -> Result<()> {
        loop {
            if ctx.is_empty() {
                // The node was safe at descent time; nothing can underflow
                return Ok(());
            }

            let parent_is_header = ctx
                .last()
                .map(|g| g.page_id() == self.header_page_id)
                .unwrap_or(false);

            if parent_is_header {
                let (is_leaf, size, only_child) = {
                    let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                    let only_child = if node.is_internal() && node.size() == 1 {
                        Some(node.child_at(0))
                    } else {
                        None
                    };
                    (node.is_leaf(), node.size(), only_child)
                };

                let mut header_guard = ctx.pop().unwrap();
                if let Some(child) = only_child {
                    // Height shrinks: the single child becomes the root
                    HeaderPageMut::new(header_guard.data_mut()).set_root_page_id(child);
                    self.discard_page(cur_guard)?;
                } else if is_leaf && size == 0 {
                    HeaderPageMut::new(header_guard.data_mut())
                        .set_root_page_id(INVALID_PAGE_ID);
                    self.discard_page(cur_guard)?;
                }
                return Ok(());
            }

            let (size, min) = {
                let node = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                (node.size(), node.min_size())
            };
            if size >= min {
                return Ok(());
            }

            let mut parent_guard = ctx.pop().unwrap();
            let cur_pid = cur_guard.page_id();
            let (idx, parent_size) = {
                let parent = BTreeNodeRef::new(parent_guard.data(), self.key_size);
                let idx = parent
                    .child_position(cur_pid)
                    .expect("underfull child not found in parent");
                (idx, parent.size())
            };

            // 1. Borrow from the right sibling
            if idx + 1 < parent_size {
                let right_id =
                    BTreeNodeRef::new(parent_guard.data(), self.key_size).child_at(idx + 1);
                let mut right_guard = self.bpm.fetch_page_write(right_id)?;
                let right_size = BTreeNodeRef::new(right_guard.data(), self.key_size).size();
                let right_min = BTreeNodeRef::new(right_guard.data(), self.key_size).min_size();

                if right_size > right_min {
                    self.borrow_from_right(&mut cur_guard, &mut right_guard, &mut parent_guard, idx);
                    return Ok(());
                }

                // 3. Right merge preferred when no sibling can lend
                if idx == 0
                    || !self.try_borrow_from_left(&mut cur_guard, &mut parent_guard, idx)?
                {
                    self.merge_right(&mut cur_guard, right_guard, &mut parent_guard, idx)?;
                    cur_guard = parent_guard;
                    continue;
                }
                return Ok(());
            }

            // 2. Borrow from the left sibling
            if self.try_borrow_from_left(&mut cur_guard, &mut parent_guard, idx)? {
                return Ok(());
            }

            // 3. Merge into the left sibling
            let left_id = BTreeNodeRef::new(parent_guard.data(), self.key_size).child_at(idx - 1);
            let left_guard = self.bpm.fetch_page_write(left_id)?;
            self.merge_left(left_guard, cur_guard, &mut parent_guard, idx)?;
            cur_guard = parent_guard;
        }
    }

    /// Moves the right sibling's first entry into `cur` and refreshes the
    /// parent separator.
    fn borrow_from_right(
        &self,
        cur_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
        parent_guard: &mut WritePageGuard,
        idx: usize,
    ) {
        let is_leaf = BTreeNodeRef::new(cur_guard.data(), self.key_size).is_leaf();

        if is_leaf {
            let (moved_key, moved_rid, new_separator) = {
                let right = BTreeNodeRef::new(right_guard.data(), self.key_size);
                (
                    right.key_at(0).to_vec(),
                    right.rid_at(0),
                    right.key_at(1).to_vec(),
                )
            };

            let cur_size = BTreeNodeRef::new(cur_guard.data(), self.key_size).size();
            BTreeNode::new(cur_guard.data_mut(), self.key_size)
                .leaf_insert_at(cur_size, &moved_key, moved_rid);
            BTreeNode::new(right_guard.data_mut(), self.key_size).leaf_remove_at(0);
            BTreeNode::new(parent_guard.data_mut(), self.key_size)
                .set_key_at(idx + 1, &new_separator);
        } else {
            // The parent separator rotates down; the right sibling's first
            // child crosses over with it.
            let (separator_down, moved_child, new_separator) = {
                let parent = BTreeNodeRef::new(parent_guard.data(), self.key_size);
                let right = BTreeNodeRef::new(right_guard.data(), self.key_size);
                (
                    parent.key_at(idx + 1).to_vec(),
                    right.child_at(0),
                    right.key_at(1).to_vec(),
                )
            };

            let cur_size = BTreeNodeRef::new(cur_guard.data(), self.key_size).size();
            BTreeNode::new(cur_guard.data_mut(), self.key_size)
                .internal_insert_at(cur_size, &separator_down, moved_child);
            BTreeNode::new(right_guard.data_mut(), self.key_size).internal_remove_at(0);
            BTreeNode::new(parent_guard.data_mut(), self.key_size)
                .set_key_at(idx + 1, &new_separator);
        }
    }

    /// Tries to borrow the left sibling's last entry. Returns false if the
    /// left sibling cannot lend (or there is no left sibling).
    fn try_borrow_from_left(
        &self,
        cur_guard: &mut WritePageGuard,
        parent_guard: &mut WritePageGuard,
        idx: usize,
    ) -> Result<bool> {
        if idx == 0 {
            return Ok(false);
        }

        let left_id = BTreeNodeRef::new(parent_guard.data(), self.key_size).child_at(idx - 1);
        let mut left_guard = self.bpm.fetch_page_write(left_id)?;

        let (left_size, left_min) = {
            let left = BTreeNodeRef::new(left_guard.data(), self.key_size);
            (left.size(), left.min_size())
        };
        if left_size <= left_min {
            return Ok(false);
        }

        let is_leaf = BTreeNodeRef::new(cur_guard.data(), self.key_size).is_leaf();

        if is_leaf {
            let (moved_key, moved_rid) = {
                let left = BTreeNodeRef::new(left_guard.data(), self.key_size);
                (left.key_at(left_size - 1).to_vec(), left.rid_at(left_size - 1))
            };

            BTreeNode::new(left_guard.data_mut(), self.key_size).leaf_remove_at(left_size - 1);
            BTreeNode::new(cur_guard.data_mut(), self.key_size)
                .leaf_insert_at(0, &moved_key, moved_rid);
            BTreeNode::new(parent_guard.data_mut(), self.key_size).set_key_at(idx, &moved_key);
        } else {
            let (separator_down, moved_key, moved_child) = {
                let parent = BTreeNodeRef::new(parent_guard.data(), self.key_size);
                let left = BTreeNodeRef::new(left_guard.data(), self.key_size);
                (
                    parent.key_at(idx).to_vec(),
                    left.key_at(left_size - 1).to_vec(),
                    left.child_at(left_size - 1),
                )
            };

            BTreeNode::new(left_guard.data_mut(), self.key_size).set_size(left_size - 1);
            {
                // Shift cur right by one: the old slot 0 child moves to slot 1
                // under the separator that rotates down from the parent.
                let mut cur = BTreeNode::new(cur_guard.data_mut(), self.key_size);
                cur.internal_insert_at(0, &separator_down, moved_child);
                cur.set_key_at(1, &separator_down);
            }
            BTreeNode::new(parent_guard.data_mut(), self.key_size).set_key_at(idx, &moved_key);
        }

        Ok(true)
    }

    /// Merges the right sibling into `cur` and removes its parent entry.
    fn merge_right(
        &self,
        cur_guard: &mut WritePageGuard,
        right_guard: WritePageGuard,
        parent_guard: &mut WritePageGuard,
        idx: usize,
    ) -> Result<()> {
        let is_leaf = BTreeNodeRef::new(cur_guard.data(), self.key_size).is_leaf();

        if is_leaf {
            let (entries, right_next): (Vec<(Vec<u8>, RecordId)>, Option<PageId>) = {
                let right = BTreeNodeRef::new(right_guard.data(), self.key_size);
                (
                    (0..right.size())
                        .map(|i| (right.key_at(i).to_vec(), right.rid_at(i)))
                        .collect(),
                    right.next_page_id(),
                )
            };

            let cur_size = BTreeNodeRef::new(cur_guard.data(), self.key_size).size();
            let mut cur = BTreeNode::new(cur_guard.data_mut(), self.key_size);
            for (i, (key, rid)) in entries.iter().enumerate() {
                cur.leaf_insert_at(cur_size + i, key, *rid);
            }
            cur.set_next_page_id(right_next);
        } else {
            let separator = BTreeNodeRef::new(parent_guard.data(), self.key_size)
                .key_at(idx + 1)
                .to_vec();
            let entries: Vec<(Vec<u8>, PageId)> = {
                let right = BTreeNodeRef::new(right_guard.data(), self.key_size);
                (0..right.size())
                    .map(|i| (right.key_at(i).to_vec(), right.child_at(i)))
                    .collect()
            };

            let cur_size = BTreeNodeRef::new(cur_guard.data(), self.key_size).size();
            let mut cur = BTreeNode::new(cur_guard.data_mut(), self.key_size);
            // The separator becomes the key over the right node's slot 0 child
            cur.internal_insert_at(cur_size, &separator, entries[0].1);
            for (i, (key, child)) in entries.iter().enumerate().skip(1) {
                cur.internal_insert_at(cur_size + i, key, *child);
            }
        }

        BTreeNode::new(parent_guard.data_mut(), self.key_size).internal_remove_at(idx + 1);

        self.discard_page(right_guard)?;
        Ok(())
    }

    /// Merges `cur` into the left sibling and removes cur's parent entry.
    fn merge_left(
        &self,
        mut left_guard: WritePageGuard,
        cur_guard: WritePageGuard,
        parent_guard: &mut WritePageGuard,
        idx: usize,
    ) -> Result<()> {
        let is_leaf = BTreeNodeRef::new(cur_guard.data(), self.key_size).is_leaf();

        if is_leaf {
            let (entries, cur_next): (Vec<(Vec<u8>, RecordId)>, Option<PageId>) = {
                let cur = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                (
                    (0..cur.size())
                        .map(|i| (cur.key_at(i).to_vec(), cur.rid_at(i)))
                        .collect(),
                    cur.next_page_id(),
                )
            };

            let left_size = BTreeNodeRef::new(left_guard.data(), self.key_size).size();
            let mut left = BTreeNode::new(left_guard.data_mut(), self.key_size);
            for (i, (key, rid)) in entries.iter().enumerate() {
                left.leaf_insert_at(left_size + i, key, *rid);
            }
            left.set_next_page_id(cur_next);
        } else {
            let separator = BTreeNodeRef::new(parent_guard.data(), self.key_size)
                .key_at(idx)
                .to_vec();
            let entries: Vec<(Vec<u8>, PageId)> = {
                let cur = BTreeNodeRef::new(cur_guard.data(), self.key_size);
                (0..cur.size())
                    .map(|i| (cur.key_at(i).to_vec(), cur.child_at(i)))
                    .collect()
            };

            let left_size = BTreeNodeRef::new(left_guard.data(), self.key_size).size();
            let mut left = BTreeNode::new(left_guard.data_mut(), self.key_size);
            left.internal_insert_at(left_size, &separator, entries[0].1);
            for (i, (key, child)) in entries.iter().enumerate().skip(1) {
                left.internal_insert_at(left_size + i, key, *child);
            }
        }

        BTreeNode::new(parent_guard.data_mut(), self.key_size).internal_remove_at(idx);

        self.discard_page(cur_guard)?;
        Ok(())
    }

    /// Drops the guard and returns the page to the buffer pool. A page still
    /// pinned by an in-flight iterator is left orphaned rather than failing
    /// the structural operation.
    fn discard_page(&self, guard: WritePageGuard) -> Result<()> {
        let pid = guard.page_id();
        drop(guard);
        match self.bpm.delete_page(pid) {
            Ok(_) => Ok(()),
            Err(StratumError::PageStillPinned(_)) => {
                warn!("leaving merged page {} pinned by a concurrent reader", pid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<BPlusTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(self.end());
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data(), self.key_size);
                if node.is_leaf() {
                    return Ok(BPlusTreeIterator::new(
                        Arc::clone(&self.bpm),
                        self.key_size,
                        guard.page_id(),
                        0,
                    ));
                }
                node.child_at(0)
            };
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            guard = child_guard;
        }
    }

    /// Iterator positioned at the first entry >= key.
    pub fn begin_at(&self, key: &[u8]) -> Result<BPlusTreeIterator> {
        assert_eq!(key.len(), self.key_size);

        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_id = HeaderPageRef::new(header_guard.data()).root_page_id();
        if root_id == INVALID_PAGE_ID {
            return Ok(self.end());
        }

        let mut guard = self.bpm.fetch_page_read(root_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data(), self.key_size);
                if node.is_leaf() {
                    let pos = node.leaf_lower_bound(key, &*self.comparator);
                    return Ok(BPlusTreeIterator::new(
                        Arc::clone(&self.bpm),
                        self.key_size,
                        guard.page_id(),
                        pos,
                    ));
                }
                node.child_at(node.child_index_for(key, &*self.comparator))
            };
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            guard = child_guard;
        }
    }

    /// The end-of-scan sentinel iterator.
    pub fn end(&self) -> BPlusTreeIterator {
        BPlusTreeIterator::new(Arc::clone(&self.bpm), self.key_size, INVALID_PAGE_ID, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key_comparator::IntegerComparator;
    use crate::storage::disk::DiskManager;
    use tempfile::NamedTempFile;

    fn key(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }

    fn rid(v: u32) -> RecordId {
        RecordId::new(PageId::new(v), crate::common::SlotId::new(0))
    }

    fn create_tree(
        pool_size: usize,
        leaf_max: u16,
        internal_max: u16,
    ) -> (BPlusTree, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(pool_size, 2, dm));
        let tree = BPlusTree::new(bpm, Arc::new(IntegerComparator), 4, leaf_max, internal_max).unwrap();
        (tree, temp_file)
    }

    #[test]
    fn test_empty_tree() {
        let (tree, _temp) = create_tree(10, 4, 4);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.get_value(&key(1)).unwrap(), None);
        assert!(!tree.remove(&key(1)).unwrap());
    }

    #[test]
    fn test_insert_and_get() {
        let (tree, _temp) = create_tree(10, 4, 4);

        assert!(tree.insert(&key(10), rid(10)).unwrap());
        assert!(tree.insert(&key(20), rid(20)).unwrap());
        assert!(tree.insert(&key(5), rid(5)).unwrap());

        assert!(!tree.is_empty().unwrap());
        assert_eq!(tree.get_value(&key(10)).unwrap(), Some(rid(10)));
        assert_eq!(tree.get_value(&key(20)).unwrap(), Some(rid(20)));
        assert_eq!(tree.get_value(&key(5)).unwrap(), Some(rid(5)));
        assert_eq!(tree.get_value(&key(15)).unwrap(), None);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (tree, _temp) = create_tree(10, 4, 4);

        assert!(tree.insert(&key(7), rid(7)).unwrap());
        assert!(!tree.insert(&key(7), rid(8)).unwrap());
        assert_eq!(tree.get_value(&key(7)).unwrap(), Some(rid(7)));
    }

    #[test]
    fn test_insert_splits_and_finds_all() {
        let (tree, _temp) = create_tree(50, 4, 4);

        for v in 0..200u32 {
            assert!(tree.insert(&key(v), rid(v)).unwrap(), "insert {}", v);
        }
        for v in 0..200u32 {
            assert_eq!(tree.get_value(&key(v)).unwrap(), Some(rid(v)), "get {}", v);
        }
    }

    #[test]
    fn test_remove_all_leaves_empty_tree() {
        let (tree, _temp) = create_tree(50, 4, 4);

        for v in 0..50u32 {
            tree.insert(&key(v), rid(v)).unwrap();
        }
        for v in 0..50u32 {
            assert!(tree.remove(&key(v)).unwrap(), "remove {}", v);
            assert_eq!(tree.get_value(&key(v)).unwrap(), None);
        }
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn test_remove_missing_key() {
        let (tree, _temp) = create_tree(10, 4, 4);
        tree.insert(&key(1), rid(1)).unwrap();
        assert!(!tree.remove(&key(2)).unwrap());
        assert_eq!(tree.get_value(&key(1)).unwrap(), Some(rid(1)));
    }
}
