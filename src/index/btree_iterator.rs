use std::sync::Arc;

use crate::buffer::BufferPoolManager;
use crate::common::{PageId, RecordId, Result, INVALID_PAGE_ID};

use super::btree_page::BTreeNodeRef;

/// Forward iterator over a B+ tree's leaf chain.
///
/// Holds only a (leaf page id, slot index) cursor and re-fetches the leaf
/// through the buffer pool on each advance, so it pins no pages between
/// calls. Reaching the end of a leaf follows `next_page_id`; the invalid
/// page id is the end sentinel.
pub struct BPlusTreeIterator {
    bpm: Arc<BufferPoolManager>,
    key_size: usize,
    current_page_id: PageId,
    current_index: usize,
}

impl BPlusTreeIterator {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        key_size: usize,
        current_page_id: PageId,
        current_index: usize,
    ) -> Self {
        Self {
            bpm,
            key_size,
            current_page_id,
            current_index,
        }
    }

    /// True once the iterator has moved past the last entry.
    pub fn is_end(&self) -> bool {
        self.current_page_id == INVALID_PAGE_ID
    }

    /// Returns the entry under the cursor and advances, or None at the end.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, RecordId)>> {
        loop {
            if self.current_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }

            let next_page = {
                let guard = self.bpm.fetch_page_read(self.current_page_id)?;
                let node = BTreeNodeRef::new(guard.data(), self.key_size);

                if self.current_index < node.size() {
                    let entry = (
                        node.key_at(self.current_index).to_vec(),
                        node.rid_at(self.current_index),
                    );
                    self.current_index += 1;
                    return Ok(Some(entry));
                }

                node.next_page_id()
            };

            self.current_page_id = next_page.unwrap_or(INVALID_PAGE_ID);
            self.current_index = 0;
        }
    }
}

impl Iterator for BPlusTreeIterator {
    type Item = Result<(Vec<u8>, RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
