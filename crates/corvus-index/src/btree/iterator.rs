//! Forward range iterator over the leaf chain.

use super::page::LeafPage;
use super::types::{IndexKey, NodeHeader};
use corvus_buffer::BufferPoolManager;
use corvus_common::{PageId, RecordId, PAGE_SIZE};
use parking_lot::RwLockReadGuard;

/// The one pinned, read-latched leaf the iterator currently walks.
struct LeafCursor<'a> {
    page_id: PageId,
    guard: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

/// Forward iterator over `(key, record id)` entries in ascending key order.
///
/// The iterator owns at most one pinned leaf latch at a time. Crossing a
/// leaf boundary latches the successor before the current leaf is released;
/// exhaustion and `Drop` both release whatever is still held.
pub struct IndexIterator<'a> {
    bpm: &'a BufferPoolManager,
    leaf: Option<LeafCursor<'a>>,
    position: usize,
}

impl<'a> IndexIterator<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        page_id: PageId,
        guard: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
        position: usize,
    ) -> Self {
        Self {
            bpm,
            leaf: Some(LeafCursor { page_id, guard }),
            position,
        }
    }

    pub(crate) fn exhausted(bpm: &'a BufferPoolManager) -> Self {
        Self {
            bpm,
            leaf: None,
            position: 0,
        }
    }

    /// Returns true once the iterator has run off the last leaf.
    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(cursor) => {
                let data = &cursor.guard[..];
                self.position >= NodeHeader::read(data).size as usize
                    && !LeafPage::next_page_id(data).is_valid()
            }
        }
    }

    fn release(&mut self) {
        if let Some(cursor) = self.leaf.take() {
            let LeafCursor { page_id, guard } = cursor;
            drop(guard);
            self.bpm.unpin_page(page_id, false);
        }
    }
}

impl Iterator for IndexIterator<'_> {
    type Item = (IndexKey, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cursor = self.leaf.as_ref()?;
            let data = &cursor.guard[..];
            let size = NodeHeader::read(data).size as usize;

            if self.position < size {
                let entry = LeafPage::entry_at(data, self.position);
                self.position += 1;
                return Some(entry);
            }

            let next = LeafPage::next_page_id(data);
            if !next.is_valid() {
                self.release();
                return None;
            }

            // Latch the successor before letting the current leaf go.
            let Ok(frame) = self.bpm.fetch_page(next) else {
                self.release();
                return None;
            };
            let next_guard = frame.read_data();
            let old = self.leaf.replace(LeafCursor {
                page_id: next,
                guard: next_guard,
            });
            if let Some(old) = old {
                let LeafCursor { page_id, guard } = old;
                drop(guard);
                self.bpm.unpin_page(page_id, false);
            }
            self.position = 0;
        }
    }
}

impl Drop for IndexIterator<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
