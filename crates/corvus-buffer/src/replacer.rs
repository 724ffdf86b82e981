//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Trait for page replacement algorithms.
pub trait Replacer: Send + Sync {
    /// Selects a victim frame for eviction.
    ///
    /// Returns None if no frames are evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Removes a frame from the eviction candidates; idempotent if absent.
    fn pin(&self, frame_id: FrameId);

    /// Adds a frame to the eviction candidates; idempotent if present.
    fn unpin(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// LRU replacement.
///
/// Keeps evictable frames ordered by the time they last became evictable:
/// `unpin` appends to the back, `victim` pops the least-recently-unpinned
/// frame off the front. A frame that gets re-pinned and unpinned again moves
/// to the back of the queue.
pub struct LruReplacer {
    /// Upper bound on tracked frames (the pool's frame count).
    num_pages: usize,
    /// Queue of evictable frames, front = least recently unpinned.
    inner: Mutex<LruInner>,
}

struct LruInner {
    entries: VecDeque<LruEntry>,
    timer: u64,
}

/// One evictable frame and the tick at which it became evictable.
#[derive(Debug, Clone, Copy)]
struct LruEntry {
    frame_id: FrameId,
    #[allow(dead_code)]
    stamp: u64,
}

impl LruReplacer {
    /// Creates a replacer tracking at most `num_pages` frames.
    pub fn new(num_pages: usize) -> Self {
        Self {
            num_pages,
            inner: Mutex::new(LruInner {
                entries: VecDeque::with_capacity(num_pages),
                timer: 0,
            }),
        }
    }

    /// Returns the maximum number of frames this replacer tracks.
    pub fn capacity(&self) -> usize {
        self.num_pages
    }
}

impl Replacer for LruReplacer {
    fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();
        inner.entries.pop_front().map(|entry| entry.frame_id)
    }

    fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|entry| entry.frame_id != frame_id);
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        if inner.entries.iter().any(|entry| entry.frame_id == frame_id) {
            return;
        }
        if inner.entries.len() >= self.num_pages {
            return;
        }
        let stamp = inner.timer;
        inner.timer += 1;
        inner.entries.push_back(LruEntry { frame_id, stamp });
    }

    fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_replacer_new() {
        let replacer = LruReplacer::new(10);
        assert_eq!(replacer.capacity(), 10);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_victim_empty() {
        let replacer = LruReplacer::new(10);
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_victim_order_is_unpin_order() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(3));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(7));
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.victim(), Some(FrameId(3)));
        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(7)));
        assert_eq!(replacer.size(), 0);
        assert!(replacer.victim().is_none());
    }

    #[test]
    fn test_lru_unpin_idempotent() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(1));

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_pin_removes_entry() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        replacer.pin(FrameId(1));

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(FrameId(2)));
    }

    #[test]
    fn test_lru_pin_absent_is_noop() {
        let replacer = LruReplacer::new(10);

        replacer.pin(FrameId(99));
        assert_eq!(replacer.size(), 0);

        replacer.unpin(FrameId(1));
        replacer.pin(FrameId(99));
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_lru_repin_moves_to_back() {
        let replacer = LruReplacer::new(10);

        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));

        // Frame 1 gets used again and released again: it is now the most
        // recently unpinned and must be evicted after frame 2.
        replacer.pin(FrameId(1));
        replacer.unpin(FrameId(1));

        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert_eq!(replacer.victim(), Some(FrameId(1)));
    }

    #[test]
    fn test_lru_bounded_by_num_pages() {
        let replacer = LruReplacer::new(3);

        replacer.unpin(FrameId(0));
        replacer.unpin(FrameId(1));
        replacer.unpin(FrameId(2));
        replacer.unpin(FrameId(3)); // over capacity, dropped

        assert_eq!(replacer.size(), 3);
        assert_eq!(replacer.victim(), Some(FrameId(0)));
    }

    #[test]
    fn test_lru_mixed_sequence() {
        let replacer = LruReplacer::new(7);

        for frame in [1, 2, 3, 4, 5, 6] {
            replacer.unpin(FrameId(frame));
        }
        replacer.unpin(FrameId(1));
        assert_eq!(replacer.size(), 6);

        assert_eq!(replacer.victim(), Some(FrameId(1)));
        assert_eq!(replacer.victim(), Some(FrameId(2)));
        assert_eq!(replacer.victim(), Some(FrameId(3)));

        replacer.pin(FrameId(3));
        replacer.pin(FrameId(4));
        assert_eq!(replacer.size(), 2);

        replacer.unpin(FrameId(4));
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.victim(), Some(FrameId(5)));
        assert_eq!(replacer.victim(), Some(FrameId(6)));
        assert_eq!(replacer.victim(), Some(FrameId(4)));
    }
}
