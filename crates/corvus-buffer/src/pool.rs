//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{Frame, FrameId};
use crate::replacer::{LruReplacer, Replacer};
use corvus_common::{CorvusError, PageId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Buffer pool manager.
///
/// Mediates all page I/O through a fixed set of in-memory frames. The pool
/// mutex serializes the page table, the free list, and every replacer call;
/// the per-frame latches in [`Frame`] belong to higher layers. Frames are
/// taken from the free list first and only then by evicting an unpinned
/// page, writing it back if dirty.
///
/// Every successful `fetch_page`/`new_page` pins the frame and must be paired
/// with exactly one `unpin_page`.
pub struct BufferPoolManager {
    /// Number of frames in the pool.
    pool_size: usize,
    /// Fixed array of buffer frames.
    frames: Vec<Frame>,
    /// Eviction policy over unpinned frames.
    replacer: LruReplacer,
    /// Backing page store.
    disk: Arc<DiskManager>,
    /// Page table and free list behind the pool mutex.
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Maps cached page ids to the frames holding them.
    page_table: HashMap<PageId, FrameId>,
    /// Frames not caching any page.
    free_list: Vec<FrameId>,
}

impl BufferPoolManager {
    /// Creates a buffer pool with `pool_size` frames.
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        let frames: Vec<_> = (0..pool_size).map(|i| Frame::new(FrameId(i))).collect();

        // All frames start on the free list; keep them in ascending order so
        // frame 0 is handed out first.
        let free_list: Vec<_> = (0..pool_size).rev().map(FrameId).collect();

        Self {
            pool_size,
            frames,
            replacer: LruReplacer::new(pool_size),
            disk,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
            }),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames so small machines still get useful caching.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        use sysinfo::System;

        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let pool_size = (target_bytes / corvus_common::PAGE_SIZE).max(1_000);

        Self::new(pool_size, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Returns the number of pages currently cached.
    pub fn page_count(&self) -> usize {
        self.inner.lock().page_table.len()
    }

    /// Checks whether a page is cached.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.lock().page_table.contains_key(&page_id)
    }

    /// Returns the backing disk manager.
    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Selects a frame for a new occupant: free list first, then eviction.
    ///
    /// An evicted dirty page is written back and its mapping erased. Fails
    /// with [`CorvusError::PoolExhausted`] when every frame is pinned.
    fn allocate_frame(&self, inner: &mut PoolInner) -> Result<FrameId> {
        if let Some(frame_id) = inner.free_list.pop() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(CorvusError::PoolExhausted)?;
        let frame = &self.frames[frame_id.0];
        let old_page_id = frame.page_id();

        if frame.is_dirty() {
            log::debug!("evicting dirty {old_page_id} from {frame_id}");
            let data = frame.read_data();
            if let Err(e) = self.disk.write_page(old_page_id, &data) {
                drop(data);
                // Put the victim back so the pool stays consistent.
                self.replacer.unpin(frame_id);
                return Err(e);
            }
            frame.set_dirty(false);
        }

        inner.page_table.remove(&old_page_id);
        Ok(frame_id)
    }

    /// Fetches a page, reading it from disk on a cache miss.
    ///
    /// The returned frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<&Frame> {
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id.0];
            frame.pin();
            self.replacer.pin(frame_id);
            return Ok(frame);
        }

        let frame_id = self.allocate_frame(&mut inner)?;
        let frame = &self.frames[frame_id.0];

        let data = match self.disk.read_page(page_id) {
            Ok(data) => data,
            Err(e) => {
                inner.free_list.push(frame_id);
                return Err(e);
            }
        };

        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();
        frame.copy_from(&data);
        inner.page_table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Allocates a fresh page and caches it in a zeroed, pinned frame.
    pub fn new_page(&self) -> Result<(PageId, &Frame)> {
        let mut inner = self.inner.lock();

        let frame_id = self.allocate_frame(&mut inner)?;
        let page_id = self.disk.allocate_page();
        let frame = &self.frames[frame_id.0];

        frame.reset();
        frame.set_page_id(page_id);
        frame.pin();
        inner.page_table.insert(page_id, frame_id);
        self.replacer.pin(frame_id);

        Ok((page_id, frame))
    }

    /// Releases one pin on a page, folding in the caller's dirty flag.
    ///
    /// Returns true unless the pin count was already zero. A page that is not
    /// cached is treated as already released.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id.0];

        if frame.pin_count() == 0 {
            log::warn!("unpin of {page_id} with zero pin count");
            return false;
        }

        if is_dirty {
            // Never cleared here: the dirty bit only resets on write-back.
            frame.set_dirty(true);
        }

        if frame.unpin() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Drops a page from the pool and deallocates it on disk.
    ///
    /// Returns false if the page is pinned; an uncached page counts as
    /// deleted.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return true;
        };
        let frame = &self.frames[frame_id.0];

        if frame.pin_count() != 0 {
            return false;
        }

        inner.page_table.remove(&page_id);
        frame.reset();
        inner.free_list.push(frame_id);
        // Clears any stale replacer entry for the freed frame.
        self.replacer.pin(frame_id);
        self.disk.deallocate_page(page_id);
        true
    }

    /// Writes a page through to disk regardless of its dirty bit.
    ///
    /// Returns `Ok(false)` iff the page is not cached.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[frame_id.0];

        let data = frame.read_data();
        self.disk.write_page(page_id, &data)?;
        drop(data);
        frame.set_dirty(false);
        Ok(true)
    }

    /// Writes every cached dirty page back to disk.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all_pages(&self) -> Result<usize> {
        let inner = self.inner.lock();
        let mut flushed = 0;

        for (&page_id, &frame_id) in inner.page_table.iter() {
            let frame = &self.frames[frame_id.0];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(page_id, &data)?;
                drop(data);
                frame.set_dirty(false);
                flushed += 1;
            }
        }

        Ok(flushed)
    }
}

impl std::fmt::Debug for BufferPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPoolManager")
            .field("pool_size", &self.pool_size)
            .field("cached", &self.page_count())
            .field("free", &self.free_count())
            .finish()
    }
}
