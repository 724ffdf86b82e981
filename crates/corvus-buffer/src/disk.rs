//! Disk manager for page-level file I/O.

use corvus_common::{CorvusError, PageId, Result, StorageConfig, PAGE_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

/// Manages reading and writing fixed-size pages in the database file.
///
/// Page ids are a flat counter over one file; page 0 is reserved for the
/// index directory page and is never handed out by [`allocate_page`].
///
/// [`allocate_page`]: DiskManager::allocate_page
pub struct DiskManager {
    /// Path to the database file.
    path: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// Open file handle and page count.
    inner: Mutex<DiskInner>,
    /// Next page id to hand out.
    next_page_id: AtomicI32,
}

struct DiskInner {
    file: File,
    /// Number of pages the file currently spans.
    num_pages: i32,
}

impl DiskManager {
    /// Opens or creates the database file described by the configuration.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::open(&config.db_path, config.fsync_enabled)
    }

    /// Opens or creates the database file at the given path.
    pub fn open(path: &Path, fsync_enabled: bool) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as i32;

        Ok(Self {
            path: path.to_path_buf(),
            fsync_enabled,
            inner: Mutex::new(DiskInner { file, num_pages }),
            // Page 0 stays reserved even in a fresh file.
            next_page_id: AtomicI32::new(num_pages.max(1)),
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of pages the file currently spans.
    pub fn num_pages(&self) -> i32 {
        self.inner.lock().num_pages
    }

    /// Hands out a fresh page id.
    pub fn allocate_page(&self) -> PageId {
        PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Releases a page id.
    ///
    /// Freed ids are not recycled; the page simply stops being referenced.
    pub fn deallocate_page(&self, page_id: PageId) {
        log::trace!("deallocate {page_id}");
    }

    /// Reads a page from disk.
    ///
    /// Pages past the end of the file read as zeroes: a freshly allocated
    /// page id is readable before its first write.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        if !page_id.is_valid() {
            return Err(CorvusError::Corrupted(format!(
                "read of invalid {page_id}"
            )));
        }

        let mut buffer = [0u8; PAGE_SIZE];
        let mut inner = self.inner.lock();
        if page_id.0 >= inner.num_pages {
            return Ok(buffer);
        }

        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if !page_id.is_valid() {
            return Err(CorvusError::Corrupted(format!(
                "write of invalid {page_id}"
            )));
        }

        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        inner.file.write_all(data)?;

        if self.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.0 >= inner.num_pages {
            inner.num_pages = page_id.0 + 1;
        }

        Ok(())
    }
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager")
            .field("path", &self.path)
            .field("num_pages", &self.num_pages())
            .finish()
    }
}
