//! The index directory page.
//!
//! Page 0 holds the `(index name, root page id)` records that make B+tree
//! roots discoverable across restarts. This is the only on-disk footprint of
//! an index outside its own node pages.

use corvus_common::{PageId, PAGE_SIZE};

/// Directory page layout.
///
/// ```text
/// +--------------------------+ 0
/// | record_count: u32        |
/// +--------------------------+ 4
/// | records: 36 bytes each   |  name (32, zero-padded) + root page id (4)
/// +--------------------------+
/// ```
pub struct HeaderPage;

impl HeaderPage {
    const COUNT_OFFSET: usize = 0;
    const RECORDS_OFFSET: usize = 4;
    const NAME_SIZE: usize = 32;
    const RECORD_SIZE: usize = Self::NAME_SIZE + 4;

    /// Maximum records the directory page can hold.
    pub const MAX_RECORDS: usize = (PAGE_SIZE - Self::RECORDS_OFFSET) / Self::RECORD_SIZE;

    /// Maximum index name length in bytes.
    pub const MAX_NAME_LEN: usize = Self::NAME_SIZE;

    /// Initializes an empty directory page in place.
    pub fn init(data: &mut [u8]) {
        data[Self::COUNT_OFFSET..Self::COUNT_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
    }

    /// Number of records currently stored.
    pub fn record_count(data: &[u8]) -> usize {
        u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize
    }

    fn set_record_count(data: &mut [u8], count: usize) {
        data[Self::COUNT_OFFSET..Self::COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }

    fn record_offset(index: usize) -> usize {
        Self::RECORDS_OFFSET + index * Self::RECORD_SIZE
    }

    fn record_name(data: &[u8], index: usize) -> &[u8] {
        let off = Self::record_offset(index);
        let name = &data[off..off + Self::NAME_SIZE];
        let len = name.iter().position(|&b| b == 0).unwrap_or(Self::NAME_SIZE);
        &name[..len]
    }

    fn record_root(data: &[u8], index: usize) -> PageId {
        let off = Self::record_offset(index) + Self::NAME_SIZE;
        PageId(i32::from_le_bytes([
            data[off],
            data[off + 1],
            data[off + 2],
            data[off + 3],
        ]))
    }

    fn write_record(data: &mut [u8], index: usize, name: &str, root: PageId) {
        let off = Self::record_offset(index);
        data[off..off + Self::NAME_SIZE].fill(0);
        data[off..off + name.len()].copy_from_slice(name.as_bytes());
        data[off + Self::NAME_SIZE..off + Self::RECORD_SIZE].copy_from_slice(&root.0.to_le_bytes());
    }

    fn find_index(data: &[u8], name: &str) -> Option<usize> {
        (0..Self::record_count(data)).find(|&i| Self::record_name(data, i) == name.as_bytes())
    }

    /// Looks up the root page id recorded for an index name.
    pub fn find_record(data: &[u8], name: &str) -> Option<PageId> {
        Self::find_index(data, name).map(|i| Self::record_root(data, i))
    }

    /// Adds a new record. Fails if the name is taken, too long, or the page
    /// is full.
    pub fn insert_record(data: &mut [u8], name: &str, root: PageId) -> bool {
        if name.is_empty() || name.len() > Self::MAX_NAME_LEN {
            return false;
        }
        if Self::find_index(data, name).is_some() {
            return false;
        }
        let count = Self::record_count(data);
        if count >= Self::MAX_RECORDS {
            return false;
        }
        Self::write_record(data, count, name, root);
        Self::set_record_count(data, count + 1);
        true
    }

    /// Rewrites the root page id of an existing record.
    pub fn update_record(data: &mut [u8], name: &str, root: PageId) -> bool {
        match Self::find_index(data, name) {
            Some(index) => {
                Self::write_record(data, index, name, root);
                true
            }
            None => false,
        }
    }
}
