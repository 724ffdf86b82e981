//! Page identifiers and size constants for CorvusDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Page id of the directory ("header") page.
///
/// Page 0 holds the `(index name, root page id)` records and is reserved by
/// the disk manager; it is never handed out by `allocate_page`.
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Unique identifier for a page in the database file.
///
/// Page ids are non-negative and assigned by the disk manager; `-1` is the
/// invalid sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub i32);

impl PageId {
    /// Invalid page id.
    pub const INVALID: PageId = PageId(-1);

    /// Returns true if this is a valid page id.
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    /// Byte offset of this page within the database file.
    pub fn file_offset(&self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_constant() {
        assert_eq!(PAGE_SIZE, 4096);
    }

    #[test]
    fn test_header_page_id() {
        assert_eq!(HEADER_PAGE_ID, PageId(0));
        assert!(HEADER_PAGE_ID.is_valid());
    }

    #[test]
    fn test_page_id_validity() {
        assert!(PageId(0).is_valid());
        assert!(PageId(42).is_valid());
        assert!(!PageId::INVALID.is_valid());
        assert!(!PageId(-7).is_valid());
    }

    #[test]
    fn test_page_id_file_offset() {
        assert_eq!(PageId(0).file_offset(), 0);
        assert_eq!(PageId(1).file_offset(), PAGE_SIZE as u64);
        assert_eq!(PageId(10).file_offset(), 10 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId(5).to_string(), "page:5");
        assert_eq!(PageId::INVALID.to_string(), "page:-1");
    }

    #[test]
    fn test_page_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(PageId(1));
        set.insert(PageId(2));
        set.insert(PageId(1));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId(500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
