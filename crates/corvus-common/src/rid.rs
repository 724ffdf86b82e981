//! Record identifiers.

use crate::page::PageId;
use serde::{Deserialize, Serialize};

/// Identifies a record by the page that stores it and its slot on that page.
///
/// This is the value type stored in B+tree leaves: the index maps keys to
/// record ids, and a table heap resolves record ids to tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Page holding the record.
    pub page_id: PageId,
    /// Slot number within the page.
    pub slot: u32,
}

impl RecordId {
    /// Size of the on-disk encoding in bytes.
    pub const SIZE: usize = 8;

    /// Creates a new record id.
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    /// Serializes to the fixed 8-byte encoding.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.to_le_bytes());
        buf
    }

    /// Deserializes from the fixed 8-byte encoding.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            page_id: PageId(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])),
            slot: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_id, self.slot)
    }
}
