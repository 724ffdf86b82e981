//! Error types for CorvusDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using CorvusError.
pub type Result<T> = std::result::Result<T, CorvusError>;

/// Errors that can occur in CorvusDB operations.
#[derive(Debug, Error)]
pub enum CorvusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer pool exhausted, no free or evictable frame")]
    PoolExhausted,

    #[error("page not cached: {0}")]
    PageNotCached(PageId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("index corrupted: {0}")]
    Corrupted(String),
}
