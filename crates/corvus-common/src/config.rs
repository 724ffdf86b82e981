//! Configuration structures for CorvusDB.

use crate::error::{CorvusError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the database file.
    pub db_path: PathBuf,
    /// Buffer pool size in number of frames.
    pub pool_size: usize,
    /// Enable fsync after page writes.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./corvus.db"),
            pool_size: 1024, // 4 MB with 4 KB pages
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the total buffer pool size in bytes.
    pub fn pool_size_bytes(&self) -> usize {
        self.pool_size * crate::page::PAGE_SIZE
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(CorvusError::InvalidConfig(
                "pool_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tuning knobs for a B+tree index.
///
/// `leaf_max_size` bounds the `(key, record id)` slots per leaf and
/// `internal_max_size` bounds the `(key, child)` slots per internal node,
/// i.e. the fan-out. Both are additionally capped by the slot capacity of a
/// page, which the index checks at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum slots per leaf node; must be >= 2.
    pub leaf_max_size: u16,
    /// Maximum slots per internal node; must be >= 3.
    pub internal_max_size: u16,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            leaf_max_size: 128,
            internal_max_size: 256,
        }
    }
}

impl IndexConfig {
    /// Validates the fan-out bounds.
    pub fn validate(&self) -> Result<()> {
        if self.leaf_max_size < 2 {
            return Err(CorvusError::InvalidConfig(
                "leaf_max_size must be >= 2".to_string(),
            ));
        }
        if self.internal_max_size < 3 {
            return Err(CorvusError::InvalidConfig(
                "internal_max_size must be >= 3".to_string(),
            ));
        }
        Ok(())
    }
}
