//! B+tree indexing for CorvusDB.
//!
//! This crate provides the clustered B+tree index built on the buffer pool:
//! fixed fan-out node layouts, latch-coupled concurrent traversal, structural
//! modification (split, coalesce, redistribute), the page-0 index directory,
//! and a forward range iterator.

pub mod btree;

pub use btree::{
    compare_keys, BTreeIndex, HeaderPage, IndexIterator, IndexKey, InternalPage, KeyComparator,
    LeafPage, NodeHeader, NodeType, KEY_SIZE,
};
