//! The concurrent B+tree index.
//!
//! Traversals lock-couple: a child's latch is acquired before the parent's
//! is released. Write operations carry a [`LatchContext`] owning the ordered
//! set of write-latched pages plus the ids of pages to delete once every
//! latch is dropped. A just-latched child is *safe* when the pending
//! modification cannot propagate above it (`size < max` for inserts,
//! `size > min` for deletes); all latched ancestors above a safe child are
//! released immediately.
//!
//! `root_page_id` and the entry count are the only index-level mutable
//! state. Both live behind the root mutex, which is held from reading the
//! root id until the root page's latch is released, and both are persisted
//! through the directory page on every root change.

use super::header::HeaderPage;
use super::iterator::IndexIterator;
use super::page::{InternalPage, LeafPage};
use super::types::{compare_keys, IndexKey, KeyComparator, NodeHeader, NodeType};
use corvus_buffer::BufferPoolManager;
use corvus_common::{CorvusError, IndexConfig, PageId, RecordId, Result, HEADER_PAGE_ID, PAGE_SIZE};
use parking_lot::{Mutex, MutexGuard, RwLockWriteGuard};
use std::cmp::Ordering;
use std::sync::Arc;

fn corrupted(msg: impl Into<String>) -> CorvusError {
    CorvusError::Corrupted(msg.into())
}

/// Index-level mutable state, guarded by the root mutex.
struct RootState {
    page_id: PageId,
    num_entries: usize,
}

/// A write-latched, pinned page owned by an operation.
struct LatchedPage<'a> {
    page_id: PageId,
    guard: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl LatchedPage<'_> {
    fn data(&self) -> &[u8] {
        &self.guard[..]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard[..]
    }
}

/// Per-operation ownership of latches and deferred deletions.
///
/// `path` is the root-to-leaf chain of retained descent pages; `side` holds
/// siblings and freshly allocated pages latched off the path. Pages queued
/// in `deleted` are handed back to the pool only after every latch is
/// dropped.
struct LatchContext<'a> {
    bpm: &'a BufferPoolManager,
    root_guard: Option<MutexGuard<'a, RootState>>,
    path: Vec<LatchedPage<'a>>,
    side: Vec<LatchedPage<'a>>,
    deleted: Vec<PageId>,
}

impl<'a> LatchContext<'a> {
    fn new(bpm: &'a BufferPoolManager, root_guard: MutexGuard<'a, RootState>) -> Self {
        Self {
            bpm,
            root_guard: Some(root_guard),
            path: Vec::new(),
            side: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Fetches and write-latches a page onto the descent path.
    fn latch_path(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.bpm.fetch_page(page_id)?;
        let guard = frame.write_data();
        self.path.push(LatchedPage { page_id, guard });
        Ok(())
    }

    /// Fetches and write-latches a page off the descent path.
    fn latch_side(&mut self, page_id: PageId) -> Result<()> {
        let frame = self.bpm.fetch_page(page_id)?;
        let guard = frame.write_data();
        self.side.push(LatchedPage { page_id, guard });
        Ok(())
    }

    /// Allocates a fresh page and write-latches it off the descent path.
    ///
    /// The page is invisible to other operations until it is linked into
    /// the tree, but holding its latch keeps the release discipline uniform.
    fn latch_new_side(&mut self) -> Result<PageId> {
        let (page_id, frame) = self.bpm.new_page()?;
        let guard = frame.write_data();
        self.side.push(LatchedPage { page_id, guard });
        Ok(page_id)
    }

    /// Index into `side` for a page latched there.
    fn side_index(&self, page_id: PageId) -> Result<usize> {
        self.side
            .iter()
            .position(|p| p.page_id == page_id)
            .ok_or_else(|| corrupted(format!("{page_id} is not latched off-path")))
    }

    /// Mutable page bytes for a latched page, wherever it is held.
    fn data_mut(&mut self, page_id: PageId) -> Option<&mut [u8]> {
        if let Some(i) = self.path.iter().position(|p| p.page_id == page_id) {
            return Some(self.path[i].data_mut());
        }
        if let Some(i) = self.side.iter().position(|p| p.page_id == page_id) {
            return Some(self.side[i].data_mut());
        }
        None
    }

    /// Releases every path page above `keep_index`, unpinned clean.
    ///
    /// Dropping the traversal root's latch also drops the root mutex.
    fn release_above(&mut self, keep_index: usize) {
        if keep_index == 0 {
            return;
        }
        for page in self.path.drain(0..keep_index) {
            let LatchedPage { page_id, guard } = page;
            drop(guard);
            self.bpm.unpin_page(page_id, false);
        }
        self.root_guard = None;
    }

    /// Releases every latched page (unpinned dirty), drops the root mutex,
    /// and performs the deferred deletions.
    fn release_all(&mut self) {
        while let Some(page) = self.side.pop() {
            let LatchedPage { page_id, guard } = page;
            drop(guard);
            self.bpm.unpin_page(page_id, true);
        }
        while let Some(page) = self.path.pop() {
            let LatchedPage { page_id, guard } = page;
            drop(guard);
            self.bpm.unpin_page(page_id, true);
        }
        self.root_guard = None;
        for page_id in std::mem::take(&mut self.deleted) {
            self.bpm.delete_page(page_id);
        }
    }
}

impl Drop for LatchContext<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Remove,
}

enum LeafAction {
    Plain,
    Duplicate,
    Split,
}

/// A clustered B+tree over unique keys.
pub struct BTreeIndex {
    name: String,
    bpm: Arc<BufferPoolManager>,
    root: Mutex<RootState>,
    leaf_max_size: u16,
    internal_max_size: u16,
    comparator: KeyComparator,
}

impl BTreeIndex {
    /// Opens or creates the named index with the default key order.
    pub fn new(name: &str, bpm: Arc<BufferPoolManager>, config: IndexConfig) -> Result<Self> {
        Self::with_comparator(name, bpm, config, compare_keys)
    }

    /// Opens or creates the named index with an explicit comparator.
    ///
    /// If the directory page already records a root for `name`, that tree is
    /// adopted and its entry count recomputed from the leaf chain.
    pub fn with_comparator(
        name: &str,
        bpm: Arc<BufferPoolManager>,
        config: IndexConfig,
        comparator: KeyComparator,
    ) -> Result<Self> {
        config.validate()?;
        if config.leaf_max_size as usize > LeafPage::CAPACITY {
            return Err(CorvusError::InvalidConfig(format!(
                "leaf_max_size {} exceeds page capacity {}",
                config.leaf_max_size,
                LeafPage::CAPACITY
            )));
        }
        if config.internal_max_size as usize > InternalPage::CAPACITY {
            return Err(CorvusError::InvalidConfig(format!(
                "internal_max_size {} exceeds page capacity {}",
                config.internal_max_size,
                InternalPage::CAPACITY
            )));
        }
        if name.is_empty() || name.len() > HeaderPage::MAX_NAME_LEN {
            return Err(CorvusError::InvalidConfig(format!(
                "index name must be 1..={} bytes",
                HeaderPage::MAX_NAME_LEN
            )));
        }

        let existing = {
            let frame = bpm.fetch_page(HEADER_PAGE_ID)?;
            let root = {
                let guard = frame.read_data();
                HeaderPage::find_record(&guard[..], name)
            };
            bpm.unpin_page(HEADER_PAGE_ID, false);
            root
        };

        let root_page_id = existing.unwrap_or(PageId::INVALID);
        let index = Self {
            name: name.to_string(),
            bpm,
            root: Mutex::new(RootState {
                page_id: root_page_id,
                num_entries: 0,
            }),
            leaf_max_size: config.leaf_max_size,
            internal_max_size: config.internal_max_size,
            comparator,
        };

        if root_page_id.is_valid() {
            let count = index.begin()?.count();
            index.root.lock().num_entries = count;
        }
        Ok(index)
    }

    /// Returns the index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.lock().num_entries == 0
    }

    /// Returns the number of entries in the index.
    pub fn len(&self) -> usize {
        self.root.lock().num_entries
    }

    /// Returns the current root page id (INVALID when empty).
    pub fn root_page_id(&self) -> PageId {
        self.root.lock().page_id
    }

    /// Point lookup. Keys are unique, so at most one record id comes back.
    pub fn get_value(&self, key: &IndexKey) -> Result<Option<RecordId>> {
        let root_guard = self.root.lock();
        let root_page_id = root_guard.page_id;
        if !root_page_id.is_valid() {
            return Ok(None);
        }

        let frame = self.bpm.fetch_page(root_page_id)?;
        let mut guard = frame.read_data();
        let mut current = root_page_id;
        drop(root_guard);

        loop {
            let header = NodeHeader::read(&guard[..]);
            match header.node_type {
                NodeType::Leaf => {
                    let found = LeafPage::lookup(&guard[..], key, self.comparator);
                    drop(guard);
                    self.bpm.unpin_page(current, false);
                    return Ok(found);
                }
                NodeType::Internal => {
                    let child = InternalPage::lookup(&guard[..], key, self.comparator);
                    let child_frame = match self.bpm.fetch_page(child) {
                        Ok(frame) => frame,
                        Err(e) => {
                            drop(guard);
                            self.bpm.unpin_page(current, false);
                            return Err(e);
                        }
                    };
                    // Lock-couple: hold the child before letting go of the
                    // parent.
                    let child_guard = child_frame.read_data();
                    drop(guard);
                    self.bpm.unpin_page(current, false);
                    guard = child_guard;
                    current = child;
                }
                NodeType::Free => {
                    drop(guard);
                    self.bpm.unpin_page(current, false);
                    return Err(corrupted(format!("search reached free {current}")));
                }
            }
        }
    }

    /// Inserts a `(key, record id)` entry. Returns false on a duplicate key,
    /// leaving the tree untouched.
    pub fn insert(&self, key: IndexKey, rid: RecordId) -> Result<bool> {
        let mut root_guard = self.root.lock();
        if !root_guard.page_id.is_valid() {
            self.start_new_tree(&mut root_guard, key, rid)?;
            return Ok(true);
        }

        let root_page_id = root_guard.page_id;
        let mut ctx = LatchContext::new(&self.bpm, root_guard);
        ctx.latch_path(root_page_id)?;
        self.descend_for_write(&mut ctx, &key, WriteOp::Insert)?;

        let leaf_index = ctx
            .path
            .len()
            .checked_sub(1)
            .ok_or_else(|| corrupted("empty descent path"))?;

        let action = {
            let leaf = &ctx.path[leaf_index];
            let header = NodeHeader::read(leaf.data());
            if header.size < header.max_size {
                LeafAction::Plain
            } else if LeafPage::lookup(leaf.data(), &key, self.comparator).is_some() {
                // A duplicate never splits: check before any structural work.
                LeafAction::Duplicate
            } else {
                LeafAction::Split
            }
        };

        let inserted = match action {
            LeafAction::Plain => {
                let leaf = &mut ctx.path[leaf_index];
                let old_size = NodeHeader::read(leaf.data()).size;
                let new_size = LeafPage::insert(leaf.data_mut(), key, rid, self.comparator);
                new_size == old_size + 1
            }
            LeafAction::Duplicate => false,
            LeafAction::Split => {
                self.split_leaf_and_insert(&mut ctx, key, rid)?;
                true
            }
        };

        ctx.release_all();
        drop(ctx);

        if inserted {
            self.root.lock().num_entries += 1;
        }
        Ok(inserted)
    }

    /// Removes a key. Removing an absent key is a silent no-op.
    pub fn remove(&self, key: &IndexKey) -> Result<()> {
        let root_guard = self.root.lock();
        if !root_guard.page_id.is_valid() {
            return Ok(());
        }

        let root_page_id = root_guard.page_id;
        let mut ctx = LatchContext::new(&self.bpm, root_guard);
        ctx.latch_path(root_page_id)?;
        self.descend_for_write(&mut ctx, key, WriteOp::Remove)?;

        let leaf_index = ctx
            .path
            .len()
            .checked_sub(1)
            .ok_or_else(|| corrupted("empty descent path"))?;

        let (removed, underflow) = {
            let leaf = &mut ctx.path[leaf_index];
            let old_size = NodeHeader::read(leaf.data()).size;
            let new_size = LeafPage::remove(leaf.data_mut(), key, self.comparator);
            if new_size == old_size {
                (false, false)
            } else {
                let header = NodeHeader::read(leaf.data());
                let underflow = if header.is_root() {
                    header.size == 0
                } else {
                    header.size < header.min_size()
                };
                (true, underflow)
            }
        };

        if underflow {
            self.coalesce_or_redistribute(&mut ctx, leaf_index)?;
        }

        ctx.release_all();
        drop(ctx);

        if removed {
            let mut root = self.root.lock();
            root.num_entries = root.num_entries.saturating_sub(1);
        }
        Ok(())
    }

    /// Iterator over every entry, ascending by key.
    pub fn begin(&self) -> Result<IndexIterator<'_>> {
        self.seed_iterator(None)
    }

    /// Iterator over every entry with key >= `key`, ascending.
    pub fn begin_from(&self, key: &IndexKey) -> Result<IndexIterator<'_>> {
        self.seed_iterator(Some(key))
    }

    /// Sentinel exhausted iterator.
    pub fn end(&self) -> IndexIterator<'_> {
        IndexIterator::exhausted(&self.bpm)
    }

    fn seed_iterator(&self, key: Option<&IndexKey>) -> Result<IndexIterator<'_>> {
        let root_guard = self.root.lock();
        let root_page_id = root_guard.page_id;
        if !root_page_id.is_valid() {
            return Ok(IndexIterator::exhausted(&self.bpm));
        }

        let frame = self.bpm.fetch_page(root_page_id)?;
        let mut guard = frame.read_data();
        let mut current = root_page_id;
        drop(root_guard);

        loop {
            let header = NodeHeader::read(&guard[..]);
            match header.node_type {
                NodeType::Leaf => {
                    let position = match key {
                        Some(key) => LeafPage::key_index(&guard[..], key, self.comparator),
                        None => 0,
                    };
                    return Ok(IndexIterator::new(&self.bpm, current, guard, position));
                }
                NodeType::Internal => {
                    let child = match key {
                        Some(key) => InternalPage::lookup(&guard[..], key, self.comparator),
                        None => InternalPage::value_at(&guard[..], 0),
                    };
                    let child_frame = match self.bpm.fetch_page(child) {
                        Ok(frame) => frame,
                        Err(e) => {
                            drop(guard);
                            self.bpm.unpin_page(current, false);
                            return Err(e);
                        }
                    };
                    let child_guard = child_frame.read_data();
                    drop(guard);
                    self.bpm.unpin_page(current, false);
                    guard = child_guard;
                    current = child;
                }
                NodeType::Free => {
                    drop(guard);
                    self.bpm.unpin_page(current, false);
                    return Err(corrupted(format!("iterator reached free {current}")));
                }
            }
        }
    }

    /// Plants a single-entry root leaf. Caller holds the root mutex.
    fn start_new_tree(&self, root: &mut RootState, key: IndexKey, rid: RecordId) -> Result<()> {
        let (page_id, frame) = self.bpm.new_page()?;
        {
            let mut guard = frame.write_data();
            LeafPage::init(&mut guard[..], page_id, PageId::INVALID, self.leaf_max_size);
            LeafPage::insert(&mut guard[..], key, rid, self.comparator);
        }
        self.bpm.unpin_page(page_id, true);

        root.page_id = page_id;
        root.num_entries = 1;
        self.write_root_record(page_id)?;
        log::debug!("index {}: started new tree at {page_id}", self.name);
        Ok(())
    }

    /// Crabs from the latched root down to the target leaf.
    fn descend_for_write(
        &self,
        ctx: &mut LatchContext<'_>,
        key: &IndexKey,
        op: WriteOp,
    ) -> Result<()> {
        loop {
            let child = {
                let Some(top) = ctx.path.last() else {
                    return Err(corrupted("empty descent path"));
                };
                let header = NodeHeader::read(top.data());
                match header.node_type {
                    NodeType::Leaf => return Ok(()),
                    NodeType::Internal => InternalPage::lookup(top.data(), key, self.comparator),
                    NodeType::Free => {
                        return Err(corrupted(format!("descent reached free {}", top.page_id)))
                    }
                }
            };

            ctx.latch_path(child)?;

            let safe = {
                let Some(top) = ctx.path.last() else {
                    return Err(corrupted("empty descent path"));
                };
                let header = NodeHeader::read(top.data());
                match op {
                    WriteOp::Insert => header.size < header.max_size,
                    WriteOp::Remove => header.size > header.min_size(),
                }
            };
            if safe {
                ctx.release_above(ctx.path.len() - 1);
            }
        }
    }

    /// Splits the full leaf at the top of the path and inserts the new key
    /// into the correct half.
    fn split_leaf_and_insert(
        &self,
        ctx: &mut LatchContext<'_>,
        key: IndexKey,
        rid: RecordId,
    ) -> Result<()> {
        let leaf_index = ctx
            .path
            .len()
            .checked_sub(1)
            .ok_or_else(|| corrupted("empty descent path"))?;
        let new_page_id = ctx.latch_new_side()?;
        let side_index = ctx.side_index(new_page_id)?;

        let middle_key = {
            let leaf = &mut ctx.path[leaf_index];
            let new_node = &mut ctx.side[side_index];
            LeafPage::init(
                new_node.data_mut(),
                new_page_id,
                PageId::INVALID,
                self.leaf_max_size,
            );
            LeafPage::move_half_to(leaf.data_mut(), new_node.data_mut());

            // Stitch the sibling chain: new takes over the old successor.
            let old_next = LeafPage::next_page_id(leaf.data());
            LeafPage::set_next_page_id(new_node.data_mut(), old_next);
            LeafPage::set_next_page_id(leaf.data_mut(), new_page_id);

            if (self.comparator)(&key, &LeafPage::key_at(new_node.data(), 0)) != Ordering::Less {
                LeafPage::insert(new_node.data_mut(), key, rid, self.comparator);
            } else {
                LeafPage::insert(leaf.data_mut(), key, rid, self.comparator);
            }

            LeafPage::key_at(new_node.data(), 0)
        };

        log::debug!("index {}: leaf split grew {new_page_id}", self.name);
        self.insert_into_parent(ctx, leaf_index, middle_key, new_page_id)
    }

    /// Links a freshly split sibling into the tree above.
    ///
    /// `child_index` addresses the old (left) half on the descent path; the
    /// new (right) half is latched in `ctx.side` under `new_page_id`.
    fn insert_into_parent(
        &self,
        ctx: &mut LatchContext<'_>,
        child_index: usize,
        middle_key: IndexKey,
        new_page_id: PageId,
    ) -> Result<()> {
        let mut key = middle_key;

        // Re-balance the split pair so both halves meet the minimum
        // occupancy before the separator is published.
        let mut reparent_after: Option<(PageId, PageId)> = None;
        {
            let side_index = ctx.side_index(new_page_id)?;
            let child = &mut ctx.path[child_index];
            let new_node = &mut ctx.side[side_index];

            let child_header = NodeHeader::read(child.data());
            let new_header = NodeHeader::read(new_node.data());

            if new_header.size < new_header.min_size() {
                match child_header.node_type {
                    NodeType::Leaf => {
                        LeafPage::move_last_to_front_of(child.data_mut(), new_node.data_mut());
                        key = LeafPage::key_at(new_node.data(), 0);
                    }
                    NodeType::Internal => {
                        let moved = InternalPage::move_last_to_front_of(
                            child.data_mut(),
                            new_node.data_mut(),
                            key,
                        );
                        reparent_after = Some((moved, new_page_id));
                        key = InternalPage::key_at(new_node.data(), 0);
                    }
                    NodeType::Free => return Err(corrupted("free page in split pair")),
                }
            } else if child_header.size < child_header.min_size() {
                match child_header.node_type {
                    NodeType::Leaf => {
                        LeafPage::move_first_to_end_of(new_node.data_mut(), child.data_mut());
                        key = LeafPage::key_at(new_node.data(), 0);
                    }
                    NodeType::Internal => {
                        let moved = InternalPage::move_first_to_end_of(
                            new_node.data_mut(),
                            child.data_mut(),
                            key,
                        );
                        reparent_after = Some((moved, child.page_id));
                        key = InternalPage::key_at(new_node.data(), 0);
                    }
                    NodeType::Free => return Err(corrupted("free page in split pair")),
                }
            }
        }
        if let Some((moved_child, new_parent)) = reparent_after {
            self.reparent(ctx, moved_child, new_parent)?;
        }

        let child_is_root = NodeHeader::read(ctx.path[child_index].data()).is_root();
        if child_is_root {
            // The root split: grow the tree by one level.
            let root_page_id = ctx.latch_new_side()?;
            {
                let root_index = ctx.side_index(root_page_id)?;
                let old_page_id = ctx.path[child_index].page_id;
                let root_node = &mut ctx.side[root_index];
                InternalPage::init(
                    root_node.data_mut(),
                    root_page_id,
                    PageId::INVALID,
                    self.internal_max_size,
                );
                InternalPage::populate_new_root(root_node.data_mut(), old_page_id, key, new_page_id);
            }

            NodeHeader::write_parent(ctx.path[child_index].data_mut(), root_page_id);
            {
                let side_index = ctx.side_index(new_page_id)?;
                NodeHeader::write_parent(ctx.side[side_index].data_mut(), root_page_id);
            }

            let Some(root_state) = ctx.root_guard.as_mut() else {
                return Err(corrupted("root page latched without the root mutex"));
            };
            root_state.page_id = root_page_id;
            self.write_root_record(root_page_id)?;
            log::debug!("index {}: root grew to {root_page_id}", self.name);
            return Ok(());
        }

        let parent_index = child_index
            .checked_sub(1)
            .ok_or_else(|| corrupted("split propagated past the latched path"))?;
        let parent_page_id = ctx.path[parent_index].page_id;
        let parent_header = NodeHeader::read(ctx.path[parent_index].data());

        if parent_header.size < parent_header.max_size {
            let old_page_id = ctx.path[child_index].page_id;
            InternalPage::insert_node_after(
                ctx.path[parent_index].data_mut(),
                old_page_id,
                key,
                new_page_id,
            );
            let side_index = ctx.side_index(new_page_id)?;
            NodeHeader::write_parent(ctx.side[side_index].data_mut(), parent_page_id);
            return Ok(());
        }

        // Full parent: split it as well and recurse.
        let split_page_id = ctx.latch_new_side()?;
        let moved = {
            let split_index = ctx.side_index(split_page_id)?;
            let parent = &mut ctx.path[parent_index];
            let split_node = &mut ctx.side[split_index];
            InternalPage::init(
                split_node.data_mut(),
                split_page_id,
                PageId::INVALID,
                self.internal_max_size,
            );
            InternalPage::move_half_to(parent.data_mut(), split_node.data_mut())
        };
        for moved_child in moved {
            self.reparent(ctx, moved_child, split_page_id)?;
        }

        // The old half's parent pointer tells us which side of the split it
        // landed on; the new sibling follows it.
        let old_page_id = ctx.path[child_index].page_id;
        let target_page_id = NodeHeader::read(ctx.path[child_index].data()).parent_page_id;
        let push_key = {
            let split_index = ctx.side_index(split_page_id)?;
            InternalPage::key_at(ctx.side[split_index].data(), 0)
        };

        if target_page_id == parent_page_id {
            InternalPage::insert_node_after(
                ctx.path[parent_index].data_mut(),
                old_page_id,
                key,
                new_page_id,
            );
        } else {
            let split_index = ctx.side_index(split_page_id)?;
            InternalPage::insert_node_after(
                ctx.side[split_index].data_mut(),
                old_page_id,
                key,
                new_page_id,
            );
        }
        {
            let side_index = ctx.side_index(new_page_id)?;
            NodeHeader::write_parent(ctx.side[side_index].data_mut(), target_page_id);
        }

        self.insert_into_parent(ctx, parent_index, push_key, split_page_id)
    }

    /// Repairs an underflowing node by merging with or borrowing from a
    /// sibling; at the root, shrinks the tree instead.
    fn coalesce_or_redistribute(&self, ctx: &mut LatchContext<'_>, index: usize) -> Result<()> {
        let (node_page_id, node_header) = {
            let node = &ctx.path[index];
            (node.page_id, NodeHeader::read(node.data()))
        };

        if node_header.is_root() {
            return self.adjust_root(ctx, index);
        }

        let parent_index = index
            .checked_sub(1)
            .ok_or_else(|| corrupted("underflowing node has no latched parent"))?;

        // Prefer the left sibling; the leftmost child borrows rightward.
        let (sibling_page_id, sibling_on_left) = {
            let parent = &ctx.path[parent_index];
            let Some(node_slot) = InternalPage::value_index(parent.data(), node_page_id) else {
                return Err(corrupted(format!(
                    "{node_page_id} missing from parent {}",
                    parent.page_id
                )));
            };
            if node_slot > 0 {
                (InternalPage::value_at(parent.data(), node_slot - 1), true)
            } else {
                (InternalPage::value_at(parent.data(), node_slot + 1), false)
            }
        };
        ctx.latch_side(sibling_page_id)?;

        let sibling_size = {
            let Some(sibling) = ctx.side.last() else {
                return Err(corrupted("sibling is not latched"));
            };
            NodeHeader::read(sibling.data()).size
        };

        let total = sibling_size + node_header.size;
        let fits = match node_header.node_type {
            NodeType::Leaf => total < node_header.max_size,
            NodeType::Internal => total <= node_header.max_size,
            NodeType::Free => return Err(corrupted("free page in sibling pair")),
        };

        let (left_page_id, right_page_id) = if sibling_on_left {
            (sibling_page_id, node_page_id)
        } else {
            (node_page_id, sibling_page_id)
        };

        if fits {
            self.coalesce(ctx, parent_index, index, left_page_id, right_page_id)
        } else {
            self.redistribute(
                ctx,
                parent_index,
                index,
                left_page_id,
                right_page_id,
                sibling_on_left,
            )
        }
    }

    /// Merges the right node of a sibling pair into the left, removing the
    /// separator from the parent and recursing if the parent underflows.
    fn coalesce(
        &self,
        ctx: &mut LatchContext<'_>,
        parent_index: usize,
        node_index: usize,
        left_page_id: PageId,
        right_page_id: PageId,
    ) -> Result<()> {
        let (separator_slot, separator_key) = {
            let parent = &ctx.path[parent_index];
            let Some(slot) = InternalPage::value_index(parent.data(), right_page_id) else {
                return Err(corrupted("merged pair lost its separator"));
            };
            (slot, InternalPage::key_at(parent.data(), slot))
        };

        let moved_children = {
            let path_node = &mut ctx.path[node_index];
            let Some(side_last) = ctx.side.last_mut() else {
                return Err(corrupted("sibling is not latched"));
            };
            let node_type = NodeHeader::read(path_node.data()).node_type;
            let (right_data, left_data) = if path_node.page_id == right_page_id {
                (path_node.data_mut(), side_last.data_mut())
            } else {
                (side_last.data_mut(), path_node.data_mut())
            };
            match node_type {
                NodeType::Leaf => {
                    LeafPage::move_all_to(right_data, left_data);
                    Vec::new()
                }
                NodeType::Internal => {
                    InternalPage::move_all_to(right_data, left_data, separator_key)
                }
                NodeType::Free => return Err(corrupted("free page in sibling pair")),
            }
        };
        for moved_child in moved_children {
            self.reparent(ctx, moved_child, left_page_id)?;
        }

        InternalPage::remove_at(ctx.path[parent_index].data_mut(), separator_slot);
        ctx.deleted.push(right_page_id);
        log::debug!("index {}: coalesced {right_page_id} into {left_page_id}", self.name);

        let parent_header = NodeHeader::read(ctx.path[parent_index].data());
        let parent_underflow = if parent_header.is_root() {
            parent_header.size == 1
        } else {
            parent_header.size < parent_header.min_size()
        };
        if parent_underflow {
            return self.coalesce_or_redistribute(ctx, parent_index);
        }
        Ok(())
    }

    /// Moves one slot from the richer sibling toward the underflowing node
    /// and rewrites the parent separator to the right node's first key.
    fn redistribute(
        &self,
        ctx: &mut LatchContext<'_>,
        parent_index: usize,
        node_index: usize,
        left_page_id: PageId,
        right_page_id: PageId,
        sibling_on_left: bool,
    ) -> Result<()> {
        let (separator_slot, separator_key) = {
            let parent = &ctx.path[parent_index];
            let Some(slot) = InternalPage::value_index(parent.data(), right_page_id) else {
                return Err(corrupted("sibling pair lost its separator"));
            };
            (slot, InternalPage::key_at(parent.data(), slot))
        };

        let mut reparent_after: Option<(PageId, PageId)> = None;
        let new_separator = {
            let path_node = &mut ctx.path[node_index];
            let Some(side_last) = ctx.side.last_mut() else {
                return Err(corrupted("sibling is not latched"));
            };
            let node_type = NodeHeader::read(path_node.data()).node_type;
            let (left_data, right_data) = if path_node.page_id == left_page_id {
                (path_node.data_mut(), side_last.data_mut())
            } else {
                (side_last.data_mut(), path_node.data_mut())
            };

            match (node_type, sibling_on_left) {
                (NodeType::Leaf, true) => {
                    LeafPage::move_last_to_front_of(left_data, right_data);
                    LeafPage::key_at(right_data, 0)
                }
                (NodeType::Leaf, false) => {
                    LeafPage::move_first_to_end_of(right_data, left_data);
                    LeafPage::key_at(right_data, 0)
                }
                (NodeType::Internal, true) => {
                    let moved =
                        InternalPage::move_last_to_front_of(left_data, right_data, separator_key);
                    reparent_after = Some((moved, right_page_id));
                    InternalPage::key_at(right_data, 0)
                }
                (NodeType::Internal, false) => {
                    let moved =
                        InternalPage::move_first_to_end_of(right_data, left_data, separator_key);
                    reparent_after = Some((moved, left_page_id));
                    InternalPage::key_at(right_data, 0)
                }
                (NodeType::Free, _) => return Err(corrupted("free page in sibling pair")),
            }
        };
        if let Some((moved_child, new_parent)) = reparent_after {
            self.reparent(ctx, moved_child, new_parent)?;
        }

        InternalPage::set_key_at(ctx.path[parent_index].data_mut(), separator_slot, new_separator);
        Ok(())
    }

    /// Shrinks the tree when the root underflows: an empty root leaf clears
    /// the index, an internal root with one child promotes that child.
    fn adjust_root(&self, ctx: &mut LatchContext<'_>, index: usize) -> Result<()> {
        let (root_page_id, header) = {
            let node = &ctx.path[index];
            (node.page_id, NodeHeader::read(node.data()))
        };

        match header.node_type {
            NodeType::Leaf => {
                if header.size == 0 {
                    let Some(root_state) = ctx.root_guard.as_mut() else {
                        return Err(corrupted("root page latched without the root mutex"));
                    };
                    root_state.page_id = PageId::INVALID;
                    self.write_root_record(PageId::INVALID)?;
                    ctx.deleted.push(root_page_id);
                    log::debug!("index {}: tree emptied", self.name);
                }
                Ok(())
            }
            NodeType::Internal => {
                if header.size == 1 {
                    let child_page_id = InternalPage::value_at(ctx.path[index].data(), 0);
                    self.reparent(ctx, child_page_id, PageId::INVALID)?;

                    let Some(root_state) = ctx.root_guard.as_mut() else {
                        return Err(corrupted("root page latched without the root mutex"));
                    };
                    root_state.page_id = child_page_id;
                    self.write_root_record(child_page_id)?;
                    ctx.deleted.push(root_page_id);
                    log::debug!(
                        "index {}: root collapsed onto {child_page_id}",
                        self.name
                    );
                }
                Ok(())
            }
            NodeType::Free => Err(corrupted("free page at the root")),
        }
    }

    /// Rewrites a child's parent pointer, going through the context when the
    /// child is already latched by this operation.
    fn reparent(
        &self,
        ctx: &mut LatchContext<'_>,
        child_page_id: PageId,
        parent_page_id: PageId,
    ) -> Result<()> {
        if let Some(data) = ctx.data_mut(child_page_id) {
            NodeHeader::write_parent(data, parent_page_id);
            return Ok(());
        }

        let frame = self.bpm.fetch_page(child_page_id)?;
        {
            let mut guard = frame.write_data();
            NodeHeader::write_parent(&mut guard[..], parent_page_id);
        }
        self.bpm.unpin_page(child_page_id, true);
        Ok(())
    }

    /// Records the current root in the directory page; the first write
    /// inserts the record, later writes update it in place.
    fn write_root_record(&self, root_page_id: PageId) -> Result<()> {
        let frame = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        let ok = {
            let mut guard = frame.write_data();
            HeaderPage::update_record(&mut guard[..], &self.name, root_page_id)
                || HeaderPage::insert_record(&mut guard[..], &self.name, root_page_id)
        };
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
        if !ok {
            return Err(corrupted("index directory page is full"));
        }
        Ok(())
    }

    /// Walks the whole tree and verifies its structural invariants: per-node
    /// key ordering, non-root size bounds, parent linkage, the ordered leaf
    /// chain, and the entry count.
    ///
    /// Meant for quiesced trees; concurrent writers will trip it.
    pub fn check_integrity(&self) -> Result<()> {
        let (root_page_id, expected_entries) = {
            let root = self.root.lock();
            (root.page_id, root.num_entries)
        };
        if !root_page_id.is_valid() {
            if expected_entries != 0 {
                return Err(self.violation("empty tree with a nonzero entry count"));
            }
            return Ok(());
        }

        let mut entries = Vec::new();
        self.check_node(root_page_id, PageId::INVALID, None, None, &mut entries)?;

        if entries.len() != expected_entries {
            return Err(self.violation(format!(
                "leaf slots sum to {} but the index counts {expected_entries}",
                entries.len()
            )));
        }

        // The sibling chain must visit the same entries in the same order.
        let chained: Vec<(IndexKey, RecordId)> = self.begin()?.collect();
        if chained != entries {
            return Err(self.violation("leaf chain disagrees with the tree walk"));
        }
        for pair in chained.windows(2) {
            if (self.comparator)(&pair[0].0, &pair[1].0) != Ordering::Less {
                return Err(self.violation("leaf chain keys are not strictly ascending"));
            }
        }
        Ok(())
    }

    fn check_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        low: Option<IndexKey>,
        high: Option<IndexKey>,
        entries: &mut Vec<(IndexKey, RecordId)>,
    ) -> Result<()> {
        // Snapshot the node so the pin is released before recursing; a small
        // pool can then still serve the whole walk.
        let snapshot = {
            let frame = self.bpm.fetch_page(page_id)?;
            let data = frame.read_data().clone();
            self.bpm.unpin_page(page_id, false);
            data
        };
        let data = &snapshot[..];
        let header = NodeHeader::read(data);

        if header.page_id != page_id {
            return Err(self.violation(format!(
                "{page_id} stores page id {} in its header",
                header.page_id
            )));
        }
        if header.parent_page_id != expected_parent {
            return Err(self.violation(format!(
                "{page_id} has parent {} but is linked under {expected_parent}",
                header.parent_page_id
            )));
        }
        // One-slot redistribution can leave a donor just under the midpoint,
        // so only emptiness and the fan-out bound are hard errors here.
        let is_root = !expected_parent.is_valid();
        if !is_root && header.size == 0 {
            return Err(self.violation(format!("{page_id} is an empty non-root node")));
        }
        if header.size > header.max_size {
            return Err(self.violation(format!(
                "{page_id} holds {} slots over the bound {}",
                header.size, header.max_size
            )));
        }

        let in_bounds = |key: &IndexKey| {
            low.as_ref()
                .map_or(true, |low| (self.comparator)(key, low) != Ordering::Less)
                && high
                    .as_ref()
                    .map_or(true, |high| (self.comparator)(key, high) == Ordering::Less)
        };

        match header.node_type {
            NodeType::Leaf => {
                for slot in 0..header.size as usize {
                    let (key, rid) = LeafPage::entry_at(data, slot);
                    if slot + 1 < header.size as usize
                        && (self.comparator)(&key, &LeafPage::key_at(data, slot + 1))
                            != Ordering::Less
                    {
                        return Err(self.violation(format!("{page_id} keys out of order")));
                    }
                    if !in_bounds(&key) {
                        return Err(self.violation(format!(
                            "{page_id} key {key} escapes its separator range"
                        )));
                    }
                    entries.push((key, rid));
                }
                Ok(())
            }
            NodeType::Internal => {
                for slot in 1..header.size as usize {
                    let key = InternalPage::key_at(data, slot);
                    if slot + 1 < header.size as usize
                        && (self.comparator)(&key, &InternalPage::key_at(data, slot + 1))
                            != Ordering::Less
                    {
                        return Err(self.violation(format!("{page_id} separators out of order")));
                    }
                    if !in_bounds(&key) {
                        return Err(self.violation(format!(
                            "{page_id} separator {key} escapes its range"
                        )));
                    }
                }
                for slot in 0..header.size as usize {
                    let child = InternalPage::value_at(data, slot);
                    let child_low = if slot == 0 {
                        low
                    } else {
                        Some(InternalPage::key_at(data, slot))
                    };
                    let child_high = if slot + 1 < header.size as usize {
                        Some(InternalPage::key_at(data, slot + 1))
                    } else {
                        high
                    };
                    self.check_node(child, page_id, child_low, child_high, entries)?;
                }
                Ok(())
            }
            NodeType::Free => Err(self.violation(format!("{page_id} is a free page"))),
        }
    }

    fn violation(&self, msg: impl Into<String>) -> CorvusError {
        let msg = msg.into();
        log::error!("index {}: {msg}", self.name);
        debug_assert!(false, "index {}: {msg}", self.name);
        CorvusError::Corrupted(msg)
    }
}

impl std::fmt::Debug for BTreeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = self.root.lock();
        f.debug_struct("BTreeIndex")
            .field("name", &self.name)
            .field("root_page_id", &root.page_id)
            .field("num_entries", &root.num_entries)
            .field("leaf_max_size", &self.leaf_max_size)
            .field("internal_max_size", &self.internal_max_size)
            .finish()
    }
}
