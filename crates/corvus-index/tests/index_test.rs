//! Integration tests for the B+tree index over a disk-backed buffer pool.

use corvus_buffer::{BufferPoolManager, DiskManager};
use corvus_common::{IndexConfig, PageId, RecordId};
use corvus_index::{BTreeIndex, HeaderPage, IndexKey, InternalPage, LeafPage, NodeHeader, NodeType};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn key(value: u64) -> IndexKey {
    IndexKey::from_u64(value)
}

fn rid(value: u64) -> RecordId {
    RecordId::new(PageId(value as i32), value as u32)
}

fn setup(
    pool_size: usize,
    leaf_max: u16,
    internal_max: u16,
) -> (TempDir, Arc<BufferPoolManager>, BTreeIndex) {
    init_log();
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::open(&dir.path().join("corvus.db"), false).unwrap());
    let pool = Arc::new(BufferPoolManager::new(pool_size, disk));
    let index = BTreeIndex::new(
        "test_index",
        pool.clone(),
        IndexConfig {
            leaf_max_size: leaf_max,
            internal_max_size: internal_max,
        },
    )
    .unwrap();
    (dir, pool, index)
}

fn header_of(pool: &BufferPoolManager, page_id: PageId) -> NodeHeader {
    let frame = pool.fetch_page(page_id).unwrap();
    let header = NodeHeader::read(&frame.read_data()[..]);
    pool.unpin_page(page_id, false);
    header
}

fn leaf_keys_of(pool: &BufferPoolManager, page_id: PageId) -> Vec<u64> {
    let frame = pool.fetch_page(page_id).unwrap();
    let keys = {
        let data = frame.read_data();
        let size = NodeHeader::read(&data[..]).size as usize;
        (0..size)
            .map(|i| LeafPage::key_at(&data[..], i).as_u64())
            .collect()
    };
    pool.unpin_page(page_id, false);
    keys
}

fn children_of(pool: &BufferPoolManager, page_id: PageId) -> Vec<(u64, PageId)> {
    let frame = pool.fetch_page(page_id).unwrap();
    let children = {
        let data = frame.read_data();
        let size = NodeHeader::read(&data[..]).size as usize;
        (0..size)
            .map(|i| {
                (
                    InternalPage::key_at(&data[..], i).as_u64(),
                    InternalPage::value_at(&data[..], i),
                )
            })
            .collect()
    };
    pool.unpin_page(page_id, false);
    children
}

#[test]
fn test_insert_and_get_roundtrip() {
    let (_dir, _pool, index) = setup(32, 8, 8);

    assert!(index.is_empty());
    for value in 1..=50u64 {
        assert!(index.insert(key(value), rid(value)).unwrap());
    }

    assert_eq!(index.len(), 50);
    assert!(!index.is_empty());
    for value in 1..=50u64 {
        assert_eq!(index.get_value(&key(value)).unwrap(), Some(rid(value)));
    }
    assert_eq!(index.get_value(&key(0)).unwrap(), None);
    assert_eq!(index.get_value(&key(51)).unwrap(), None);

    index.check_integrity().unwrap();
}

#[test]
fn test_duplicate_insert_rejected() {
    let (_dir, _pool, index) = setup(32, 3, 3);

    assert!(index.insert(key(5), rid(5)).unwrap());
    assert!(!index.insert(key(5), rid(99)).unwrap());

    assert_eq!(index.len(), 1);
    assert_eq!(index.get_value(&key(5)).unwrap(), Some(rid(5)));

    // Duplicates against a full leaf must not split either.
    for value in [1u64, 9] {
        index.insert(key(value), rid(value)).unwrap();
    }
    let root_before = index.root_page_id();
    assert!(!index.insert(key(9), rid(100)).unwrap());
    assert_eq!(index.root_page_id(), root_before);
    assert_eq!(index.len(), 3);
    index.check_integrity().unwrap();
}

#[test]
fn test_remove_missing_is_noop() {
    let (_dir, _pool, index) = setup(32, 3, 3);

    index.remove(&key(1)).unwrap();
    assert!(index.is_empty());

    index.insert(key(1), rid(1)).unwrap();
    index.remove(&key(2)).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.get_value(&key(1)).unwrap(), Some(rid(1)));
}

#[test]
fn test_insert_remove_get() {
    let (_dir, _pool, index) = setup(32, 4, 4);

    for value in 1..=20u64 {
        index.insert(key(value), rid(value)).unwrap();
    }
    for value in (1..=20u64).step_by(2) {
        index.remove(&key(value)).unwrap();
    }

    assert_eq!(index.len(), 10);
    for value in 1..=20u64 {
        let expected = if value % 2 == 0 { Some(rid(value)) } else { None };
        assert_eq!(index.get_value(&key(value)).unwrap(), expected);
    }
    index.check_integrity().unwrap();
}

#[test]
fn test_leaf_split_shape() {
    let (_dir, pool, index) = setup(32, 3, 3);

    for value in 1..=3u64 {
        index.insert(key(value), rid(value)).unwrap();
    }

    // Three entries still fit one root leaf.
    let root = index.root_page_id();
    assert_eq!(header_of(&pool, root).node_type, NodeType::Leaf);
    assert_eq!(leaf_keys_of(&pool, root), vec![1, 2, 3]);

    index.insert(key(4), rid(4)).unwrap();

    // The fourth entry splits the leaf under a fresh internal root with
    // separator 3.
    let root = index.root_page_id();
    let root_header = header_of(&pool, root);
    assert_eq!(root_header.node_type, NodeType::Internal);
    assert_eq!(root_header.size, 2);

    let children = children_of(&pool, root);
    assert_eq!(children[1].0, 3);

    let (left, right) = (children[0].1, children[1].1);
    assert_eq!(leaf_keys_of(&pool, left), vec![1, 2]);
    assert_eq!(leaf_keys_of(&pool, right), vec![3, 4]);
    assert_eq!(header_of(&pool, left).parent_page_id, root);
    assert_eq!(header_of(&pool, right).parent_page_id, root);

    index.check_integrity().unwrap();
}

#[test]
fn test_cascading_split_grows_height() {
    let (_dir, pool, index) = setup(32, 3, 3);

    for value in 1..=8u64 {
        index.insert(key(value), rid(value)).unwrap();
    }

    // Eight ascending inserts cascade a split through the root: one
    // separator at the top, two internals below it, four leaves of two.
    let root = index.root_page_id();
    let root_header = header_of(&pool, root);
    assert_eq!(root_header.node_type, NodeType::Internal);
    assert_eq!(root_header.size, 2);

    let internals = children_of(&pool, root);
    let mut leaves = Vec::new();
    for &(_, internal) in &internals {
        let header = header_of(&pool, internal);
        assert_eq!(header.node_type, NodeType::Internal);
        assert_eq!(header.size, 2);
        assert_eq!(header.parent_page_id, root);
        for (_, leaf) in children_of(&pool, internal) {
            assert_eq!(header_of(&pool, leaf).node_type, NodeType::Leaf);
            assert_eq!(header_of(&pool, leaf).parent_page_id, internal);
            leaves.push(leaf);
        }
    }
    assert_eq!(leaves.len(), 4);
    for (i, &leaf) in leaves.iter().enumerate() {
        let lo = (i as u64) * 2 + 1;
        assert_eq!(leaf_keys_of(&pool, leaf), vec![lo, lo + 1]);
    }

    index.check_integrity().unwrap();
}

#[test]
fn test_redistribute_on_delete() {
    let (_dir, pool, index) = setup(32, 3, 3);

    for value in 1..=4u64 {
        index.insert(key(value), rid(value)).unwrap();
    }
    index.remove(&key(1)).unwrap();

    // The left leaf borrows from its right sibling; no merge happens and the
    // parent separator follows the right leaf's new first key.
    let root = index.root_page_id();
    let root_header = header_of(&pool, root);
    assert_eq!(root_header.node_type, NodeType::Internal);
    assert_eq!(root_header.size, 2);

    let children = children_of(&pool, root);
    assert_eq!(children[1].0, 4);
    assert_eq!(leaf_keys_of(&pool, children[0].1), vec![2, 3]);
    assert_eq!(leaf_keys_of(&pool, children[1].1), vec![4]);

    assert_eq!(index.len(), 3);
    index.check_integrity().unwrap();
}

#[test]
fn test_coalesce_and_root_collapse() {
    let (_dir, pool, index) = setup(32, 3, 3);

    for value in 1..=4u64 {
        index.insert(key(value), rid(value)).unwrap();
    }
    index.remove(&key(4)).unwrap();
    index.remove(&key(3)).unwrap();

    // The leaves merge and the root collapses back to a single leaf.
    let root = index.root_page_id();
    assert_eq!(header_of(&pool, root).node_type, NodeType::Leaf);
    assert!(header_of(&pool, root).is_root());
    assert_eq!(leaf_keys_of(&pool, root), vec![1, 2]);
    assert_eq!(index.len(), 2);

    index.check_integrity().unwrap();
}

#[test]
fn test_empty_after_deleting_all() {
    let (_dir, _pool, index) = setup(32, 3, 3);

    for value in 1..=10u64 {
        index.insert(key(value), rid(value)).unwrap();
    }
    for value in 1..=10u64 {
        index.remove(&key(value)).unwrap();
    }

    assert!(index.is_empty());
    assert_eq!(index.root_page_id(), PageId::INVALID);
    assert_eq!(index.get_value(&key(5)).unwrap(), None);
    assert!(index.begin().unwrap().is_end());
    index.check_integrity().unwrap();

    // An emptied tree accepts inserts again.
    assert!(index.insert(key(42), rid(42)).unwrap());
    assert_eq!(index.len(), 1);
    assert_eq!(index.get_value(&key(42)).unwrap(), Some(rid(42)));
}

#[test]
fn test_iterator_full_scan_sorted() {
    let (_dir, _pool, index) = setup(64, 4, 4);

    let mut values: Vec<u64> = (1..=200).collect();
    values.shuffle(&mut rand::thread_rng());
    for &value in &values {
        index.insert(key(value), rid(value)).unwrap();
    }

    let scanned: Vec<(u64, RecordId)> = index
        .begin()
        .unwrap()
        .map(|(k, r)| (k.as_u64(), r))
        .collect();

    assert_eq!(scanned.len(), 200);
    for (i, &(k, r)) in scanned.iter().enumerate() {
        assert_eq!(k, i as u64 + 1);
        assert_eq!(r, rid(k));
    }
}

#[test]
fn test_iterator_from_key() {
    let (_dir, _pool, index) = setup(64, 4, 4);

    for value in (2..=100u64).step_by(2) {
        index.insert(key(value), rid(value)).unwrap();
    }

    // Probe between stored keys: everything >= 51 means the evens from 52.
    let scanned: Vec<u64> = index
        .begin_from(&key(51))
        .unwrap()
        .map(|(k, _)| k.as_u64())
        .collect();
    assert_eq!(scanned, (52..=100).step_by(2).collect::<Vec<_>>());

    // Probe at a stored key: it is included.
    let scanned: Vec<u64> = index
        .begin_from(&key(50))
        .unwrap()
        .map(|(k, _)| k.as_u64())
        .collect();
    assert_eq!(scanned.first(), Some(&50));

    // Probe past the maximum: the iterator starts exhausted.
    let mut past = index.begin_from(&key(1000)).unwrap();
    assert!(past.is_end());
    assert_eq!(past.next(), None);
}

#[test]
fn test_iterator_empty_tree() {
    let (_dir, _pool, index) = setup(16, 3, 3);

    let mut iter = index.begin().unwrap();
    assert!(iter.is_end());
    assert_eq!(iter.next(), None);
    assert!(index.end().is_end());
}

#[test]
fn test_random_insert_delete_stress() {
    let (_dir, _pool, index) = setup(64, 4, 4);
    let mut rng = rand::thread_rng();

    let mut values: Vec<u64> = (0..300).collect();
    values.shuffle(&mut rng);
    for &value in &values {
        index.insert(key(value), rid(value)).unwrap();
    }
    index.check_integrity().unwrap();

    let (gone, kept) = values.split_at(150);
    let mut gone = gone.to_vec();
    gone.shuffle(&mut rng);
    for &value in &gone {
        index.remove(&key(value)).unwrap();
    }
    index.check_integrity().unwrap();

    assert_eq!(index.len(), 150);
    for &value in &gone {
        assert_eq!(index.get_value(&key(value)).unwrap(), None);
    }
    for &value in kept {
        assert_eq!(index.get_value(&key(value)).unwrap(), Some(rid(value)));
    }
}

#[test]
fn test_small_pool_forces_eviction() {
    // Sixteen frames are far fewer than the tree's pages: operations churn
    // the pool and exercise dirty write-back, while still leaving room for
    // a full descent's pins plus the pages a cascading split allocates.
    let (_dir, pool, index) = setup(16, 4, 4);

    for value in 0..150u64 {
        index.insert(key(value), rid(value)).unwrap();
    }
    for value in 0..150u64 {
        assert_eq!(index.get_value(&key(value)).unwrap(), Some(rid(value)));
    }

    assert!(pool.page_count() <= 16);
    index.check_integrity().unwrap();
}

#[test]
fn test_reopen_adopts_persisted_root() {
    init_log();
    let dir = tempdir().unwrap();
    let path = dir.path().join("corvus.db");
    let config = IndexConfig {
        leaf_max_size: 4,
        internal_max_size: 4,
    };

    {
        let disk = Arc::new(DiskManager::open(&path, false).unwrap());
        let pool = Arc::new(BufferPoolManager::new(32, disk));
        let index = BTreeIndex::new("accounts_pk", pool.clone(), config).unwrap();
        for value in 1..=60u64 {
            index.insert(key(value), rid(value)).unwrap();
        }
        pool.flush_all_pages().unwrap();
    }

    let disk = Arc::new(DiskManager::open(&path, false).unwrap());
    let pool = Arc::new(BufferPoolManager::new(32, disk));
    let index = BTreeIndex::new("accounts_pk", pool, config).unwrap();

    assert_eq!(index.len(), 60);
    for value in 1..=60u64 {
        assert_eq!(index.get_value(&key(value)).unwrap(), Some(rid(value)));
    }
    index.check_integrity().unwrap();
}

#[test]
fn test_directory_record_tracks_root() {
    let (_dir, pool, index) = setup(32, 3, 3);

    for value in 1..=12u64 {
        index.insert(key(value), rid(value)).unwrap();
    }

    let frame = pool.fetch_page(corvus_common::HEADER_PAGE_ID).unwrap();
    let recorded = {
        let data = frame.read_data();
        HeaderPage::find_record(&data[..], "test_index")
    };
    pool.unpin_page(corvus_common::HEADER_PAGE_ID, false);

    assert_eq!(recorded, Some(index.root_page_id()));
}

#[test]
fn test_two_indexes_share_the_pool() {
    init_log();
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::open(&dir.path().join("corvus.db"), false).unwrap());
    let pool = Arc::new(BufferPoolManager::new(64, disk));
    let config = IndexConfig {
        leaf_max_size: 4,
        internal_max_size: 4,
    };

    let orders = BTreeIndex::new("orders_pk", pool.clone(), config).unwrap();
    let users = BTreeIndex::new("users_pk", pool.clone(), config).unwrap();

    for value in 1..=40u64 {
        orders.insert(key(value), rid(value)).unwrap();
        users.insert(key(value * 10), rid(value)).unwrap();
    }

    assert_eq!(orders.len(), 40);
    assert_eq!(users.len(), 40);
    assert_eq!(orders.get_value(&key(10)).unwrap(), Some(rid(10)));
    assert_eq!(users.get_value(&key(10)).unwrap(), Some(rid(1)));
    orders.check_integrity().unwrap();
    users.check_integrity().unwrap();
}

#[test]
fn test_concurrent_readers_single_writer() {
    let (_dir, _pool, index) = setup(128, 4, 4);
    const KEYS: u64 = 1000;

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for value in 1..=KEYS {
                assert!(index.insert(key(value), rid(value)).unwrap());
            }
        });

        let mut readers = Vec::new();
        for _ in 0..2 {
            readers.push(scope.spawn(|| {
                let mut rng = rand::thread_rng();
                for _ in 0..3000 {
                    let probe = rng.gen_range(1..=KEYS);
                    // A probe either misses (not inserted yet) or observes
                    // the exact value; a torn split would break both.
                    if let Some(found) = index.get_value(&key(probe)).unwrap() {
                        assert_eq!(found, rid(probe));
                    }
                }
            }));
        }

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    });

    assert_eq!(index.len(), KEYS as usize);
    for value in 1..=KEYS {
        assert_eq!(index.get_value(&key(value)).unwrap(), Some(rid(value)));
    }
    let scanned: Vec<u64> = index.begin().unwrap().map(|(k, _)| k.as_u64()).collect();
    assert_eq!(scanned, (1..=KEYS).collect::<Vec<_>>());
    index.check_integrity().unwrap();
}

#[test]
fn test_concurrent_writers_disjoint_ranges() {
    let (_dir, _pool, index) = setup(128, 4, 4);
    const PER_WRITER: u64 = 400;

    std::thread::scope(|scope| {
        for writer_id in 0..3u64 {
            let index = &index;
            scope.spawn(move || {
                let lo = writer_id * PER_WRITER + 1;
                for value in lo..lo + PER_WRITER {
                    assert!(index.insert(key(value), rid(value)).unwrap());
                }
            });
        }
    });

    assert_eq!(index.len(), 3 * PER_WRITER as usize);
    for value in 1..=3 * PER_WRITER {
        assert_eq!(index.get_value(&key(value)).unwrap(), Some(rid(value)));
    }
    index.check_integrity().unwrap();
}

#[test]
fn test_concurrent_remove_and_get() {
    let (_dir, _pool, index) = setup(128, 4, 4);
    const KEYS: u64 = 600;

    for value in 1..=KEYS {
        index.insert(key(value), rid(value)).unwrap();
    }

    std::thread::scope(|scope| {
        let remover = scope.spawn(|| {
            for value in (1..=KEYS).step_by(2) {
                index.remove(&key(value)).unwrap();
            }
        });
        let reader = scope.spawn(|| {
            let mut rng = rand::thread_rng();
            for _ in 0..2000 {
                let probe = rng.gen_range(1..=KEYS);
                if let Some(found) = index.get_value(&key(probe)).unwrap() {
                    assert_eq!(found, rid(probe));
                }
            }
        });
        remover.join().unwrap();
        reader.join().unwrap();
    });

    assert_eq!(index.len(), (KEYS / 2) as usize);
    for value in 1..=KEYS {
        let expected = if value % 2 == 0 { Some(rid(value)) } else { None };
        assert_eq!(index.get_value(&key(value)).unwrap(), expected);
    }
    index.check_integrity().unwrap();
}
