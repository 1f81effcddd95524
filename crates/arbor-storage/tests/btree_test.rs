//! B+Tree index integration tests.
//!
//! Covers the end-to-end scenarios (single inserts, splits, bounded scans,
//! duplicates, string keys, cascading splits, reopen, bad inputs) plus a
//! structural walker that checks the tree invariants after every phase:
//! sorted keys in every node, separator bounds between parent and child,
//! leaf-chain ordering, uniform leaf depth, and buffer-pool pin balance.

use arbor_common::page::{INVALID_PAGE, PAGE_SIZE};
use arbor_common::{ArborError, StorageConfig};
use arbor_storage::{
    BTreeIndex, BufferManager, IndexKey, InternalView, LeafView, RangeOp, RecordFile, RecordId,
    StringKey,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_env(frames: usize) -> (BufferManager, tempfile::TempDir) {
    init_logging();
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: PathBuf::from(dir.path()),
        buffer_pool_frames: frames,
        fsync_enabled: false,
    };
    (BufferManager::new(&config).unwrap(), dir)
}

/// Creates an empty relation so index construction has something to
/// bulk-load (zero records), then builds the index for manual inserts.
fn empty_index<'a, K: IndexKey>(bm: &'a BufferManager, relation: &str) -> BTreeIndex<'a, K> {
    RecordFile::create(bm, relation).unwrap();
    BTreeIndex::new(bm, relation, 0).unwrap()
}

fn rid(n: u32) -> RecordId {
    RecordId::new(n, 0)
}

/// Drains the active scan into a vector of record ids, asserting the scan
/// terminates with `IndexScanCompleted`.
fn drain_scan<K: IndexKey>(index: &mut BTreeIndex<K>) -> Vec<RecordId> {
    let mut rids = Vec::new();
    loop {
        match index.scan_next() {
            Ok(rid) => rids.push(rid),
            Err(ArborError::IndexScanCompleted) => break,
            Err(e) => panic!("scan failed: {}", e),
        }
    }
    rids
}

// =============================================================================
// Structural invariant walker
// =============================================================================

struct TreeStats {
    entry_count: usize,
    leaf_count: usize,
    /// Root-to-leaf path length; 1 when the root is a leaf.
    depth: usize,
}

fn read_page_copy(bm: &BufferManager, file_id: u32, page_no: u32) -> [u8; PAGE_SIZE] {
    let frame = bm.read_page(file_id, page_no).unwrap();
    let copy = **frame.read_data();
    bm.unpin_page(file_id, page_no, false);
    copy
}

/// Walks the whole tree and asserts the structural invariants.
fn check_tree<K: IndexKey>(bm: &BufferManager, index: &BTreeIndex<K>) -> TreeStats {
    let file_id = index.file_id();
    let mut stats = TreeStats {
        entry_count: 0,
        leaf_count: 0,
        depth: 0,
    };
    let mut leftmost_leaf = index.root_page_no();

    walk_node::<K>(
        bm,
        file_id,
        index.root_page_no(),
        index.is_root_leaf(),
        None,
        None,
        1,
        &mut stats,
        &mut leftmost_leaf,
    );

    // Leaf chain: following right_sibling from the leftmost leaf yields
    // every key in non-decreasing order.
    let mut chained_entries = 0;
    let mut chained_leaves = 0;
    let mut prev: Option<K> = None;
    let mut page_no = leftmost_leaf;
    while page_no != INVALID_PAGE {
        let page = read_page_copy(bm, file_id, page_no);
        let leaf = LeafView::<K>::new(&page);
        for i in 0..leaf.len() {
            let key = leaf.key_at(i);
            if let Some(p) = prev {
                assert_ne!(
                    p.key_cmp(&key),
                    std::cmp::Ordering::Greater,
                    "leaf chain out of order at page {}",
                    page_no
                );
            }
            prev = Some(key);
            chained_entries += 1;
        }
        chained_leaves += 1;
        page_no = leaf.right_sibling();
    }
    assert_eq!(chained_entries, stats.entry_count, "leaf chain misses entries");
    assert_eq!(chained_leaves, stats.leaf_count, "leaf chain misses leaves");

    assert_eq!(
        bm.pinned_page_count(file_id),
        0,
        "tree walk must leave no pins"
    );
    stats
}

#[allow(clippy::too_many_arguments)]
fn walk_node<K: IndexKey>(
    bm: &BufferManager,
    file_id: u32,
    page_no: u32,
    is_leaf: bool,
    low: Option<K>,
    high: Option<K>,
    depth: usize,
    stats: &mut TreeStats,
    leftmost_leaf: &mut u32,
) {
    let page = read_page_copy(bm, file_id, page_no);

    if is_leaf {
        let leaf = LeafView::<K>::new(&page);
        for i in 0..leaf.len() {
            let key = leaf.key_at(i);
            if i > 0 {
                assert_ne!(
                    leaf.key_at(i - 1).key_cmp(&key),
                    std::cmp::Ordering::Greater,
                    "leaf {} keys out of order",
                    page_no
                );
            }
            if let Some(low) = &low {
                assert_ne!(
                    key.key_cmp(low),
                    std::cmp::Ordering::Less,
                    "leaf {} key below separator bound",
                    page_no
                );
            }
            if let Some(high) = &high {
                assert_eq!(
                    key.key_cmp(high),
                    std::cmp::Ordering::Less,
                    "leaf {} key at or above separator bound",
                    page_no
                );
            }
        }
        stats.entry_count += leaf.len();
        stats.leaf_count += 1;
        if stats.depth == 0 {
            stats.depth = depth;
            *leftmost_leaf = page_no;
        } else {
            assert_eq!(stats.depth, depth, "leaf depth not uniform");
        }
        return;
    }

    let node = InternalView::<K>::new(&page);
    assert!(node.len() >= 1, "internal node {} has no separators", page_no);
    for i in 0..node.len() {
        if i > 0 {
            assert_ne!(
                node.key_at(i - 1).key_cmp(&node.key_at(i)),
                std::cmp::Ordering::Greater,
                "internal {} separators out of order",
                page_no
            );
        }
    }

    let children_are_leaves = node.level() == 1;
    for i in 0..=node.len() {
        let child_low = if i == 0 { low } else { Some(node.key_at(i - 1)) };
        let child_high = if i == node.len() {
            high
        } else {
            Some(node.key_at(i))
        };
        walk_node::<K>(
            bm,
            file_id,
            node.child_at(i),
            children_are_leaves,
            child_low,
            child_high,
            depth + 1,
            stats,
            leftmost_leaf,
        );
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_single_insert_then_exact_scan() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "single");

    index.insert_entry(42, RecordId::new(5, 3)).unwrap();
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);

    index.start_scan(42, RangeOp::Gte, 42, RangeOp::Lte).unwrap();
    assert_eq!(index.scan_next().unwrap(), RecordId::new(5, 3));
    assert!(matches!(
        index.scan_next(),
        Err(ArborError::IndexScanCompleted)
    ));
    index.end_scan().unwrap();
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);
}

#[test]
fn test_fill_to_first_split() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "split");

    let cap = index.leaf_occupancy() as i32;
    assert_eq!(cap, 408);

    // Capacity inserts fit the root leaf; one more forces the split.
    for key in 0..cap {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }
    assert!(index.is_root_leaf());

    index.insert_entry(cap, rid(cap as u32)).unwrap();
    assert!(!index.is_root_leaf());
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);

    // Root is now an internal node with one separator: the middle of the
    // N+1 sorted entries, copied up from the right leaf.
    let root_page = read_page_copy(&bm, index.file_id(), index.root_page_no());
    let root = InternalView::<i32>::new(&root_page);
    assert_eq!(root.level(), 1);
    assert_eq!(root.len(), 1);
    let middle = (cap + 1) / 2;
    assert_eq!(root.key_at(0), middle);

    let left_page = read_page_copy(&bm, index.file_id(), root.child_at(0));
    let right_page = read_page_copy(&bm, index.file_id(), root.child_at(1));
    let left = LeafView::<i32>::new(&left_page);
    let right = LeafView::<i32>::new(&right_page);
    assert_eq!(left.len() as i32, middle);
    assert_eq!(right.len() as i32, cap + 1 - middle);
    assert_eq!(left.right_sibling(), root.child_at(1));
    assert_eq!(right.right_sibling(), INVALID_PAGE);
    assert_eq!(right.key_at(0), middle);

    let stats = check_tree(&bm, &index);
    assert_eq!(stats.entry_count as i32, cap + 1);
    assert_eq!(stats.leaf_count, 2);
    assert_eq!(stats.depth, 2);
}

#[test]
fn test_bounded_scan_with_strict_operators() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "bounds");

    for key in 0..100 {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }

    index.start_scan(20, RangeOp::Gt, 80, RangeOp::Lt).unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();

    let expected: Vec<_> = (21..=79).map(|k| rid(k as u32)).collect();
    assert_eq!(rids, expected);
}

#[test]
fn test_inclusive_scan_bounds() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "inclusive");

    for key in 0..50 {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }

    index.start_scan(10, RangeOp::Gte, 15, RangeOp::Lte).unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();

    let expected: Vec<_> = (10..=15).map(|k| rid(k as u32)).collect();
    assert_eq!(rids, expected);
}

#[test]
fn test_duplicate_keys_scan_in_rid_order() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "dups");

    let r1 = RecordId::new(1, 7);
    let r2 = RecordId::new(2, 7);
    let r3 = RecordId::new(3, 7);
    // Inserted out of order; the scan must come back sorted by page_no.
    index.insert_entry(10, r2).unwrap();
    index.insert_entry(10, r1).unwrap();
    index.insert_entry(10, r3).unwrap();
    index.insert_entry(5, rid(99)).unwrap();

    index.start_scan(10, RangeOp::Gte, 10, RangeOp::Lte).unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();

    assert_eq!(rids, vec![r1, r2, r3]);
}

#[test]
fn test_string_keys() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<StringKey>(&bm, "fruit");

    index
        .insert_entry(StringKey::new("banana____"), rid(2))
        .unwrap();
    index
        .insert_entry(StringKey::new("apple_____"), rid(1))
        .unwrap();
    index
        .insert_entry(StringKey::new("cherry____"), rid(3))
        .unwrap();

    index
        .start_scan(
            StringKey::new("apple_____"),
            RangeOp::Gte,
            StringKey::new("cherry____"),
            RangeOp::Lt,
        )
        .unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();

    assert_eq!(rids, vec![rid(1), rid(2)]);
}

#[test]
fn test_double_keys() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<f64>(&bm, "doubles");

    for i in 0..200 {
        index.insert_entry(i as f64 * 0.5, rid(i)).unwrap();
    }

    index.start_scan(10.0, RangeOp::Gt, 12.0, RangeOp::Lte).unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();

    // Keys 10.5, 11.0, 11.5, 12.0 -> rids 21..=24.
    assert_eq!(rids, (21..=24).map(rid).collect::<Vec<_>>());
    check_tree(&bm, &index);
}

#[test]
fn test_cascading_splits_build_two_internal_levels() {
    let (bm, _dir) = test_env(256);
    let mut index = empty_index::<i32>(&bm, "cascade");

    const COUNT: i32 = 120_000;
    for key in 0..COUNT {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);

    let stats = check_tree(&bm, &index);
    assert_eq!(stats.entry_count as i32, COUNT);
    assert!(
        stats.depth >= 3,
        "expected two internal levels, got depth {}",
        stats.depth
    );

    // A full-range scan returns exactly the insert count, in order.
    index
        .start_scan(0, RangeOp::Gte, COUNT - 1, RangeOp::Lte)
        .unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();
    assert_eq!(rids.len() as i32, COUNT);
    assert_eq!(rids[0], rid(0));
    assert_eq!(rids[rids.len() - 1], rid(COUNT as u32 - 1));
}

#[test]
fn test_randomized_insert_order() {
    let (bm, _dir) = test_env(128);
    let mut index = empty_index::<i32>(&bm, "shuffled");

    let mut keys: Vec<i32> = (0..5000).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xA3B0);
    keys.shuffle(&mut rng);
    for &key in &keys {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }

    let stats = check_tree(&bm, &index);
    assert_eq!(stats.entry_count, 5000);
    assert!(stats.depth >= 2);

    index
        .start_scan(0, RangeOp::Gte, 4999, RangeOp::Lte)
        .unwrap();
    let rids = drain_scan(&mut index);
    index.end_scan().unwrap();
    assert_eq!(rids, (0..5000).map(rid).collect::<Vec<_>>());
}

// =============================================================================
// Bulk load and reopen
// =============================================================================

/// Builds a relation of fixed-schema records: a 4-byte row id, the i32 key
/// at offset 4, and trailing padding.
fn build_int_relation(bm: &BufferManager, name: &str, keys: &[i32]) -> Vec<RecordId> {
    let relation = RecordFile::create(bm, name).unwrap();
    let mut rids = Vec::new();
    for (row, &key) in keys.iter().enumerate() {
        let mut record = Vec::with_capacity(16);
        record.extend_from_slice(&(row as u32).to_le_bytes());
        record.extend_from_slice(&key.to_le_bytes());
        record.extend_from_slice(&[0u8; 8]);
        rids.push(relation.append(&record).unwrap());
    }
    relation.flush().unwrap();
    rids
}

#[test]
fn test_bulk_load_from_relation() {
    let (bm, _dir) = test_env(128);

    let keys: Vec<i32> = (0..1000).rev().collect();
    let rids = build_int_relation(&bm, "emp", &keys);

    let mut index = BTreeIndex::<i32>::new(&bm, "emp", 4).unwrap();
    assert_eq!(index.index_name(), "emp.4");
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);

    let stats = check_tree(&bm, &index);
    assert_eq!(stats.entry_count, 1000);

    // Key k was row (999 - k): round-trip each through an exact scan.
    for key in [0, 1, 499, 998, 999] {
        index.start_scan(key, RangeOp::Gte, key, RangeOp::Lte).unwrap();
        let found = drain_scan(&mut index);
        index.end_scan().unwrap();
        assert_eq!(found, vec![rids[(999 - key) as usize]]);
    }
}

#[test]
fn test_reopen_validates_meta_and_preserves_tree() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: PathBuf::from(dir.path()),
        buffer_pool_frames: 128,
        fsync_enabled: false,
    };

    let keys: Vec<i32> = (0..2000).collect();
    {
        let bm = BufferManager::new(&config).unwrap();
        build_int_relation(&bm, "emp", &keys);
        let index = BTreeIndex::<i32>::new(&bm, "emp", 4).unwrap();
        assert!(!index.is_root_leaf());
        // Dropped here: meta re-synced, file flushed.
    }

    {
        let bm = BufferManager::new(&config).unwrap();

        // Same parameters: opens and serves the same key sequence.
        let mut index = BTreeIndex::<i32>::new(&bm, "emp", 4).unwrap();
        assert!(!index.is_root_leaf());
        let stats = check_tree(&bm, &index);
        assert_eq!(stats.entry_count, 2000);

        index.start_scan(0, RangeOp::Gte, 1999, RangeOp::Lte).unwrap();
        let rids = drain_scan(&mut index);
        index.end_scan().unwrap();
        assert_eq!(rids.len(), 2000);
    }

    {
        let bm = BufferManager::new(&config).unwrap();

        // Wrong key type for the same index file: rejected.
        let result = BTreeIndex::<f64>::new(&bm, "emp", 4);
        assert!(matches!(result, Err(ArborError::BadIndexInfo(_))));
    }
}

#[test]
fn test_reopen_single_leaf_tree() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = StorageConfig {
        data_dir: PathBuf::from(dir.path()),
        buffer_pool_frames: 64,
        fsync_enabled: false,
    };

    {
        let bm = BufferManager::new(&config).unwrap();
        build_int_relation(&bm, "tiny", &[7, 3, 5]);
        BTreeIndex::<i32>::new(&bm, "tiny", 4).unwrap();
    }

    {
        let bm = BufferManager::new(&config).unwrap();
        let mut index = BTreeIndex::<i32>::new(&bm, "tiny", 4).unwrap();
        assert!(index.is_root_leaf());

        index.start_scan(3, RangeOp::Gte, 7, RangeOp::Lte).unwrap();
        let rids = drain_scan(&mut index);
        index.end_scan().unwrap();
        assert_eq!(rids.len(), 3);
    }
}

#[test]
fn test_delete_on_close_removes_file() {
    let (bm, _dir) = test_env(64);

    {
        let mut index = empty_index::<i32>(&bm, "gone");
        index.insert_entry(1, rid(1)).unwrap();
        index.set_delete_on_close(true);
    }
    assert!(!bm.disk().exists("gone.0"));
}

// =============================================================================
// Failure cases and pin discipline
// =============================================================================

#[test]
fn test_bad_opcodes_and_bad_range() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "bad");
    index.insert_entry(5, rid(5)).unwrap();

    assert!(matches!(
        index.start_scan(5, RangeOp::Lt, 10, RangeOp::Lt),
        Err(ArborError::BadOpcodes)
    ));
    assert!(matches!(
        index.start_scan(5, RangeOp::Gt, 10, RangeOp::Gte),
        Err(ArborError::BadOpcodes)
    ));
    assert!(matches!(
        index.start_scan(10, RangeOp::Gte, 5, RangeOp::Lte),
        Err(ArborError::BadScanRange)
    ));
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);
}

#[test]
fn test_scan_calls_require_start() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "nostart");

    assert!(matches!(
        index.scan_next(),
        Err(ArborError::ScanNotInitialized)
    ));
    assert!(matches!(
        index.end_scan(),
        Err(ArborError::ScanNotInitialized)
    ));
}

#[test]
fn test_no_such_key_on_empty_tree() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "empty");

    assert!(matches!(
        index.start_scan(1, RangeOp::Gte, 10, RangeOp::Lte),
        Err(ArborError::NoSuchKeyFound)
    ));
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);
    // The failed start leaves no scan behind.
    assert!(matches!(
        index.scan_next(),
        Err(ArborError::ScanNotInitialized)
    ));
}

#[test]
fn test_no_such_key_above_all_keys() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "aboveall");
    for key in 0..10 {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }

    assert!(matches!(
        index.start_scan(20, RangeOp::Gt, 30, RangeOp::Lt),
        Err(ArborError::NoSuchKeyFound)
    ));
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);
}

#[test]
fn test_scan_ends_immediately_when_gap_spans_bounds() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "gap");
    for key in [1, 2, 3, 4, 10] {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }

    // The first entry above the low bound is 10, which already violates
    // the high bound: the scan starts but yields nothing.
    index.start_scan(5, RangeOp::Gt, 7, RangeOp::Lt).unwrap();
    assert!(matches!(
        index.scan_next(),
        Err(ArborError::IndexScanCompleted)
    ));
    index.end_scan().unwrap();
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);
}

#[test]
fn test_exactly_one_pin_held_during_scan() {
    let (bm, _dir) = test_env(64);
    let mut index = empty_index::<i32>(&bm, "pins");

    // Enough keys for several leaves, so the scan crosses pages.
    for key in 0..1500 {
        index.insert_entry(key, rid(key as u32)).unwrap();
    }
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);

    index.start_scan(0, RangeOp::Gte, 1499, RangeOp::Lte).unwrap();
    assert_eq!(bm.pinned_page_count(index.file_id()), 1);

    for _ in 0..1000 {
        index.scan_next().unwrap();
        assert_eq!(bm.pinned_page_count(index.file_id()), 1);
    }

    // Restarting an in-progress scan first ends it; the pin moves to the
    // new scan's leaf.
    index.start_scan(100, RangeOp::Gte, 200, RangeOp::Lte).unwrap();
    assert_eq!(bm.pinned_page_count(index.file_id()), 1);

    index.end_scan().unwrap();
    assert_eq!(bm.pinned_page_count(index.file_id()), 0);
}

#[test]
fn test_relation_name_too_long_rejected() {
    let (bm, _dir) = test_env(64);
    let name = "a_very_long_relation_name_indeed";
    assert!(matches!(
        BTreeIndex::<i32>::new(&bm, name, 0),
        Err(ArborError::BadIndexInfo(_))
    ));
}

#[test]
fn test_index_over_missing_relation_fails() {
    let (bm, _dir) = test_env(64);
    assert!(matches!(
        BTreeIndex::<i32>::new(&bm, "absent", 0),
        Err(ArborError::FileNotFound(_))
    ));
}
