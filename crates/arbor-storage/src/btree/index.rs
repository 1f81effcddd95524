//! B+Tree index operations: construction, insertion, and range scans.

use super::key::IndexKey;
use super::meta::{IndexMetaPage, RELATION_NAME_CAP};
use super::node::{internal_capacity, leaf_capacity, InternalView, InternalViewMut, LeafView, LeafViewMut};
use crate::bufmgr::BufferManager;
use crate::relation::{RecordFile, RecordId};
use arbor_common::page::{PageNo, INVALID_PAGE};
use arbor_common::{ArborError, Result};
use log::{debug, info, warn};
use std::cmp::Ordering;

/// Page number of the meta page. Page 0 is never used.
const META_PAGE_NO: PageNo = 1;
/// Page number of the initial root.
const INITIAL_ROOT_PAGE_NO: PageNo = 2;

/// Comparison operators accepted by `start_scan`.
///
/// The low bound takes `Gt`/`Gte`, the high bound `Lt`/`Lte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Lt,
    Lte,
    Gte,
    Gt,
}

/// Split signal carried up the insertion recursion: the promoted separator
/// key and the newly allocated right sibling.
struct SplitEntry<K> {
    key: K,
    right_page_no: PageNo,
}

/// State of the active scan. `next_entry` is `None` once the scan is
/// exhausted; while the state exists, the leaf at `page_no` stays pinned.
struct ScanState<K> {
    low: K,
    low_op: RangeOp,
    high: K,
    high_op: RangeOp,
    page_no: PageNo,
    next_entry: Option<usize>,
}

fn satisfies_low<K: IndexKey>(key: &K, low: &K, op: RangeOp) -> bool {
    match op {
        RangeOp::Gt => key.key_cmp(low) == Ordering::Greater,
        RangeOp::Gte => key.key_cmp(low) != Ordering::Less,
        _ => false,
    }
}

fn satisfies_high<K: IndexKey>(key: &K, high: &K, op: RangeOp) -> bool {
    match op {
        RangeOp::Lt => key.key_cmp(high) == Ordering::Less,
        RangeOp::Lte => key.key_cmp(high) != Ordering::Greater,
        _ => false,
    }
}

/// A B+Tree index over one attribute of a relation.
///
/// The index file is named `"<relation_name>.<attr_byte_offset>"`. On
/// construction the file is either opened and validated against the caller
/// parameters, or created and bulk-loaded from the relation. At most one
/// scan is active per index instance.
pub struct BTreeIndex<'a, K: IndexKey> {
    buf: &'a BufferManager,
    file_id: u32,
    index_name: String,
    attr_byte_offset: usize,
    root_page_no: PageNo,
    is_root_leaf: bool,
    leaf_occupancy: usize,
    node_occupancy: usize,
    scan: Option<ScanState<K>>,
    delete_on_close: bool,
}

impl<'a, K: IndexKey> BTreeIndex<'a, K> {
    /// Opens or creates the index for `relation_name` over the attribute at
    /// `attr_byte_offset`.
    ///
    /// If the index file exists, its meta page must match all parameters
    /// (including the key type), otherwise `BadIndexInfo` is returned. If
    /// it does not exist, it is created and every record of the relation is
    /// inserted.
    pub fn new(
        buf: &'a BufferManager,
        relation_name: &str,
        attr_byte_offset: usize,
    ) -> Result<Self> {
        if relation_name.len() >= RELATION_NAME_CAP {
            return Err(ArborError::BadIndexInfo(format!(
                "relation name longer than {} characters",
                RELATION_NAME_CAP - 1
            )));
        }

        let index_name = format!("{}.{}", relation_name, attr_byte_offset);
        let existed = buf.disk().exists(&index_name);
        let file_id = buf.disk().attach(&index_name)?;

        let mut index = Self {
            buf,
            file_id,
            index_name,
            attr_byte_offset,
            root_page_no: INVALID_PAGE,
            is_root_leaf: true,
            leaf_occupancy: leaf_capacity(K::SIZE),
            node_occupancy: internal_capacity(K::SIZE),
            scan: None,
            delete_on_close: false,
        };

        if existed {
            index.open_existing(relation_name)?;
        } else {
            index.create_new(relation_name)?;
            index.bulk_load(relation_name)?;
        }
        Ok(index)
    }

    /// Returns the derived index file name.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Returns the index file id.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Returns the current root page number.
    pub fn root_page_no(&self) -> PageNo {
        self.root_page_no
    }

    /// Returns true iff the tree is a single leaf node.
    pub fn is_root_leaf(&self) -> bool {
        self.is_root_leaf
    }

    /// Returns the leaf entry capacity for this key type.
    pub fn leaf_occupancy(&self) -> usize {
        self.leaf_occupancy
    }

    /// Returns the internal separator capacity for this key type.
    pub fn node_occupancy(&self) -> usize {
        self.node_occupancy
    }

    /// Requests deletion of the index file when this handle is dropped.
    pub fn set_delete_on_close(&mut self, delete: bool) {
        self.delete_on_close = delete;
    }

    fn open_existing(&mut self, relation_name: &str) -> Result<()> {
        let frame = self.buf.read_page(self.file_id, META_PAGE_NO)?;
        let meta = {
            let guard = frame.read_data();
            IndexMetaPage::from_bytes(&**guard)
        };
        self.buf.unpin_page(self.file_id, META_PAGE_NO, false);
        let meta = meta?;

        if meta.relation_name != relation_name {
            return Err(ArborError::BadIndexInfo(format!(
                "relation name mismatch: index built for {:?}",
                meta.relation_name
            )));
        }
        if meta.attr_byte_offset as usize != self.attr_byte_offset {
            return Err(ArborError::BadIndexInfo(format!(
                "attribute offset mismatch: index built at offset {}",
                meta.attr_byte_offset
            )));
        }
        if meta.attr_type != K::DATATYPE {
            return Err(ArborError::BadIndexInfo(format!(
                "attribute type mismatch: index built over {}",
                meta.attr_type
            )));
        }

        self.root_page_no = meta.root_page_no;
        self.is_root_leaf = meta.is_root_leaf;
        Ok(())
    }

    fn create_new(&mut self, relation_name: &str) -> Result<()> {
        // Page 0 is reserved and never used; the meta page and initial
        // root land on pages 1 and 2.
        let (zero_no, _) = self.buf.alloc_page(self.file_id)?;
        self.buf.unpin_page(self.file_id, zero_no, false);

        let (meta_no, _) = self.buf.alloc_page(self.file_id)?;
        self.buf.unpin_page(self.file_id, meta_no, false);
        if meta_no != META_PAGE_NO {
            return Err(ArborError::TreeCorrupted(format!(
                "meta page allocated at page {} instead of {}",
                meta_no, META_PAGE_NO
            )));
        }

        let (root_no, root_frame) = self.buf.alloc_page(self.file_id)?;
        {
            let mut guard = root_frame.write_data();
            LeafViewMut::<K>::new(&mut **guard).init();
        }
        self.buf.unpin_page(self.file_id, root_no, true);

        let meta = IndexMetaPage {
            relation_name: relation_name.to_string(),
            attr_byte_offset: self.attr_byte_offset as u32,
            attr_type: K::DATATYPE,
            root_page_no: root_no,
            is_root_leaf: true,
        };
        let meta_frame = self.buf.read_page(self.file_id, META_PAGE_NO)?;
        {
            let mut guard = meta_frame.write_data();
            meta.write_to(&mut **guard);
        }
        self.buf.unpin_page(self.file_id, META_PAGE_NO, true);

        debug_assert_eq!(root_no, INITIAL_ROOT_PAGE_NO);
        self.root_page_no = root_no;
        self.is_root_leaf = true;
        Ok(())
    }

    fn bulk_load(&mut self, relation_name: &str) -> Result<()> {
        let relation = RecordFile::open(self.buf, relation_name)?;
        let mut count = 0u64;
        for item in relation.scan()? {
            let (rid, record) = item?;
            if record.len() < self.attr_byte_offset + K::SIZE {
                return Err(ArborError::BadIndexInfo(format!(
                    "attribute at offset {} does not fit record of {} bytes",
                    self.attr_byte_offset,
                    record.len()
                )));
            }
            let key = K::from_record(&record, self.attr_byte_offset);
            self.insert_entry(key, rid)?;
            count += 1;
        }
        info!(
            "bulk load of index {} complete: {} entries",
            self.index_name, count
        );
        Ok(())
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Inserts a `(key, rid)` entry.
    ///
    /// Duplicate keys are permitted and ordered by `rid.page_no`. Splits
    /// propagate upward on the recursion unwind; if the root splits, a new
    /// internal root is allocated and the tree grows by one level.
    pub fn insert_entry(&mut self, key: K, rid: RecordId) -> Result<()> {
        let split = if self.is_root_leaf {
            self.leaf_insert(self.root_page_no, key, rid)?
        } else {
            self.insert_into_subtree(self.root_page_no, key, rid)?
        };

        if let Some(split) = split {
            let (new_root_no, frame) = self.buf.alloc_page(self.file_id)?;
            {
                let mut guard = frame.write_data();
                let mut root = InternalViewMut::<K>::new(&mut **guard);
                root.init(if self.is_root_leaf { 1 } else { 0 });
                root.write_entries(&[split.key], &[self.root_page_no, split.right_page_no]);
            }
            self.buf.unpin_page(self.file_id, new_root_no, true);

            debug!(
                "root split: new root at page {}, children {} and {}",
                new_root_no, self.root_page_no, split.right_page_no
            );
            self.root_page_no = new_root_no;
            self.is_root_leaf = false;
        }
        Ok(())
    }

    /// Descends into the subtree rooted at an internal node, then applies
    /// any child split to that node on the unwind.
    fn insert_into_subtree(
        &self,
        page_no: PageNo,
        key: K,
        rid: RecordId,
    ) -> Result<Option<SplitEntry<K>>> {
        let frame = self.buf.read_page(self.file_id, page_no)?;
        let (child_no, child_is_leaf) = {
            let guard = frame.read_data();
            let node = InternalView::<K>::new(&**guard);
            let idx = node.route(&key);
            (node.child_at(idx), node.level() == 1)
        };
        self.buf.unpin_page(self.file_id, page_no, false);

        let child_split = if child_is_leaf {
            self.leaf_insert(child_no, key, rid)?
        } else {
            self.insert_into_subtree(child_no, key, rid)?
        };

        match child_split {
            None => Ok(None),
            Some(split) => self.insert_separator(page_no, split),
        }
    }

    /// Inserts an entry into a leaf, splitting it when full.
    fn leaf_insert(&self, page_no: PageNo, key: K, rid: RecordId) -> Result<Option<SplitEntry<K>>> {
        let frame = self.buf.read_page(self.file_id, page_no)?;
        let mut guard = frame.write_data();
        let mut leaf = LeafViewMut::<K>::new(&mut **guard);

        if leaf.as_view().len() < self.leaf_occupancy {
            let pos = leaf.as_view().insert_position(&key, &rid);
            leaf.insert_at(pos, &key, rid);
            drop(guard);
            self.buf.unpin_page(self.file_id, page_no, true);
            return Ok(None);
        }

        // Split: materialize all entries plus the new one, keep the lower
        // half here and move the upper half to a fresh right sibling. The
        // middle key is copied up: it stays in the right leaf and becomes
        // the promoted separator.
        let mut entries = leaf.as_view().entries();
        let pos = leaf.as_view().insert_position(&key, &rid);
        entries.insert(pos, (key, rid));

        let mid = entries.len() / 2;
        let middle_key = entries[mid].0;
        let old_right_sibling = leaf.as_view().right_sibling();
        drop(guard);

        let (new_page_no, new_frame) = self.buf.alloc_page(self.file_id)?;
        {
            let mut guard = new_frame.write_data();
            let mut right = LeafViewMut::<K>::new(&mut **guard);
            right.init();
            right.write_entries(&entries[mid..]);
            right.set_right_sibling(old_right_sibling);
        }
        self.buf.unpin_page(self.file_id, new_page_no, true);

        {
            let mut guard = frame.write_data();
            let mut left = LeafViewMut::<K>::new(&mut **guard);
            left.write_entries(&entries[..mid]);
            left.set_right_sibling(new_page_no);
        }
        self.buf.unpin_page(self.file_id, page_no, true);

        debug!(
            "leaf split: page {} keeps {} entries, page {} takes {}",
            page_no,
            mid,
            new_page_no,
            entries.len() - mid
        );
        Ok(Some(SplitEntry {
            key: middle_key,
            right_page_no: new_page_no,
        }))
    }

    /// Inserts a promoted separator into an internal node, splitting it
    /// when full.
    fn insert_separator(
        &self,
        page_no: PageNo,
        split: SplitEntry<K>,
    ) -> Result<Option<SplitEntry<K>>> {
        let frame = self.buf.read_page(self.file_id, page_no)?;
        let mut guard = frame.write_data();
        let mut node = InternalViewMut::<K>::new(&mut **guard);

        if node.as_view().len() < self.node_occupancy {
            let pos = node.as_view().separator_position(&split.key);
            node.insert_at(pos, &split.key, split.right_page_no);
            drop(guard);
            self.buf.unpin_page(self.file_id, page_no, true);
            return Ok(None);
        }

        // Split: the middle key moves up and is removed from both halves;
        // its child pointer becomes the right half's leftmost child.
        let (mut keys, mut children) = node.as_view().entries();
        let pos = node.as_view().separator_position(&split.key);
        keys.insert(pos, split.key);
        children.insert(pos + 1, split.right_page_no);

        let mid = keys.len() / 2;
        let promoted = keys[mid];
        let level = node.as_view().level();
        drop(guard);

        let (new_page_no, new_frame) = self.buf.alloc_page(self.file_id)?;
        {
            let mut guard = new_frame.write_data();
            let mut right = InternalViewMut::<K>::new(&mut **guard);
            right.init(level);
            right.write_entries(&keys[mid + 1..], &children[mid + 1..]);
        }
        self.buf.unpin_page(self.file_id, new_page_no, true);

        {
            let mut guard = frame.write_data();
            let mut left = InternalViewMut::<K>::new(&mut **guard);
            left.write_entries(&keys[..mid], &children[..=mid]);
        }
        self.buf.unpin_page(self.file_id, page_no, true);

        debug!(
            "internal split: page {} keeps {} separators, page {} takes {}",
            page_no,
            mid,
            new_page_no,
            keys.len() - mid - 1
        );
        Ok(Some(SplitEntry {
            key: promoted,
            right_page_no: new_page_no,
        }))
    }

    // =========================================================================
    // Scanning
    // =========================================================================

    /// Descends from the root to the leaf whose key range contains `probe`.
    ///
    /// Internal pages are unpinned as soon as the child pointer is chosen;
    /// the returned leaf is not pinned.
    fn find_leaf(&self, probe: &K) -> Result<PageNo> {
        let mut page_no = self.root_page_no;
        if self.is_root_leaf {
            return Ok(page_no);
        }
        loop {
            let frame = self.buf.read_page(self.file_id, page_no)?;
            let (child_no, child_is_leaf) = {
                let guard = frame.read_data();
                let node = InternalView::<K>::new(&**guard);
                let idx = node.route(probe);
                (node.child_at(idx), node.level() == 1)
            };
            self.buf.unpin_page(self.file_id, page_no, false);

            page_no = child_no;
            if child_is_leaf {
                return Ok(page_no);
            }
        }
    }

    /// Begins a range scan over `(low, low_op) .. (high, high_op)`.
    ///
    /// Any scan already in progress is ended first. On success the leaf
    /// holding the first qualifying entry stays pinned until the scan
    /// advances past it or ends. Fails with `NoSuchKeyFound` when no entry
    /// satisfies the low bound; the scan state is then fully cleared.
    pub fn start_scan(&mut self, low: K, low_op: RangeOp, high: K, high_op: RangeOp) -> Result<()> {
        if self.scan.is_some() {
            self.end_scan()?;
        }
        if !matches!(low_op, RangeOp::Gt | RangeOp::Gte)
            || !matches!(high_op, RangeOp::Lt | RangeOp::Lte)
        {
            return Err(ArborError::BadOpcodes);
        }
        if low.key_cmp(&high) == Ordering::Greater {
            return Err(ArborError::BadScanRange);
        }

        let mut page_no = self.find_leaf(&low)?;
        loop {
            let frame = self.buf.read_page(self.file_id, page_no)?;
            let (found, right_sibling) = {
                let guard = frame.read_data();
                let leaf = LeafView::<K>::new(&**guard);
                let found = (0..leaf.len()).find(|&i| satisfies_low(&leaf.key_at(i), &low, low_op));
                (found, leaf.right_sibling())
            };

            if let Some(entry) = found {
                self.scan = Some(ScanState {
                    low,
                    low_op,
                    high,
                    high_op,
                    page_no,
                    next_entry: Some(entry),
                });
                return Ok(());
            }

            self.buf.unpin_page(self.file_id, page_no, false);
            if right_sibling == INVALID_PAGE {
                return Err(ArborError::NoSuchKeyFound);
            }
            page_no = right_sibling;
        }
    }

    /// Returns the record id of the next entry satisfying the scan.
    ///
    /// Fails with `ScanNotInitialized` when no scan is active and with
    /// `IndexScanCompleted` once the qualifying range is exhausted.
    pub fn scan_next(&mut self) -> Result<RecordId> {
        let state = self
            .scan
            .as_mut()
            .ok_or(ArborError::ScanNotInitialized)?;
        let Some(entry) = state.next_entry else {
            return Err(ArborError::IndexScanCompleted);
        };

        // The held pin keeps the leaf resident; this read adds a second
        // pin that is balanced before returning.
        let frame = self.buf.read_page(self.file_id, state.page_no)?;
        let (key, rid, len, right_sibling, next_key) = {
            let guard = frame.read_data();
            let leaf = LeafView::<K>::new(&**guard);
            let next_key = if entry + 1 < leaf.len() {
                Some(leaf.key_at(entry + 1))
            } else {
                None
            };
            (
                leaf.key_at(entry),
                leaf.rid_at(entry),
                leaf.len(),
                leaf.right_sibling(),
                next_key,
            )
        };
        self.buf.unpin_page(self.file_id, state.page_no, false);

        if !satisfies_high(&key, &state.high, state.high_op) {
            state.next_entry = None;
            return Err(ArborError::IndexScanCompleted);
        }

        if entry + 1 < len {
            state.next_entry = match next_key {
                Some(k) if satisfies_high(&k, &state.high, state.high_op) => Some(entry + 1),
                _ => None,
            };
        } else if right_sibling == INVALID_PAGE {
            state.next_entry = None;
        } else {
            // Pin the sibling before releasing the held leaf so an I/O
            // failure leaves the scan state untouched.
            let sibling_frame = self.buf.read_page(self.file_id, right_sibling)?;
            let first_qualifies = {
                let guard = sibling_frame.read_data();
                let leaf = LeafView::<K>::new(&**guard);
                !leaf.is_empty() && satisfies_high(&leaf.key_at(0), &state.high, state.high_op)
            };
            self.buf.unpin_page(self.file_id, state.page_no, false);
            state.page_no = right_sibling;
            state.next_entry = if first_qualifies { Some(0) } else { None };
        }

        Ok(rid)
    }

    /// Ends the active scan, releasing the pinned leaf.
    pub fn end_scan(&mut self) -> Result<()> {
        let state = self.scan.take().ok_or(ArborError::ScanNotInitialized)?;
        self.buf.unpin_page(self.file_id, state.page_no, false);
        Ok(())
    }

    /// Rewrites the meta page with the in-memory root location.
    fn sync_meta(&self) -> Result<()> {
        let frame = self.buf.read_page(self.file_id, META_PAGE_NO)?;
        let result = {
            let mut guard = frame.write_data();
            IndexMetaPage::from_bytes(&**guard).map(|mut meta| {
                meta.root_page_no = self.root_page_no;
                meta.is_root_leaf = self.is_root_leaf;
                meta.write_to(&mut **guard);
            })
        };
        self.buf.unpin_page(self.file_id, META_PAGE_NO, result.is_ok());
        result
    }
}

impl<K: IndexKey> Drop for BTreeIndex<'_, K> {
    /// Ends any active scan, re-syncs the meta page, and flushes the index
    /// file. Errors are logged and swallowed; when deletion was requested
    /// the file is removed instead of flushed.
    fn drop(&mut self) {
        if self.scan.is_some() {
            let _ = self.end_scan();
        }

        if self.delete_on_close {
            self.buf.discard_file(self.file_id);
            if let Err(e) = self.buf.disk().remove(&self.index_name) {
                warn!("failed to remove index file {}: {}", self.index_name, e);
            }
            return;
        }

        if let Err(e) = self.sync_meta() {
            warn!("failed to sync meta page of {}: {}", self.index_name, e);
        }
        if let Err(e) = self.buf.flush_file(self.file_id) {
            warn!("failed to flush index file {}: {}", self.index_name, e);
        }
    }
}

impl<K: IndexKey> std::fmt::Debug for BTreeIndex<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndex")
            .field("index_name", &self.index_name)
            .field("root_page_no", &self.root_page_no)
            .field("is_root_leaf", &self.is_root_leaf)
            .field("scan_active", &self.scan.is_some())
            .finish()
    }
}
