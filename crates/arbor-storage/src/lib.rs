//! Storage engine for Arbor.
//!
//! This crate provides:
//! - Disk manager for page-level I/O over named files
//! - Buffer manager composing the buffer pool with the disk manager
//! - Relation files of byte-string records, with a scanner for bulk load
//! - A disk-backed B+Tree secondary index over one record attribute

mod btree;
mod bufmgr;
mod disk;
mod relation;

pub use btree::{
    internal_capacity, leaf_capacity, BTreeIndex, IndexKey, IndexMetaPage, InternalView, LeafView,
    RangeOp, StringKey,
};
pub use bufmgr::BufferManager;
pub use disk::{DiskManager, DiskManagerConfig};
pub use relation::{RecordFile, RecordId, RecordScan, MAX_RECORD_SIZE};
