//! Disk-backed B+Tree secondary index.
//!
//! Maps values of a single record attribute to the `RecordId`s of the
//! records containing them, supporting inserts and bounded range scans.
//! Nodes are pages of the index file; all page access is routed through the
//! buffer manager with balanced pin/unpin pairs. The tree is polymorphic
//! over the key type: the three supported attribute types share one leaf
//! and one internal node shape.
//!
//! Node layout (little-endian):
//!
//! ```text
//! Leaf page                       Internal page
//! +----------------------+ 0      +----------------------+ 0
//! | right_sibling: u32   |        | level: u32           |
//! | len: u32             | 8      | len: u32             | 8
//! +----------------------+        +----------------------+
//! | keys[cap]            |        | keys[cap]            |
//! +----------------------+        +----------------------+
//! | rids[cap]            |        | children[cap + 1]    |
//! +----------------------+        +----------------------+
//! ```
//!
//! `level` is 1 on internal nodes whose children are leaves, 0 otherwise.
//! Leaves form a singly linked chain through `right_sibling` in ascending
//! key order, terminated by `INVALID_PAGE`.

mod index;
mod key;
mod meta;
mod node;

pub use index::{BTreeIndex, RangeOp};
pub use key::{IndexKey, StringKey};
pub use meta::IndexMetaPage;
pub use node::{internal_capacity, leaf_capacity, InternalView, LeafView};
