//! Page table mapping resident pages to buffer frames.

use crate::frame::FrameId;
use arbor_common::page::PageId;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Maps resident `PageId`s to the frames holding them.
pub struct PageTable {
    entries: RwLock<HashMap<PageId, FrameId>>,
}

impl PageTable {
    /// Creates a page table sized for the given frame count.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Looks up the frame holding a page.
    #[inline]
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        self.entries.read().get(&page_id).copied()
    }

    /// Returns true if the page is resident.
    #[inline]
    pub fn contains(&self, page_id: PageId) -> bool {
        self.entries.read().contains_key(&page_id)
    }

    /// Records a page as resident in a frame.
    #[inline]
    pub fn insert(&self, page_id: PageId, frame_id: FrameId) {
        self.entries.write().insert(page_id, frame_id);
    }

    /// Removes a page mapping, returning the frame it occupied.
    #[inline]
    pub fn remove(&self, page_id: PageId) -> Option<FrameId> {
        self.entries.write().remove(&page_id)
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no pages are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` for every resident page.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(PageId, FrameId),
    {
        for (&page_id, &frame_id) in self.entries.read().iter() {
            f(page_id, frame_id);
        }
    }
}
