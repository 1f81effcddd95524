//! Buffer pool manager.

use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::ClockReplacer;
use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::{ArborError, Result};
use parking_lot::Mutex;

/// A dirty page that was evicted from the buffer pool.
///
/// The caller must write it to disk to prevent data loss.
#[derive(Debug)]
pub struct EvictedPage {
    pub page_id: PageId,
    pub data: Box<[u8; PAGE_SIZE]>,
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with a page table, a free frame
/// list, clock replacement, and pin counting. Every page handed out is
/// pinned; callers unpin with a dirty flag once done.
pub struct BufferPool {
    config: BufferPoolConfig,
    frames: Vec<BufferFrame>,
    page_table: PageTable,
    free_list: Mutex<Vec<FrameId>>,
    replacer: ClockReplacer,
}

impl BufferPool {
    /// Creates a new buffer pool.
    pub fn new(config: BufferPoolConfig) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start free; pop from the back so low frame ids go first.
        let free_list: Vec<_> = (0..num_frames).rev().map(|i| FrameId(i as u32)).collect();

        Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
        }
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently resident.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Returns true if the page is resident in the pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Fetches a resident page, pinning it.
    ///
    /// Returns None if the page is not in the pool; the caller is expected
    /// to load it from disk via `load_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Option<&BufferFrame> {
        let frame_id = self.page_table.get(page_id)?;
        let frame = &self.frames[frame_id.0 as usize];
        frame.pin();
        self.replacer.record_access(frame_id);
        Some(frame)
    }

    /// Claims a frame for a new page: free list first, then eviction.
    fn allocate_frame(&self) -> Result<(FrameId, Option<EvictedPage>)> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok((frame_id, None));
        }

        let victim_id = self
            .replacer
            .evict(|fid| self.frames[fid.0 as usize].pin_count() == 0)
            .ok_or(ArborError::BufferPoolFull)?;

        let frame = &self.frames[victim_id.0 as usize];

        // Hand back dirty victims so the caller can persist them.
        let evicted = match (frame.is_dirty(), frame.page_id()) {
            (true, Some(page_id)) => {
                let guard = frame.read_data();
                let mut data = Box::new([0u8; PAGE_SIZE]);
                data.copy_from_slice(&**guard);
                Some(EvictedPage { page_id, data })
            }
            _ => None,
        };

        if let Some(old_page_id) = frame.page_id() {
            self.page_table.remove(old_page_id);
        }

        Ok((victim_id, evicted))
    }

    /// Assigns a frame to a new page and pins it.
    ///
    /// If the page is already resident, the existing frame is pinned and
    /// returned. Any dirty page evicted to make room is handed back for the
    /// caller to write out.
    pub fn new_page(&self, page_id: PageId) -> Result<(&BufferFrame, Option<EvictedPage>)> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            self.replacer.record_access(frame_id);
            return Ok((frame, None));
        }

        let (frame_id, evicted) = self.allocate_frame()?;

        let frame = &self.frames[frame_id.0 as usize];
        frame.reset();
        frame.set_page_id(Some(page_id));
        frame.pin();

        self.page_table.insert(page_id, frame_id);
        self.replacer.insert(frame_id);
        self.replacer.record_access(frame_id);

        Ok((frame, evicted))
    }

    /// Loads page data read from disk into the pool, pinned.
    pub fn load_page(
        &self,
        page_id: PageId,
        data: &[u8],
    ) -> Result<(&BufferFrame, Option<EvictedPage>)> {
        let (frame, evicted) = self.new_page(page_id)?;
        frame.copy_from(data);
        Ok((frame, evicted))
    }

    /// Unpins a page, optionally marking it dirty.
    ///
    /// Returns false if the page is not resident. Unpinning a page that is
    /// not pinned is a no-op.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(frame_id) = self.page_table.get(page_id) else {
            return false;
        };
        let frame = &self.frames[frame_id.0 as usize];
        if is_dirty {
            frame.set_dirty(true);
        }
        frame.unpin();
        true
    }

    /// Flushes all dirty pages of one file through the callback.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_file<F>(&self, file_id: u32, mut flush_fn: F) -> Result<usize>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut targets = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            if page_id.file_id == file_id {
                targets.push(frame_id);
            }
        });

        let mut flushed = 0;
        for frame_id in targets {
            let frame = &self.frames[frame_id.0 as usize];
            if !frame.is_dirty() {
                continue;
            }
            let Some(page_id) = frame.page_id() else {
                continue;
            };
            let data = frame.read_data();
            flush_fn(page_id, &**data)?;
            frame.set_dirty(false);
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Flushes all dirty pages through the callback.
    pub fn flush_all<F>(&self, mut flush_fn: F) -> Result<usize>
    where
        F: FnMut(PageId, &[u8]) -> Result<()>,
    {
        let mut files = std::collections::HashSet::new();
        self.page_table.for_each(|page_id, _| {
            files.insert(page_id.file_id);
        });

        let mut flushed = 0;
        for file_id in files {
            flushed += self.flush_file(file_id, &mut flush_fn)?;
        }
        Ok(flushed)
    }

    /// Discards all resident pages of a file without writing them back.
    ///
    /// Used when a file is being deleted. Pinned pages are discarded too:
    /// the file is going away.
    pub fn discard_file(&self, file_id: u32) {
        let mut targets = Vec::new();
        self.page_table.for_each(|page_id, frame_id| {
            if page_id.file_id == file_id {
                targets.push((page_id, frame_id));
            }
        });

        let mut free_list = self.free_list.lock();
        for (page_id, frame_id) in targets {
            self.page_table.remove(page_id);
            self.replacer.remove(frame_id);
            self.frames[frame_id.0 as usize].reset();
            free_list.push(frame_id);
        }
    }

    /// Returns the number of pinned resident pages belonging to a file.
    pub fn pinned_page_count(&self, file_id: u32) -> usize {
        let mut pinned = 0;
        self.page_table.for_each(|page_id, frame_id| {
            if page_id.file_id == file_id && self.frames[frame_id.0 as usize].is_pinned() {
                pinned += 1;
            }
        });
        pinned
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_frames = 0;
        let mut dirty_frames = 0;

        self.page_table.for_each(|_, frame_id| {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_frames += 1;
            }
            if frame.is_dirty() {
                dirty_frames += 1;
            }
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames,
            dirty_frames,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}
