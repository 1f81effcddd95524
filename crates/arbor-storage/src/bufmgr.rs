//! Buffer manager: pinned-page access over paged files.
//!
//! Composes the buffer pool with the disk manager. All page reads and
//! writes of the index and relation files go through here: `read_page` and
//! `alloc_page` hand out pinned frames, `unpin_page` releases them with a
//! dirty flag, and dirty pages evicted by the pool are written back to disk
//! transparently.

use crate::disk::{DiskManager, DiskManagerConfig};
use arbor_buffer::{BufferFrame, BufferPool, BufferPoolConfig};
use arbor_common::page::{PageId, PageNo};
use arbor_common::{Result, StorageConfig};

/// Pinned-page access to paged files.
pub struct BufferManager {
    disk: DiskManager,
    pool: BufferPool,
}

impl BufferManager {
    /// Creates a buffer manager from a storage configuration.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let disk = DiskManager::new(DiskManagerConfig {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        })?;
        let pool = BufferPool::new(BufferPoolConfig {
            num_frames: config.buffer_pool_frames,
        });
        Ok(Self { disk, pool })
    }

    /// Returns the underlying disk manager (file attach / exists / remove).
    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    /// Reads a page, returning a pinned frame.
    ///
    /// The page is served from the pool when resident, otherwise loaded
    /// from disk. The caller must balance this with `unpin_page`.
    pub fn read_page(&self, file_id: u32, page_no: PageNo) -> Result<&BufferFrame> {
        let page_id = PageId::new(file_id, page_no);
        if let Some(frame) = self.pool.fetch_page(page_id) {
            return Ok(frame);
        }

        let data = self.disk.read_page(file_id, page_no)?;
        let (frame, evicted) = self.pool.load_page(page_id, &data)?;
        if let Err(e) = self.write_back(evicted) {
            self.pool.unpin_page(page_id, false);
            return Err(e);
        }
        Ok(frame)
    }

    /// Allocates a new page at the end of the file, returning its page
    /// number and a pinned zeroed frame.
    pub fn alloc_page(&self, file_id: u32) -> Result<(PageNo, &BufferFrame)> {
        let page_no = self.disk.allocate_page(file_id)?;
        let page_id = PageId::new(file_id, page_no);

        let (frame, evicted) = self.pool.new_page(page_id)?;
        if let Err(e) = self.write_back(evicted) {
            self.pool.unpin_page(page_id, false);
            return Err(e);
        }
        Ok((page_no, frame))
    }

    /// Unpins a page, marking it dirty if it was modified.
    pub fn unpin_page(&self, file_id: u32, page_no: PageNo, dirty: bool) {
        self.pool.unpin_page(PageId::new(file_id, page_no), dirty);
    }

    /// Writes all dirty pages of a file to disk and syncs it.
    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        self.pool.flush_file(file_id, |page_id, data| {
            let mut page = [0u8; arbor_common::page::PAGE_SIZE];
            page.copy_from_slice(data);
            self.disk.write_page(page_id.file_id, page_id.page_no, &page)
        })?;
        self.disk.flush(file_id)
    }

    /// Drops all resident pages of a file without writing them back.
    ///
    /// Used when the file is being deleted.
    pub fn discard_file(&self, file_id: u32) {
        self.pool.discard_file(file_id);
    }

    /// Returns the number of pinned pages attributable to a file.
    ///
    /// After every public index operation this must be zero, except while
    /// a scan is active, when exactly the current leaf stays pinned.
    pub fn pinned_page_count(&self, file_id: u32) -> usize {
        self.pool.pinned_page_count(file_id)
    }

    fn write_back(&self, evicted: Option<arbor_buffer::EvictedPage>) -> Result<()> {
        if let Some(page) = evicted {
            self.disk
                .write_page(page.page_id.file_id, page.page_id.page_no, &page.data)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("disk", &self.disk)
            .finish()
    }
}
