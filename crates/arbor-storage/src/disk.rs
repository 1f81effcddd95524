//! Disk manager for page-level file I/O.

use arbor_common::page::{PageNo, PAGE_SIZE};
use arbor_common::{ArborError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

/// Manages reading and writing pages of named files under a data directory.
///
/// Files are attached by name and addressed by the `FileId` handed out at
/// attach time. Relation files and index files share the same manager; an
/// index derives its file name from the relation name and attribute offset.
pub struct DiskManager {
    config: DiskManagerConfig,
    /// Open file handles keyed by file id.
    files: Mutex<HashMap<u32, FileHandle>>,
    /// Name registry so a file attached twice keeps one id.
    names: Mutex<HashMap<String, u32>>,
    next_file_id: AtomicU32,
}

/// Handle for an open data file.
struct FileHandle {
    file: File,
    path: PathBuf,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager, creating the data directory if needed.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }

    /// Returns true if a file with this name exists on disk.
    pub fn exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    /// Opens (or creates) the named file and returns its id.
    ///
    /// Attaching the same name twice returns the same id.
    pub fn attach(&self, name: &str) -> Result<u32> {
        let mut names = self.names.lock();
        if let Some(&file_id) = names.get(name) {
            return Ok(file_id);
        }

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        self.files.lock().insert(
            file_id,
            FileHandle {
                file,
                path,
                num_pages,
            },
        );
        names.insert(name.to_string(), file_id);

        Ok(file_id)
    }

    /// Closes and deletes the named file.
    pub fn remove(&self, name: &str) -> Result<()> {
        if let Some(file_id) = self.names.lock().remove(name) {
            self.files.lock().remove(&file_id);
        }

        let path = self.file_path(name);
        if !path.exists() {
            return Err(ArborError::FileNotFound(name.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Reads a page from disk.
    pub fn read_page(&self, file_id: u32, page_no: PageNo) -> Result<[u8; PAGE_SIZE]> {
        let mut files = self.files.lock();
        let handle = Self::handle(&mut files, file_id)?;

        if page_no >= handle.num_pages {
            return Err(ArborError::PageNotFound { file_id, page_no });
        }

        let offset = (page_no as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        handle.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes a page to disk.
    pub fn write_page(&self, file_id: u32, page_no: PageNo, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let fsync = self.config.fsync_enabled;
        let mut files = self.files.lock();
        let handle = Self::handle(&mut files, file_id)?;

        let offset = (page_no as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(data)?;

        if fsync {
            handle.file.sync_all()?;
        }

        if page_no >= handle.num_pages {
            handle.num_pages = page_no + 1;
        }
        Ok(())
    }

    /// Allocates a new zero-filled page at the end of the file.
    ///
    /// Returns the page number of the new page. Page numbers are assigned
    /// sequentially starting from 0.
    pub fn allocate_page(&self, file_id: u32) -> Result<PageNo> {
        let fsync = self.config.fsync_enabled;
        let mut files = self.files.lock();
        let handle = Self::handle(&mut files, file_id)?;

        let page_no = handle.num_pages;
        let offset = (page_no as u64) * (PAGE_SIZE as u64);
        handle.file.seek(SeekFrom::Start(offset))?;
        handle.file.write_all(&[0u8; PAGE_SIZE])?;

        if fsync {
            handle.file.sync_all()?;
        }

        handle.num_pages = page_no + 1;
        Ok(page_no)
    }

    /// Returns the number of pages in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<u32> {
        let mut files = self.files.lock();
        Ok(Self::handle(&mut files, file_id)?.num_pages)
    }

    /// Syncs a file's pending writes to disk.
    pub fn flush(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        Self::handle(&mut files, file_id)?.file.sync_all()?;
        Ok(())
    }

    fn handle<'a>(
        files: &'a mut HashMap<u32, FileHandle>,
        file_id: u32,
    ) -> Result<&'a mut FileHandle> {
        files
            .get_mut(&file_id)
            .ok_or_else(|| ArborError::FileNotFound(format!("file id {} is not attached", file_id)))
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let files = self.files.lock();
        for handle in files.values() {
            let _ = handle.file.sync_all();
        }
    }
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager")
            .field("data_dir", &self.config.data_dir)
            .field("open_files", &self.files.lock().len())
            .finish()
    }
}
