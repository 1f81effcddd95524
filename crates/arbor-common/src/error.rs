//! Error types for Arbor.

use thiserror::Error;

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

/// Errors that can occur in Arbor operations.
#[derive(Debug, Error)]
pub enum ArborError {
    // I/O and file errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    // Storage errors
    #[error("page {page_no} not found in file {file_id}")]
    PageNotFound { file_id: u32, page_no: u32 },

    #[error("buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("page full, unable to insert record")]
    PageFull,

    #[error("record of {size} bytes exceeds page capacity of {max}")]
    RecordTooLarge { size: usize, max: usize },

    // Index errors
    #[error("index meta does not match caller parameters: {0}")]
    BadIndexInfo(String),

    #[error("scan operators must be GT/GTE for the low bound and LT/LTE for the high bound")]
    BadOpcodes,

    #[error("scan range is empty: low value exceeds high value")]
    BadScanRange,

    #[error("no key in the index satisfies the scan criteria")]
    NoSuchKeyFound,

    #[error("no scan has been initialized")]
    ScanNotInitialized,

    #[error("index scan completed")]
    IndexScanCompleted,

    #[error("index tree corrupted: {0}")]
    TreeCorrupted(String),
}
