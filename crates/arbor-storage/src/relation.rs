//! Relation files: flat sequences of fixed-schema records.
//!
//! Records are opaque byte strings stored in slotted pages: the slot array
//! grows forward from the page header, record data grows backward from the
//! page end. The scanner walks the file in page order and yields each
//! record with its `RecordId`, which is what the B+Tree index stores.

use crate::bufmgr::BufferManager;
use arbor_common::page::{PageNo, PAGE_SIZE};
use arbor_common::{ArborError, Result};
use bytes::Bytes;

/// Identifier of a record within a relation file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Page containing the record.
    pub page_no: PageNo,
    /// Slot number within the page.
    pub slot_no: u16,
}

impl RecordId {
    /// On-page encoded size (page_no + slot_no).
    pub const SIZE: usize = 6;

    /// Creates a new record id.
    pub fn new(page_no: PageNo, slot_no: u16) -> Self {
        Self { page_no, slot_no }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.page_no, self.slot_no)
    }
}

// Page layout: slot_count u16, free_end u16, then the slot array
// (offset u16, len u16 per record); record bytes grow backward from
// PAGE_SIZE down to free_end.
const SLOT_COUNT_OFF: usize = 0;
const FREE_END_OFF: usize = 2;
const SLOT_ARRAY_OFF: usize = 4;
const SLOT_SIZE: usize = 4;

/// Largest record that fits an empty page.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - SLOT_ARRAY_OFF - SLOT_SIZE;

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn write_u16(data: &mut [u8], off: usize, value: u16) {
    data[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn page_slot_count(data: &[u8]) -> u16 {
    read_u16(data, SLOT_COUNT_OFF)
}

/// Appends a record to a page, returning its slot number.
fn page_append(data: &mut [u8], record: &[u8]) -> Result<u16> {
    let slot_count = page_slot_count(data) as usize;
    let raw_free_end = read_u16(data, FREE_END_OFF) as usize;
    // A freshly allocated page is all zeros; treat that as empty.
    let free_end = if raw_free_end == 0 {
        PAGE_SIZE
    } else {
        raw_free_end
    };

    let slot_array_end = SLOT_ARRAY_OFF + (slot_count + 1) * SLOT_SIZE;
    let new_end = match free_end.checked_sub(record.len()) {
        Some(end) if end >= slot_array_end => end,
        _ => return Err(ArborError::PageFull),
    };

    data[new_end..free_end].copy_from_slice(record);

    let slot_off = SLOT_ARRAY_OFF + slot_count * SLOT_SIZE;
    write_u16(data, slot_off, new_end as u16);
    write_u16(data, slot_off + 2, record.len() as u16);

    write_u16(data, SLOT_COUNT_OFF, (slot_count + 1) as u16);
    write_u16(data, FREE_END_OFF, new_end as u16);

    Ok(slot_count as u16)
}

/// Reads the record in a slot, if the slot exists.
fn page_record(data: &[u8], slot_no: u16) -> Option<&[u8]> {
    if slot_no >= page_slot_count(data) {
        return None;
    }
    let slot_off = SLOT_ARRAY_OFF + slot_no as usize * SLOT_SIZE;
    let offset = read_u16(data, slot_off) as usize;
    let len = read_u16(data, slot_off + 2) as usize;
    Some(&data[offset..offset + len])
}

/// An append-only relation file of byte-string records.
pub struct RecordFile<'a> {
    buf: &'a BufferManager,
    file_id: u32,
}

impl<'a> RecordFile<'a> {
    /// Creates a new relation file. Fails if the file already exists.
    pub fn create(buf: &'a BufferManager, name: &str) -> Result<Self> {
        if buf.disk().exists(name) {
            return Err(ArborError::FileAlreadyExists(name.to_string()));
        }
        let file_id = buf.disk().attach(name)?;
        Ok(Self { buf, file_id })
    }

    /// Opens an existing relation file.
    pub fn open(buf: &'a BufferManager, name: &str) -> Result<Self> {
        if !buf.disk().exists(name) {
            return Err(ArborError::FileNotFound(name.to_string()));
        }
        let file_id = buf.disk().attach(name)?;
        Ok(Self { buf, file_id })
    }

    /// Returns the file id of this relation.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Appends a record, returning its id.
    pub fn append(&self, record: &[u8]) -> Result<RecordId> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(ArborError::RecordTooLarge {
                size: record.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let page_count = self.buf.disk().num_pages(self.file_id)?;
        if page_count > 0 {
            let page_no = page_count - 1;
            match self.append_to_page(page_no, record) {
                Ok(slot_no) => return Ok(RecordId::new(page_no, slot_no)),
                Err(ArborError::PageFull) => {}
                Err(e) => return Err(e),
            }
        }

        let (page_no, frame) = self.buf.alloc_page(self.file_id)?;
        let result = page_append(&mut **frame.write_data(), record);
        self.buf.unpin_page(self.file_id, page_no, true);
        let slot_no = result?;
        Ok(RecordId::new(page_no, slot_no))
    }

    fn append_to_page(&self, page_no: PageNo, record: &[u8]) -> Result<u16> {
        let frame = self.buf.read_page(self.file_id, page_no)?;
        let result = page_append(&mut **frame.write_data(), record);
        self.buf.unpin_page(self.file_id, page_no, result.is_ok());
        result
    }

    /// Reads one record by id.
    pub fn get(&self, rid: RecordId) -> Result<Bytes> {
        let frame = self.buf.read_page(self.file_id, rid.page_no)?;
        let record = {
            let guard = frame.read_data();
            page_record(&**guard, rid.slot_no).map(Bytes::copy_from_slice)
        };
        self.buf.unpin_page(self.file_id, rid.page_no, false);
        record.ok_or_else(|| ArborError::FileNotFound(format!("record {}", rid)))
    }

    /// Flushes the relation file to disk.
    pub fn flush(&self) -> Result<()> {
        self.buf.flush_file(self.file_id)
    }

    /// Starts a scan over all records in file order.
    pub fn scan(&self) -> Result<RecordScan<'a>> {
        Ok(RecordScan {
            buf: self.buf,
            file_id: self.file_id,
            page_count: self.buf.disk().num_pages(self.file_id)?,
            page_no: 0,
            slot_no: 0,
            page: None,
        })
    }
}

/// Iterator over the records of a relation file.
///
/// Pages are copied out of the buffer pool one at a time, so no pin is held
/// between `next` calls.
pub struct RecordScan<'a> {
    buf: &'a BufferManager,
    file_id: u32,
    page_count: u32,
    page_no: PageNo,
    slot_no: u16,
    page: Option<Box<[u8; PAGE_SIZE]>>,
}

impl RecordScan<'_> {
    fn load_current_page(&self) -> Result<Box<[u8; PAGE_SIZE]>> {
        let frame = self.buf.read_page(self.file_id, self.page_no)?;
        let mut copy = Box::new([0u8; PAGE_SIZE]);
        copy.copy_from_slice(&**frame.read_data());
        self.buf.unpin_page(self.file_id, self.page_no, false);
        Ok(copy)
    }
}

impl Iterator for RecordScan<'_> {
    type Item = Result<(RecordId, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.page.is_none() {
                if self.page_no >= self.page_count {
                    return None;
                }
                match self.load_current_page() {
                    Ok(page) => self.page = Some(page),
                    Err(e) => {
                        self.page_no = self.page_count;
                        return Some(Err(e));
                    }
                }
            }

            let Some(page) = self.page.as_deref() else {
                return None;
            };
            if self.slot_no >= page_slot_count(page) {
                self.page = None;
                self.page_no += 1;
                self.slot_no = 0;
                continue;
            }

            let rid = RecordId::new(self.page_no, self.slot_no);
            let record = match page_record(page, self.slot_no) {
                Some(bytes) => Bytes::copy_from_slice(bytes),
                None => return None,
            };
            self.slot_no += 1;
            return Some(Ok((rid, record)));
        }
    }
}
