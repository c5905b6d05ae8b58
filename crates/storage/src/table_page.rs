//! Slotted page layout for table tuples.
//!
//! ```text
//! 0   page_id        i32
//! 4   prev_page_id   i32
//! 8   next_page_id   i32
//! 12  free_space_ptr u32   lowest byte used by tuple data
//! 16  tuple_count    u32   slots issued, including freed ones
//! 20  slot[0], slot[1], ...      each: offset u32, size u32
//! ```
//!
//! Tuples grow from the page end toward the header; the slot directory
//! grows from the header toward the end. A slot with offset 0 is freed and
//! reusable; the high bit of the size field is the tombstone for a
//! marked-but-not-applied delete.

use common::{PageId, PAGE_SIZE};
use record::codec::{Reader, Writer};
use record::{Row, Schema};

pub const TABLE_PAGE_HEADER: usize = 20;
pub const SLOT_SIZE: usize = 8;
const DELETED_FLAG: u32 = 1 << 31;

/// Largest tuple a fresh page can hold.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - TABLE_PAGE_HEADER - SLOT_SIZE;

/// Outcome of an in-page tuple update.
#[derive(Debug, PartialEq, Eq)]
pub enum UpdateResult {
    Updated,
    NotFound,
    Deleted,
    TooLarge,
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("in-page read"))
}

fn put_u32(data: &mut [u8], at: usize, v: u32) {
    data[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Read-only view over a slotted page.
pub struct TablePage<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> TablePage<'a> {
    pub fn new(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn page_id(&self) -> PageId {
        PageId(get_u32(self.data, 0) as i32)
    }

    pub fn prev_page_id(&self) -> PageId {
        PageId(get_u32(self.data, 4) as i32)
    }

    pub fn next_page_id(&self) -> PageId {
        PageId(get_u32(self.data, 8) as i32)
    }

    pub fn free_space_ptr(&self) -> u32 {
        get_u32(self.data, 12)
    }

    pub fn tuple_count(&self) -> u32 {
        get_u32(self.data, 16)
    }

    fn slot(&self, idx: u32) -> Option<(u32, u32, bool)> {
        if idx >= self.tuple_count() {
            return None;
        }
        let at = TABLE_PAGE_HEADER + idx as usize * SLOT_SIZE;
        let offset = get_u32(self.data, at);
        let raw_size = get_u32(self.data, at + 4);
        Some((offset, raw_size & !DELETED_FLAG, raw_size & DELETED_FLAG != 0))
    }

    /// True when the slot exists and has not been applied-deleted. A
    /// tombstoned slot is still live for reads.
    pub fn is_slot_live(&self, idx: u32) -> bool {
        matches!(self.slot(idx), Some((offset, _, _)) if offset != 0)
    }

    pub fn is_slot_deleted(&self, idx: u32) -> bool {
        matches!(self.slot(idx), Some((offset, _, true)) if offset != 0)
    }

    /// Decode the tuple in `idx`. Tombstoned slots are still readable;
    /// freed slots are not.
    pub fn get_tuple(&self, idx: u32, schema: &Schema) -> Option<Row> {
        let (offset, size, _) = self.slot(idx)?;
        if offset == 0 {
            return None;
        }
        let bytes = &self.data[offset as usize..(offset + size) as usize];
        let mut reader = Reader::new(bytes);
        Row::deserialize_from(&mut reader, schema).ok()
    }

    /// First slot holding a visible (non-tombstoned) tuple.
    pub fn first_tuple_slot(&self) -> Option<u32> {
        self.next_tuple_slot_from(0)
    }

    /// Next visible slot at or after `from`.
    fn next_tuple_slot_from(&self, from: u32) -> Option<u32> {
        (from..self.tuple_count()).find(|&idx| {
            matches!(self.slot(idx), Some((offset, _, deleted)) if offset != 0 && !deleted)
        })
    }

    /// Next visible slot strictly after `current`.
    pub fn next_tuple_slot(&self, current: u32) -> Option<u32> {
        self.next_tuple_slot_from(current + 1)
    }

    fn slots_end(&self, count: u32) -> usize {
        TABLE_PAGE_HEADER + count as usize * SLOT_SIZE
    }
}

/// Mutable view over a slotted page.
pub struct TablePageMut<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> TablePageMut<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn as_ref(&self) -> TablePage<'_> {
        TablePage::new(self.data)
    }

    /// Format a fresh page: empty directory, tuple space spanning to the
    /// page end, linked after `prev`.
    pub fn init(&mut self, page_id: PageId, prev: PageId) {
        self.data.fill(0);
        put_u32(self.data, 0, page_id.0 as u32);
        put_u32(self.data, 4, prev.0 as u32);
        put_u32(self.data, 8, PageId::INVALID.0 as u32);
        put_u32(self.data, 12, PAGE_SIZE as u32);
        put_u32(self.data, 16, 0);
    }

    pub fn set_prev_page_id(&mut self, prev: PageId) {
        put_u32(self.data, 4, prev.0 as u32);
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        put_u32(self.data, 8, next.0 as u32);
    }

    fn set_slot(&mut self, idx: u32, offset: u32, raw_size: u32) {
        let at = TABLE_PAGE_HEADER + idx as usize * SLOT_SIZE;
        put_u32(self.data, at, offset);
        put_u32(self.data, at + 4, raw_size);
    }

    /// Place serialized tuple bytes into the page, reusing a freed slot
    /// when one exists. Returns the slot number, or `None` when the bytes
    /// do not fit.
    pub fn insert_tuple(&mut self, bytes: &[u8]) -> Option<u32> {
        let count = self.as_ref().tuple_count();
        let reuse = (0..count).find(|&i| matches!(self.as_ref().slot(i), Some((0, _, _))));
        let directory_count = if reuse.is_some() { count } else { count + 1 };
        let slots_end = self.as_ref().slots_end(directory_count);
        let free_ptr = self.as_ref().free_space_ptr() as usize;
        if free_ptr < slots_end || free_ptr - slots_end < bytes.len() {
            return None;
        }

        let new_ptr = free_ptr - bytes.len();
        self.data[new_ptr..free_ptr].copy_from_slice(bytes);
        put_u32(self.data, 12, new_ptr as u32);

        let slot = reuse.unwrap_or(count);
        self.set_slot(slot, new_ptr as u32, bytes.len() as u32);
        if reuse.is_none() {
            put_u32(self.data, 16, count + 1);
        }
        Some(slot)
    }

    /// Set the tombstone on a live slot.
    pub fn mark_delete(&mut self, idx: u32) -> bool {
        match self.as_ref().slot(idx) {
            Some((offset, size, _)) if offset != 0 => {
                self.set_slot(idx, offset, size | DELETED_FLAG);
                true
            }
            _ => false,
        }
    }

    /// Clear the tombstone, making the tuple visible again.
    pub fn rollback_delete(&mut self, idx: u32) -> bool {
        match self.as_ref().slot(idx) {
            Some((offset, size, _)) if offset != 0 => {
                self.set_slot(idx, offset, size);
                true
            }
            _ => false,
        }
    }

    /// Free the slot for reuse. The tuple bytes become a hole; no
    /// compaction happens.
    pub fn apply_delete(&mut self, idx: u32) -> bool {
        match self.as_ref().slot(idx) {
            Some((offset, _, _)) if offset != 0 => {
                self.set_slot(idx, 0, 0);
                true
            }
            _ => false,
        }
    }

    /// Replace the tuple in `idx` with `bytes`, in place when they fit in
    /// the old region, else in freshly carved space.
    pub fn update_tuple(&mut self, idx: u32, bytes: &[u8]) -> UpdateResult {
        let Some((offset, size, deleted)) = self.as_ref().slot(idx) else {
            return UpdateResult::NotFound;
        };
        if offset == 0 {
            return UpdateResult::NotFound;
        }
        if deleted {
            return UpdateResult::Deleted;
        }
        if bytes.len() <= size as usize {
            self.data[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
            self.set_slot(idx, offset, bytes.len() as u32);
            return UpdateResult::Updated;
        }
        let slots_end = self.as_ref().slots_end(self.as_ref().tuple_count());
        let free_ptr = self.as_ref().free_space_ptr() as usize;
        if free_ptr - slots_end < bytes.len() {
            return UpdateResult::TooLarge;
        }
        let new_ptr = free_ptr - bytes.len();
        self.data[new_ptr..free_ptr].copy_from_slice(bytes);
        put_u32(self.data, 12, new_ptr as u32);
        self.set_slot(idx, new_ptr as u32, bytes.len() as u32);
        UpdateResult::Updated
    }
}

/// Serialize a row for in-page storage.
pub fn tuple_bytes(row: &Row, schema: &Schema) -> Vec<u8> {
    let mut writer = Writer::with_capacity(row.serialized_size(schema));
    row.serialize_to(&mut writer, schema);
    writer.into_bytes()
}
