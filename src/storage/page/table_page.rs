//! Slotted table page.
//!
//! Layout: a 20-byte header {page_id, prev_page_id, next_page_id,
//! free_space_pointer, tuple_count}, a slot directory of (offset, size)
//! pairs growing upward, and tuple bytes growing downward from the page
//! end. A slot whose size has the high bit set is a tombstone; a slot
//! whose offset and size are both zero has been physically freed.

use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;

const PAGE_ID_OFFSET: usize = 0;
const PREV_PAGE_ID_OFFSET: usize = 4;
const NEXT_PAGE_ID_OFFSET: usize = 8;
const FREE_SPACE_POINTER_OFFSET: usize = 12;
const TUPLE_COUNT_OFFSET: usize = 16;
const HEADER_SIZE: usize = 20;

const SLOT_SIZE: usize = 8;

/// High bit of a slot's size field marks a logically deleted tuple.
const TOMBSTONE_MASK: u32 = 1 << 31;

/// Largest tuple an empty page can hold: everything but the header and
/// the tuple's own slot.
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - HEADER_SIZE - SLOT_SIZE;

/// Mutable view over a table page.
pub struct TablePage<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

/// Shared (read-only) view over a table page.
pub struct TablePageRef<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> TablePage<'a> {
    /// Initialize a fresh page, linking it after `prev_page_id`.
    pub fn init(
        data: &'a mut [u8; PAGE_SIZE],
        page_id: PageId,
        prev_page_id: Option<PageId>,
    ) -> Self {
        data.fill(0);
        write_u32(data, PAGE_ID_OFFSET, page_id.0);
        write_u32(data, PREV_PAGE_ID_OFFSET, PageId::to_raw(prev_page_id));
        write_u32(data, NEXT_PAGE_ID_OFFSET, PageId::to_raw(None));
        write_u32(data, FREE_SPACE_POINTER_OFFSET, PAGE_SIZE as u32);
        write_u32(data, TUPLE_COUNT_OFFSET, 0);
        Self { data }
    }

    pub fn from_data(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn page_id(&self) -> PageId {
        PageId(read_u32(self.data, PAGE_ID_OFFSET))
    }

    pub fn prev_page_id(&self) -> Option<PageId> {
        PageId::from_raw(read_u32(self.data, PREV_PAGE_ID_OFFSET))
    }

    pub fn set_prev_page_id(&mut self, page_id: Option<PageId>) {
        write_u32(self.data, PREV_PAGE_ID_OFFSET, PageId::to_raw(page_id));
    }

    pub fn next_page_id(&self) -> Option<PageId> {
        PageId::from_raw(read_u32(self.data, NEXT_PAGE_ID_OFFSET))
    }

    pub fn set_next_page_id(&mut self, page_id: Option<PageId>) {
        write_u32(self.data, NEXT_PAGE_ID_OFFSET, PageId::to_raw(page_id));
    }

    pub fn tuple_count(&self) -> u32 {
        read_u32(self.data, TUPLE_COUNT_OFFSET)
    }

    pub fn free_space(&self) -> usize {
        free_space_of(self.data)
    }

    pub fn get_tuple(&self, slot: u32) -> StorageResult<&[u8]> {
        get_tuple_in(self.data, slot)
    }

    pub fn first_tuple_slot(&self) -> Option<u32> {
        next_live_slot(self.data, 0)
    }

    pub fn next_tuple_slot(&self, slot: u32) -> Option<u32> {
        next_live_slot(self.data, slot + 1)
    }

    /// Place a tuple in the page and return its slot number.
    ///
    /// A tombstoned slot whose stored size can hold the new bytes is
    /// overwritten in place; a freed slot is refilled from the free-space
    /// region; otherwise a new slot is appended. Fails with `PageFull`
    /// when the remaining free space cannot hold the tuple.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> StorageResult<u32> {
        let size = tuple.len() as u32;
        if tuple.len() >= TOMBSTONE_MASK as usize {
            return Err(StorageError::InvalidArgument(format!(
                "tuple of {} bytes cannot be slotted",
                tuple.len()
            )));
        }

        let count = self.tuple_count();
        let mut freed_slot = None;
        for slot in 0..count {
            let (offset, raw_size) = slot_entry(self.data, slot);
            if offset == 0 && raw_size == 0 {
                if freed_slot.is_none() {
                    freed_slot = Some(slot);
                }
            } else if raw_size & TOMBSTONE_MASK != 0 && raw_size & !TOMBSTONE_MASK >= size {
                // Recycle the tombstone's region for the new tuple.
                let start = offset as usize;
                self.data[start..start + tuple.len()].copy_from_slice(tuple);
                set_slot_entry(self.data, slot, offset, size);
                return Ok(slot);
            }
        }

        if let Some(slot) = freed_slot {
            if self.free_space() < tuple.len() {
                return Err(StorageError::PageFull {
                    required: tuple.len(),
                    available: self.free_space(),
                });
            }
            let fsp = read_u32(self.data, FREE_SPACE_POINTER_OFFSET) - size;
            self.data[fsp as usize..fsp as usize + tuple.len()].copy_from_slice(tuple);
            write_u32(self.data, FREE_SPACE_POINTER_OFFSET, fsp);
            set_slot_entry(self.data, slot, fsp, size);
            return Ok(slot);
        }

        let required = tuple.len() + SLOT_SIZE;
        if self.free_space() < required {
            return Err(StorageError::PageFull {
                required,
                available: self.free_space(),
            });
        }
        let fsp = read_u32(self.data, FREE_SPACE_POINTER_OFFSET) - size;
        self.data[fsp as usize..fsp as usize + tuple.len()].copy_from_slice(tuple);
        write_u32(self.data, FREE_SPACE_POINTER_OFFSET, fsp);
        set_slot_entry(self.data, count, fsp, size);
        write_u32(self.data, TUPLE_COUNT_OFFSET, count + 1);
        Ok(count)
    }

    /// Set the tombstone bit without touching the tuple bytes.
    pub fn mark_delete(&mut self, slot: u32) -> StorageResult<()> {
        let (offset, raw_size) = self.checked_slot(slot)?;
        if offset == 0 && raw_size == 0 {
            return Err(StorageError::TupleNotFound { slot_id: slot });
        }
        set_slot_entry(self.data, slot, offset, raw_size | TOMBSTONE_MASK);
        Ok(())
    }

    /// Clear the tombstone bit, resurrecting the tuple.
    pub fn rollback_delete(&mut self, slot: u32) -> StorageResult<()> {
        let (offset, raw_size) = self.checked_slot(slot)?;
        if offset == 0 && raw_size == 0 {
            return Err(StorageError::TupleNotFound { slot_id: slot });
        }
        set_slot_entry(self.data, slot, offset, raw_size & !TOMBSTONE_MASK);
        Ok(())
    }

    /// Physically remove the tuple, compacting the tuple region and fixing
    /// up the offsets of the slots it shifted.
    pub fn apply_delete(&mut self, slot: u32) -> StorageResult<()> {
        let (offset, raw_size) = self.checked_slot(slot)?;
        if offset == 0 && raw_size == 0 {
            return Err(StorageError::TupleNotFound { slot_id: slot });
        }
        let size = raw_size & !TOMBSTONE_MASK;
        let fsp = read_u32(self.data, FREE_SPACE_POINTER_OFFSET);

        self.data
            .copy_within(fsp as usize..offset as usize, (fsp + size) as usize);
        self.shift_slots_below(offset, size as i64);
        write_u32(self.data, FREE_SPACE_POINTER_OFFSET, fsp + size);
        set_slot_entry(self.data, slot, 0, 0);
        Ok(())
    }

    /// Overwrite the tuple in `slot` with `tuple`.
    ///
    /// Returns `Ok(false)` when the page cannot absorb a growth; the
    /// caller is expected to delete and reinsert elsewhere.
    pub fn update_tuple(&mut self, slot: u32, tuple: &[u8]) -> StorageResult<bool> {
        let (offset, raw_size) = self.checked_slot(slot)?;
        if offset == 0 && raw_size == 0 || raw_size & TOMBSTONE_MASK != 0 {
            return Err(StorageError::TupleNotFound { slot_id: slot });
        }
        let old_size = raw_size;
        let new_size = tuple.len() as u32;
        let fsp = read_u32(self.data, FREE_SPACE_POINTER_OFFSET);

        if new_size <= old_size {
            // Shrink in place and compact the tuples below upward.
            let diff = old_size - new_size;
            self.data
                .copy_within(fsp as usize..offset as usize, (fsp + diff) as usize);
            self.shift_slots_below(offset, diff as i64);
            let new_offset = offset + diff;
            self.data[new_offset as usize..(new_offset + new_size) as usize]
                .copy_from_slice(tuple);
            set_slot_entry(self.data, slot, new_offset, new_size);
            write_u32(self.data, FREE_SPACE_POINTER_OFFSET, fsp + diff);
            return Ok(true);
        }

        let extra = (new_size - old_size) as usize;
        if self.free_space() < extra {
            return Ok(false);
        }
        self.data
            .copy_within(fsp as usize..offset as usize, fsp as usize - extra);
        self.shift_slots_below(offset, -(extra as i64));
        let new_offset = offset - extra as u32;
        self.data[new_offset as usize..(new_offset + new_size) as usize].copy_from_slice(tuple);
        set_slot_entry(self.data, slot, new_offset, new_size);
        write_u32(self.data, FREE_SPACE_POINTER_OFFSET, fsp - extra as u32);
        Ok(true)
    }

    fn checked_slot(&self, slot: u32) -> StorageResult<(u32, u32)> {
        let count = self.tuple_count();
        if slot >= count {
            return Err(StorageError::InvalidSlotId {
                slot_id: slot,
                max_slot: count.saturating_sub(1),
            });
        }
        Ok(slot_entry(self.data, slot))
    }

    /// Add `delta` to the offset of every occupied slot whose tuple sits
    /// below `pivot` in the page.
    fn shift_slots_below(&mut self, pivot: u32, delta: i64) {
        let count = self.tuple_count();
        for slot in 0..count {
            let (offset, raw_size) = slot_entry(self.data, slot);
            if (offset != 0 || raw_size != 0) && offset < pivot {
                set_slot_entry(self.data, slot, (offset as i64 + delta) as u32, raw_size);
            }
        }
    }
}

impl<'a> TablePageRef<'a> {
    pub fn from_data(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn page_id(&self) -> PageId {
        PageId(read_u32(self.data, PAGE_ID_OFFSET))
    }

    pub fn prev_page_id(&self) -> Option<PageId> {
        PageId::from_raw(read_u32(self.data, PREV_PAGE_ID_OFFSET))
    }

    pub fn next_page_id(&self) -> Option<PageId> {
        PageId::from_raw(read_u32(self.data, NEXT_PAGE_ID_OFFSET))
    }

    pub fn tuple_count(&self) -> u32 {
        read_u32(self.data, TUPLE_COUNT_OFFSET)
    }

    pub fn free_space(&self) -> usize {
        free_space_of(self.data)
    }

    pub fn get_tuple(&self, slot: u32) -> StorageResult<&[u8]> {
        get_tuple_in(self.data, slot)
    }

    pub fn first_tuple_slot(&self) -> Option<u32> {
        next_live_slot(self.data, 0)
    }

    pub fn next_tuple_slot(&self, slot: u32) -> Option<u32> {
        next_live_slot(self.data, slot + 1)
    }
}

fn read_u32(data: &[u8; PAGE_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn write_u32(data: &mut [u8; PAGE_SIZE], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn slot_entry(data: &[u8; PAGE_SIZE], slot: u32) -> (u32, u32) {
    let base = HEADER_SIZE + slot as usize * SLOT_SIZE;
    (read_u32(data, base), read_u32(data, base + 4))
}

fn set_slot_entry(data: &mut [u8; PAGE_SIZE], slot: u32, offset: u32, size: u32) {
    let base = HEADER_SIZE + slot as usize * SLOT_SIZE;
    write_u32(data, base, offset);
    write_u32(data, base + 4, size);
}

fn free_space_of(data: &[u8; PAGE_SIZE]) -> usize {
    let fsp = read_u32(data, FREE_SPACE_POINTER_OFFSET) as usize;
    let directory_end = HEADER_SIZE + read_u32(data, TUPLE_COUNT_OFFSET) as usize * SLOT_SIZE;
    fsp.saturating_sub(directory_end)
}

fn get_tuple_in(data: &[u8; PAGE_SIZE], slot: u32) -> StorageResult<&[u8]> {
    let count = read_u32(data, TUPLE_COUNT_OFFSET);
    if slot >= count {
        return Err(StorageError::InvalidSlotId {
            slot_id: slot,
            max_slot: count.saturating_sub(1),
        });
    }
    let (offset, raw_size) = slot_entry(data, slot);
    if offset == 0 && raw_size == 0 || raw_size & TOMBSTONE_MASK != 0 {
        return Err(StorageError::TupleNotFound { slot_id: slot });
    }
    Ok(&data[offset as usize..(offset + raw_size) as usize])
}

fn next_live_slot(data: &[u8; PAGE_SIZE], from: u32) -> Option<u32> {
    let count = read_u32(data, TUPLE_COUNT_OFFSET);
    (from..count).find(|&slot| {
        let (offset, raw_size) = slot_entry(data, slot);
        !(offset == 0 && raw_size == 0) && raw_size & TOMBSTONE_MASK == 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn new_page(data: &mut [u8; PAGE_SIZE]) -> TablePage<'_> {
        TablePage::init(data, PageId(1), None)
    }

    #[test]
    fn test_init() {
        let mut data = Box::new([0xffu8; PAGE_SIZE]);
        let page = TablePage::init(&mut data, PageId(42), Some(PageId(41)));

        assert_eq!(page.page_id(), PageId(42));
        assert_eq!(page.prev_page_id(), Some(PageId(41)));
        assert_eq!(page.next_page_id(), None);
        assert_eq!(page.tuple_count(), 0);
        assert_eq!(page.free_space(), PAGE_SIZE - HEADER_SIZE);
    }

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let slot1 = page.insert_tuple(b"first tuple")?;
        let slot2 = page.insert_tuple(b"second")?;
        assert_eq!(slot1, 0);
        assert_eq!(slot2, 1);
        assert_eq!(page.get_tuple(slot1)?, b"first tuple");
        assert_eq!(page.get_tuple(slot2)?, b"second");
        assert_eq!(page.tuple_count(), 2);
        Ok(())
    }

    #[test]
    fn test_mark_and_rollback_delete() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let slot = page.insert_tuple(b"doomed")?;
        page.mark_delete(slot)?;
        assert!(matches!(
            page.get_tuple(slot),
            Err(StorageError::TupleNotFound { .. })
        ));

        page.rollback_delete(slot)?;
        assert_eq!(page.get_tuple(slot)?, b"doomed");
        Ok(())
    }

    #[test]
    fn test_apply_delete_compacts() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let s0 = page.insert_tuple(b"aaaa")?;
        let s1 = page.insert_tuple(b"bbbbbbbb")?;
        let s2 = page.insert_tuple(b"cccc")?;
        let free_before = page.free_space();

        page.apply_delete(s1)?;

        // Remaining tuples survive the compaction intact.
        assert_eq!(page.get_tuple(s0)?, b"aaaa");
        assert_eq!(page.get_tuple(s2)?, b"cccc");
        assert!(matches!(
            page.get_tuple(s1),
            Err(StorageError::TupleNotFound { .. })
        ));
        assert_eq!(page.free_space(), free_before + 8);
        Ok(())
    }

    #[test]
    fn test_freed_slot_is_reused() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let s0 = page.insert_tuple(b"old contents")?;
        page.insert_tuple(b"keeper")?;
        page.apply_delete(s0)?;

        let reused = page.insert_tuple(b"replacement bytes")?;
        assert_eq!(reused, s0);
        assert_eq!(page.get_tuple(reused)?, b"replacement bytes");
        assert_eq!(page.tuple_count(), 2);
        Ok(())
    }

    #[test]
    fn test_tombstoned_slot_is_recycled_in_place() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let s0 = page.insert_tuple(b"a fairly long tuple body")?;
        page.insert_tuple(b"other")?;
        page.mark_delete(s0)?;

        // Shorter payload fits into the tombstone's region.
        let reused = page.insert_tuple(b"short")?;
        assert_eq!(reused, s0);
        assert_eq!(page.get_tuple(reused)?, b"short");
        Ok(())
    }

    #[test]
    fn test_update_in_place() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let slot = page.insert_tuple(b"same len")?;
        assert!(page.update_tuple(slot, b"SAME LEN")?);
        assert_eq!(page.get_tuple(slot)?, b"SAME LEN");
        Ok(())
    }

    #[test]
    fn test_update_shrink_and_grow() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let s0 = page.insert_tuple(b"below")?;
        let s1 = page.insert_tuple(b"a rather long original value")?;
        let s2 = page.insert_tuple(b"above")?;

        assert!(page.update_tuple(s1, b"tiny")?);
        assert_eq!(page.get_tuple(s1)?, b"tiny");
        assert_eq!(page.get_tuple(s0)?, b"below");
        assert_eq!(page.get_tuple(s2)?, b"above");

        assert!(page.update_tuple(s1, b"grown back to a long value again")?);
        assert_eq!(page.get_tuple(s1)?, b"grown back to a long value again");
        assert_eq!(page.get_tuple(s0)?, b"below");
        assert_eq!(page.get_tuple(s2)?, b"above");
        Ok(())
    }

    #[test]
    fn test_update_without_space_reports_it() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let slot = page.insert_tuple(b"x")?;
        while page.insert_tuple(&[0xAA; 128]).is_ok() {}

        let huge = vec![0xBB; 512];
        assert!(!page.update_tuple(slot, &huge)?);
        assert_eq!(page.get_tuple(slot)?, b"x");
        Ok(())
    }

    #[test]
    fn test_page_full() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        let tuple = vec![0xAA; 1000];
        let mut inserted = 0;
        while page.insert_tuple(&tuple).is_ok() {
            inserted += 1;
        }
        assert_eq!(inserted, 4);
        assert!(matches!(
            page.insert_tuple(&tuple),
            Err(StorageError::PageFull { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_slot_iteration_skips_tombstones() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let mut page = new_page(&mut data);

        for tuple in [b"t0", b"t1", b"t2", b"t3"] {
            page.insert_tuple(tuple)?;
        }
        page.mark_delete(0)?;
        page.mark_delete(2)?;

        assert_eq!(page.first_tuple_slot(), Some(1));
        assert_eq!(page.next_tuple_slot(1), Some(3));
        assert_eq!(page.next_tuple_slot(3), None);
        Ok(())
    }

    #[test]
    fn test_invalid_slot() {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        let page = new_page(&mut data);

        assert!(matches!(
            page.get_tuple(0),
            Err(StorageError::InvalidSlotId { .. })
        ));
    }

    #[test]
    fn test_read_view_matches() -> Result<()> {
        let mut data = Box::new([0u8; PAGE_SIZE]);
        {
            let mut page = new_page(&mut data);
            page.insert_tuple(b"visible")?;
            page.insert_tuple(b"gone")?;
            page.mark_delete(1)?;
        }

        let view = TablePageRef::from_data(&data);
        assert_eq!(view.page_id(), PageId(1));
        assert_eq!(view.tuple_count(), 2);
        assert_eq!(view.get_tuple(0)?, b"visible");
        assert_eq!(view.first_tuple_slot(), Some(0));
        assert_eq!(view.next_tuple_slot(0), None);
        Ok(())
    }
}
