//! Registry of B+ tree roots.
//!
//! A fixed logical page (id 1) stores one (index id, root page id) pair
//! per index. Every root change rewrites the entry so a reopened database
//! can find its trees again.

use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use std::ops::{Deref, DerefMut};

pub const INDEX_ROOTS_MAGIC_NUM: u32 = 190831;

/// Logical page reserved for the root registry.
pub const INDEX_ROOTS_PAGE_ID: PageId = PageId(1);

const MAGIC_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 4;
const ENTRIES_OFFSET: usize = 8;
const ENTRY_SIZE: usize = 8;

/// Maximum number of indexes the registry can describe.
pub const MAX_INDEX_ROOTS: u32 = ((PAGE_SIZE - ENTRIES_OFFSET) / ENTRY_SIZE) as u32;

/// Typed view over the index roots page.
pub struct IndexRootsPage<D> {
    data: D,
}

impl<D: Deref<Target = [u8; PAGE_SIZE]>> IndexRootsPage<D> {
    /// Wrap existing page bytes, validating the magic number.
    pub fn load(data: D) -> StorageResult<Self> {
        let magic = read_u32(&data, MAGIC_OFFSET);
        if magic != INDEX_ROOTS_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad index roots magic number: {}",
                magic
            )));
        }
        Ok(Self { data })
    }

    pub fn count(&self) -> u32 {
        read_u32(&self.data, COUNT_OFFSET)
    }

    /// Root page of `index_id`, if the index is registered with a live
    /// root.
    pub fn get_root_id(&self, index_id: u32) -> Option<PageId> {
        let slot = self.find(index_id)?;
        PageId::from_raw(read_u32(&self.data, entry_offset(slot) + 4))
    }

    /// Whether the index has an entry at all, live root or not.
    pub fn contains(&self, index_id: u32) -> bool {
        self.find(index_id).is_some()
    }

    fn find(&self, index_id: u32) -> Option<u32> {
        (0..self.count()).find(|&slot| read_u32(&self.data, entry_offset(slot)) == index_id)
    }
}

impl<D: DerefMut<Target = [u8; PAGE_SIZE]>> IndexRootsPage<D> {
    /// Format fresh page bytes as an empty registry.
    pub fn init(mut data: D) -> Self {
        data.fill(0);
        write_u32(&mut data, MAGIC_OFFSET, INDEX_ROOTS_MAGIC_NUM);
        write_u32(&mut data, COUNT_OFFSET, 0);
        Self { data }
    }

    /// Register a new index with its first root.
    pub fn insert(&mut self, index_id: u32, root_page_id: Option<PageId>) -> StorageResult<()> {
        if self.find(index_id).is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "index {} already has a registered root",
                index_id
            )));
        }
        let count = self.count();
        if count >= MAX_INDEX_ROOTS {
            return Err(StorageError::OutOfSpace(
                "index roots page is full".to_string(),
            ));
        }
        write_u32(&mut self.data, entry_offset(count), index_id);
        write_u32(
            &mut self.data,
            entry_offset(count) + 4,
            PageId::to_raw(root_page_id),
        );
        write_u32(&mut self.data, COUNT_OFFSET, count + 1);
        Ok(())
    }

    /// Overwrite the root of a registered index.
    pub fn update(&mut self, index_id: u32, root_page_id: Option<PageId>) -> StorageResult<()> {
        let slot = self.find(index_id).ok_or_else(|| {
            StorageError::NotFound(format!("index {} has no registered root", index_id))
        })?;
        write_u32(
            &mut self.data,
            entry_offset(slot) + 4,
            PageId::to_raw(root_page_id),
        );
        Ok(())
    }

    /// Unregister an index entirely.
    pub fn delete(&mut self, index_id: u32) -> StorageResult<()> {
        let slot = self.find(index_id).ok_or_else(|| {
            StorageError::NotFound(format!("index {} has no registered root", index_id))
        })?;
        let count = self.count();
        let from = entry_offset(slot + 1);
        let end = entry_offset(count);
        let to = entry_offset(slot);
        self.data.copy_within(from..end, to);
        write_u32(&mut self.data, COUNT_OFFSET, count - 1);
        Ok(())
    }
}

fn entry_offset(slot: u32) -> usize {
    ENTRIES_OFFSET + slot as usize * ENTRY_SIZE
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

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let mut page = IndexRootsPage::init(Box::new([0u8; PAGE_SIZE]));

        page.insert(3, Some(PageId(17)))?;
        page.insert(5, Some(PageId(99)))?;

        assert_eq!(page.get_root_id(3), Some(PageId(17)));
        assert_eq!(page.get_root_id(5), Some(PageId(99)));
        assert_eq!(page.get_root_id(7), None);
        assert_eq!(page.count(), 2);
        Ok(())
    }

    #[test]
    fn test_duplicate_insert_rejected() -> Result<()> {
        let mut page = IndexRootsPage::init(Box::new([0u8; PAGE_SIZE]));

        page.insert(3, Some(PageId(17)))?;
        assert!(matches!(
            page.insert(3, Some(PageId(18))),
            Err(StorageError::AlreadyExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_update() -> Result<()> {
        let mut page = IndexRootsPage::init(Box::new([0u8; PAGE_SIZE]));

        page.insert(3, Some(PageId(17)))?;
        page.update(3, Some(PageId(40)))?;
        assert_eq!(page.get_root_id(3), Some(PageId(40)));

        // A tree that shrank to empty stores the sentinel.
        page.update(3, None)?;
        assert_eq!(page.get_root_id(3), None);

        assert!(matches!(
            page.update(9, Some(PageId(1))),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let mut page = IndexRootsPage::init(Box::new([0u8; PAGE_SIZE]));

        page.insert(1, Some(PageId(10)))?;
        page.insert(2, Some(PageId(20)))?;
        page.insert(3, Some(PageId(30)))?;

        page.delete(2)?;
        assert_eq!(page.count(), 2);
        assert_eq!(page.get_root_id(1), Some(PageId(10)));
        assert_eq!(page.get_root_id(2), None);
        assert_eq!(page.get_root_id(3), Some(PageId(30)));

        assert!(matches!(page.delete(2), Err(StorageError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_load_validates_magic() {
        let data = Box::new([0u8; PAGE_SIZE]);
        assert!(IndexRootsPage::load(data).is_err());

        let mut data = Box::new([0u8; PAGE_SIZE]);
        IndexRootsPage::init(&mut *data);
        assert!(IndexRootsPage::load(data).is_ok());
    }
}
