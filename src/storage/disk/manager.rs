//! File I/O, logical-to-physical page mapping, and page allocation.
//!
//! The database file is a sequence of `PAGE_SIZE` blocks. Block 0 holds the
//! disk meta page. Every extent that follows is one bitmap page plus
//! `BITMAP_SIZE` data pages, so a logical page id maps to
//! `(l / BITMAP_SIZE) * (BITMAP_SIZE + 1) + l % BITMAP_SIZE + 2` and the
//! bitmap page of extent `e` lives at physical block
//! `e * (BITMAP_SIZE + 1) + 1`.

use crate::storage::disk::bitmap_page::{BitmapPage, BITMAP_SIZE};
use crate::storage::disk::meta_page::{DiskMetaPage, MAX_EXTENTS};
use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

struct DiskInner {
    file: File,
    // Cached copy of physical block 0, persisted on every allocation change.
    meta: Box<[u8; PAGE_SIZE]>,
}

/// Owns the database file. Every entry point is a single critical section
/// on the file handle.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
}

impl DiskManager {
    /// Create a fresh database file, truncating any existing one.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut meta = Box::new([0u8; PAGE_SIZE]);
        DiskMetaPage::init(&mut meta);
        let mut inner = DiskInner { file, meta };
        let meta_copy = *inner.meta;
        inner.write_physical(0, &meta_copy)?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Open an existing database file and load its meta page.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut meta = Box::new([0u8; PAGE_SIZE]);
        let mut inner = DiskInner { file, meta: Box::new([0u8; PAGE_SIZE]) };
        inner.read_physical(0, &mut meta)?;
        inner.meta = meta;
        DiskMetaPage::from_data(&mut inner.meta).validate()?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Read the page at `page_id` into `buf`. Reads past the end of the
    /// file zero-fill the buffer.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.read_physical(Self::map_page_id(page_id), buf)
    }

    /// Write `data` as the page at `page_id`, extending the file if needed
    /// and syncing it to disk.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.write_physical(Self::map_page_id(page_id), data)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Allocate a free logical page, extending the file with a fresh extent
    /// when every existing extent is full.
    pub fn allocate_page(&self) -> StorageResult<PageId> {
        let mut inner = self.inner.lock();

        // First extent with room, if any.
        let mut target_extent = None;
        {
            let meta = DiskMetaPage::from_data(&mut inner.meta);
            for extent in 0..meta.num_extents() {
                if meta.extent_used_pages(extent) < BITMAP_SIZE {
                    target_extent = Some(extent);
                    break;
                }
            }
        }

        match target_extent {
            Some(extent) => {
                let bitmap_block = Self::bitmap_physical_id(extent);
                let mut bitmap_buf = Box::new([0u8; PAGE_SIZE]);
                inner.read_physical(bitmap_block, &mut bitmap_buf)?;
                let offset = {
                    let mut bitmap = BitmapPage::from_data(&mut bitmap_buf);
                    bitmap.allocate_page().ok_or_else(|| {
                        StorageError::Corruption(format!(
                            "extent {} reports free pages but its bitmap is full",
                            extent
                        ))
                    })?
                };
                inner.write_physical(bitmap_block, &bitmap_buf)?;
                {
                    let mut meta = DiskMetaPage::from_data(&mut inner.meta);
                    meta.set_num_allocated_pages(meta.num_allocated_pages() + 1);
                    meta.set_extent_used_pages(extent, meta.extent_used_pages(extent) + 1);
                }
                inner.persist_meta()?;
                Ok(PageId(extent * BITMAP_SIZE + offset))
            }
            None => {
                // Every extent is full; open a new one.
                let extent = DiskMetaPage::from_data(&mut inner.meta).num_extents();
                if extent >= MAX_EXTENTS {
                    return Err(StorageError::OutOfSpace(
                        "disk meta page cannot describe more extents".to_string(),
                    ));
                }
                let mut bitmap_buf = Box::new([0u8; PAGE_SIZE]);
                let offset = {
                    let mut bitmap = BitmapPage::init(&mut bitmap_buf);
                    bitmap.allocate_page().ok_or_else(|| {
                        StorageError::Corruption("fresh bitmap page has no free bits".to_string())
                    })?
                };
                inner.write_physical(Self::bitmap_physical_id(extent), &bitmap_buf)?;
                {
                    let mut meta = DiskMetaPage::from_data(&mut inner.meta);
                    meta.set_num_extents(extent + 1);
                    meta.set_extent_used_pages(extent, 1);
                    meta.set_num_allocated_pages(meta.num_allocated_pages() + 1);
                }
                inner.persist_meta()?;
                Ok(PageId(extent * BITMAP_SIZE + offset))
            }
        }
    }

    /// Clear the allocation bit of `page_id` and update the counters.
    pub fn deallocate_page(&self, page_id: PageId) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let extent = page_id.0 / BITMAP_SIZE;
        let offset = page_id.0 % BITMAP_SIZE;
        if extent >= DiskMetaPage::from_data(&mut inner.meta).num_extents() {
            return Err(StorageError::NotFound(format!(
                "page {} is beyond the allocated extents",
                page_id
            )));
        }

        let bitmap_block = Self::bitmap_physical_id(extent);
        let mut bitmap_buf = Box::new([0u8; PAGE_SIZE]);
        inner.read_physical(bitmap_block, &mut bitmap_buf)?;
        let cleared = BitmapPage::from_data(&mut bitmap_buf).deallocate_page(offset);
        if !cleared {
            return Err(StorageError::NotFound(format!(
                "page {} is not allocated",
                page_id
            )));
        }
        inner.write_physical(bitmap_block, &bitmap_buf)?;
        {
            let mut meta = DiskMetaPage::from_data(&mut inner.meta);
            meta.set_num_allocated_pages(meta.num_allocated_pages() - 1);
            meta.set_extent_used_pages(extent, meta.extent_used_pages(extent) - 1);
        }
        inner.persist_meta()?;
        Ok(())
    }

    /// Whether the allocation bit of `page_id` is clear.
    pub fn is_page_free(&self, page_id: PageId) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let extent = page_id.0 / BITMAP_SIZE;
        let offset = page_id.0 % BITMAP_SIZE;
        if extent >= DiskMetaPage::from_data(&mut inner.meta).num_extents() {
            return Ok(true);
        }
        let mut bitmap_buf = Box::new([0u8; PAGE_SIZE]);
        inner.read_physical(Self::bitmap_physical_id(extent), &mut bitmap_buf)?;
        Ok(BitmapPage::from_data(&mut bitmap_buf).is_page_free(offset))
    }

    pub fn num_allocated_pages(&self) -> u32 {
        let mut inner = self.inner.lock();
        DiskMetaPage::from_data(&mut inner.meta).num_allocated_pages()
    }

    pub fn num_extents(&self) -> u32 {
        let mut inner = self.inner.lock();
        DiskMetaPage::from_data(&mut inner.meta).num_extents()
    }

    /// Sum of set bits across all bitmap pages. Used to cross-check the
    /// meta page's allocated count.
    pub fn count_allocated_bits(&self) -> StorageResult<u32> {
        let mut inner = self.inner.lock();
        let extents = DiskMetaPage::from_data(&mut inner.meta).num_extents();
        let mut total = 0;
        for extent in 0..extents {
            let mut bitmap_buf = Box::new([0u8; PAGE_SIZE]);
            inner.read_physical(Self::bitmap_physical_id(extent), &mut bitmap_buf)?;
            let bitmap = BitmapPage::from_data(&mut bitmap_buf);
            total += bitmap.allocated_count();
        }
        Ok(total)
    }

    fn map_page_id(page_id: PageId) -> u64 {
        let extent = (page_id.0 / BITMAP_SIZE) as u64;
        let offset = (page_id.0 % BITMAP_SIZE) as u64;
        extent * (BITMAP_SIZE as u64 + 1) + offset + 2
    }

    fn bitmap_physical_id(extent: u32) -> u64 {
        extent as u64 * (BITMAP_SIZE as u64 + 1) + 1
    }
}

impl DiskInner {
    fn read_physical(&mut self, block: u64, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = block * PAGE_SIZE as u64;
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                // Short read at the end of the file.
                buf[read..].fill(0);
                break;
            }
            read += n;
        }
        Ok(())
    }

    fn write_physical(&mut self, block: u64, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = block * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn persist_meta(&mut self) -> StorageResult<()> {
        let meta_copy = *self.meta;
        self.write_physical(0, &meta_copy)
    }
}
