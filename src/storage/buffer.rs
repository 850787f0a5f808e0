pub mod clock;
pub mod lru;
pub mod replacer;

use crate::storage::disk::{DiskManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use parking_lot::Mutex;
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

struct Frame {
    data: Box<[u8; PAGE_SIZE]>,
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            page_id: None,
            pin_count: 0,
            is_dirty: false,
        }
    }

    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count = 0;
        self.is_dirty = false;
        self.data.fill(0);
    }
}

struct PoolState {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
}

struct BufferPoolInner {
    state: Mutex<PoolState>,
    disk_manager: Arc<DiskManager>,
}

/// Fixed-capacity page cache in front of the disk manager.
///
/// Every frame is in exactly one of three states: on the free list, in the
/// replacer (pin count zero), or pinned by outstanding guards. Guards
/// decrement the pin count on drop and offer the frame back to the
/// replacer, so fetch/unpin pairing is enforced by scope.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

impl BufferPoolManager {
    pub fn new(
        disk_manager: Arc<DiskManager>,
        replacer: Box<dyn Replacer>,
        pool_size: usize,
    ) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..pool_size as FrameId).collect();
        Self {
            inner: Arc::new(BufferPoolInner {
                state: Mutex::new(PoolState {
                    frames,
                    page_table: HashMap::with_capacity(pool_size),
                    free_list,
                    replacer,
                }),
                disk_manager,
            }),
        }
    }

    /// Pin the page for reading, loading it from disk if it is not
    /// resident. Fails with `BufferPoolFull` when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageReadGuard> {
        let mut state = self.inner.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.replacer.pin(frame_id);
            let frame = &mut state.frames[frame_id as usize];
            frame.pin_count += 1;
            let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];
            return Ok(PageReadGuard {
                inner: self.inner.clone(),
                frame_id,
                page_id,
                data,
            });
        }

        let frame_id = self.load_into_frame(&mut state, page_id)?;
        let frame = &mut state.frames[frame_id as usize];
        let data = frame.data.as_ref() as *const [u8; PAGE_SIZE];
        Ok(PageReadGuard {
            inner: self.inner.clone(),
            frame_id,
            page_id,
            data,
        })
    }

    /// Pin the page for writing. The frame is marked dirty up front; the
    /// guard's drop keeps the flag until the page is flushed.
    pub fn fetch_page_write(&self, page_id: PageId) -> StorageResult<PageWriteGuard> {
        let mut state = self.inner.state.lock();

        let frame_id = if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.replacer.pin(frame_id);
            let frame = &mut state.frames[frame_id as usize];
            frame.pin_count += 1;
            frame_id
        } else {
            self.load_into_frame(&mut state, page_id)?
        };

        let frame = &mut state.frames[frame_id as usize];
        frame.is_dirty = true;
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        Ok(PageWriteGuard {
            inner: self.inner.clone(),
            frame_id,
            page_id,
            data,
        })
    }

    /// Allocate a page on disk and pin a zeroed frame for it.
    pub fn new_page(&self) -> StorageResult<(PageId, PageWriteGuard)> {
        let mut state = self.inner.state.lock();

        if state.free_list.is_empty() && state.replacer.size() == 0 {
            return Err(StorageError::BufferPoolFull);
        }

        let frame_id = self.find_victim(&mut state)?;
        let page_id = match self.inner.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                state.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = &mut state.frames[frame_id as usize];
        frame.page_id = Some(page_id);
        frame.pin_count = 1;
        frame.is_dirty = true;
        let data = frame.data.as_mut() as *mut [u8; PAGE_SIZE];
        state.page_table.insert(page_id, frame_id);

        Ok((
            page_id,
            PageWriteGuard {
                inner: self.inner.clone(),
                frame_id,
                page_id,
                data,
            },
        ))
    }

    /// Write the page back to disk if it is resident and dirty. Returns
    /// false when the page is not resident. Forced flush is legal even
    /// while the page is pinned.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(false),
        };
        let frame = &mut state.frames[frame_id as usize];
        if frame.is_dirty {
            self.inner.disk_manager.write_page(page_id, &frame.data)?;
            frame.is_dirty = false;
        }
        Ok(true)
    }

    /// Flush every dirty resident page.
    pub fn flush_all(&self) -> StorageResult<()> {
        let mut state = self.inner.state.lock();
        let resident: Vec<(PageId, FrameId)> =
            state.page_table.iter().map(|(&p, &f)| (p, f)).collect();
        for (page_id, frame_id) in resident {
            let frame = &mut state.frames[frame_id as usize];
            if frame.is_dirty {
                self.inner.disk_manager.write_page(page_id, &frame.data)?;
                frame.is_dirty = false;
            }
        }
        Ok(())
    }

    /// Drop a resident page from the pool and release its disk
    /// allocation. A page that is not resident is trivially deleted
    /// (true, no disk side effect); a pinned page cannot be (false).
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();
        let frame_id = match state.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(true),
        };
        if state.frames[frame_id as usize].pin_count > 0 {
            return Ok(false);
        }
        state.page_table.remove(&page_id);
        state.replacer.pin(frame_id);
        state.frames[frame_id as usize].reset();
        state.free_list.push_back(frame_id);
        self.inner.disk_manager.deallocate_page(page_id)?;
        Ok(true)
    }

    pub fn is_page_free(&self, page_id: PageId) -> StorageResult<bool> {
        self.inner.disk_manager.is_page_free(page_id)
    }

    /// True when no frame holds a pin. Used by tests to detect leaks.
    pub fn check_all_unpinned(&self) -> bool {
        let state = self.inner.state.lock();
        state.frames.iter().all(|frame| frame.pin_count == 0)
    }

    /// Number of pages currently resident in the pool.
    pub fn num_resident_pages(&self) -> usize {
        self.inner.state.lock().page_table.len()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.state.lock().frames.len()
    }

    /// Find a frame for a new resident page and read the page into it.
    fn load_into_frame(&self, state: &mut PoolState, page_id: PageId) -> StorageResult<FrameId> {
        let frame_id = self.find_victim(state)?;
        let frame = &mut state.frames[frame_id as usize];
        if let Err(e) = self.inner.disk_manager.read_page(page_id, frame.data.as_mut()) {
            state.free_list.push_back(frame_id);
            return Err(e);
        }
        frame.page_id = Some(page_id);
        frame.pin_count = 1;
        frame.is_dirty = false;
        state.page_table.insert(page_id, frame_id);
        Ok(frame_id)
    }

    /// Pop the free list first; otherwise evict a victim, writing it back
    /// when dirty. The returned frame is reset and unmapped.
    fn find_victim(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state
            .replacer
            .victim()
            .ok_or(StorageError::BufferPoolFull)?;
        let frame = &mut state.frames[frame_id as usize];
        if let Some(old_page_id) = frame.page_id {
            if frame.is_dirty {
                if let Err(e) = self.inner.disk_manager.write_page(old_page_id, &frame.data) {
                    state.replacer.unpin(frame_id);
                    return Err(e);
                }
            }
            state.page_table.remove(&old_page_id);
        }
        state.frames[frame_id as usize].reset();
        Ok(frame_id)
    }
}

impl BufferPoolInner {
    fn unpin(&self, frame_id: FrameId) {
        let mut state = self.state.lock();
        let frame = &mut state.frames[frame_id as usize];
        if frame.pin_count == 0 {
            return;
        }
        frame.pin_count -= 1;
        if frame.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
    }
}

/// Shared borrow of a resident page. Dropping it releases the pin.
pub struct PageReadGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    page_id: PageId,
    data: *const [u8; PAGE_SIZE],
}

impl PageReadGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl Drop for PageReadGuard {
    fn drop(&mut self) {
        self.inner.unpin(self.frame_id);
    }
}

/// Exclusive borrow of a resident page. The frame is dirty from the moment
/// the guard is created; dropping the guard releases the pin.
pub struct PageWriteGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    page_id: PageId,
    data: *mut [u8; PAGE_SIZE],
}

impl PageWriteGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.data }
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.data }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        self.inner.unpin(self.frame_id);
    }
}

// The raw pointers alias frame buffers whose lifetime is controlled by the
// pin count, so moving a guard across threads is sound.
unsafe impl Send for PageReadGuard {}
unsafe impl Sync for PageReadGuard {}
unsafe impl Send for PageWriteGuard {}
unsafe impl Sync for PageWriteGuard {}
