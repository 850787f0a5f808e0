//! Heap-organized tables: a singly-linked chain of slotted pages plus a
//! cursor over live rows.

use crate::record::row::{Row, RowId};
use crate::record::schema::Schema;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::table_page::{TablePage, TablePageRef, MAX_TUPLE_SIZE};
use crate::storage::page::PageId;
use crate::transaction::{LockManager, LogManager, Transaction};
use std::sync::Arc;

/// Linked list of table pages rooted at a first-page id.
pub struct TableHeap {
    buffer_pool: BufferPoolManager,
    first_page_id: PageId,
    schema: Arc<Schema>,
    lock_manager: Option<Arc<LockManager>>,
    log_manager: Option<Arc<LogManager>>,
}

impl TableHeap {
    /// Create a table with a fresh, empty first page.
    pub fn create(
        buffer_pool: BufferPoolManager,
        schema: Arc<Schema>,
        lock_manager: Option<Arc<LockManager>>,
        log_manager: Option<Arc<LogManager>>,
    ) -> StorageResult<Self> {
        let (first_page_id, mut guard) = buffer_pool.new_page()?;
        TablePage::init(&mut guard, first_page_id, None);
        drop(guard);
        Ok(Self {
            buffer_pool,
            first_page_id,
            schema,
            lock_manager,
            log_manager,
        })
    }

    /// Open a table whose first page already exists on disk.
    pub fn open(
        buffer_pool: BufferPoolManager,
        first_page_id: PageId,
        schema: Arc<Schema>,
        lock_manager: Option<Arc<LockManager>>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        Self {
            buffer_pool,
            first_page_id,
            schema,
            lock_manager,
            log_manager,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Insert a row, stamping it with the RowId it landed at. Walks the
    /// page chain for free space and grows the chain at the tail.
    pub fn insert_tuple(&self, row: &mut Row, _txn: Option<&Transaction>) -> StorageResult<()> {
        let mut bytes = Vec::new();
        row.serialize_to(&mut bytes, &self.schema)?;
        if bytes.len() > MAX_TUPLE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "row of {} bytes cannot fit in an empty page",
                bytes.len()
            )));
        }

        let mut page_id = self.first_page_id;
        loop {
            let mut guard = self.buffer_pool.fetch_page_write(page_id)?;
            let mut page = TablePage::from_data(&mut guard);
            match page.insert_tuple(&bytes) {
                Ok(slot) => {
                    row.set_row_id(RowId::new(page_id, slot));
                    return Ok(());
                }
                Err(StorageError::PageFull { .. }) => {}
                Err(e) => return Err(e),
            }
            match page.next_page_id() {
                Some(next) => {
                    drop(guard);
                    page_id = next;
                }
                None => {
                    // Tail of the chain: splice in a fresh page.
                    let (new_page_id, mut new_guard) = self.buffer_pool.new_page()?;
                    let mut new_page = TablePage::init(&mut new_guard, new_page_id, Some(page_id));
                    let slot = new_page.insert_tuple(&bytes)?;
                    let mut tail = TablePage::from_data(&mut guard);
                    tail.set_next_page_id(Some(new_page_id));
                    row.set_row_id(RowId::new(new_page_id, slot));
                    return Ok(());
                }
            }
        }
    }

    /// Fetch the row at `row_id`, typing its fields from the table schema.
    pub fn get_tuple(&self, row_id: RowId, _txn: Option<&Transaction>) -> StorageResult<Row> {
        let guard = self.buffer_pool.fetch_page(row_id.page_id())?;
        let page = TablePageRef::from_data(&guard);
        let bytes = page.get_tuple(row_id.slot_num())?;
        let (mut row, _) = Row::deserialize_from(bytes, &self.schema)?;
        row.set_row_id(row_id);
        Ok(row)
    }

    /// Set the tombstone on the row without reclaiming its space.
    pub fn mark_delete(&self, row_id: RowId, _txn: Option<&Transaction>) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(row_id.page_id())?;
        TablePage::from_data(&mut guard).mark_delete(row_id.slot_num())
    }

    /// Physically reclaim a deleted row's space.
    pub fn apply_delete(&self, row_id: RowId, _txn: Option<&Transaction>) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(row_id.page_id())?;
        TablePage::from_data(&mut guard).apply_delete(row_id.slot_num())
    }

    /// Clear a tombstone set by `mark_delete`.
    pub fn rollback_delete(&self, row_id: RowId, _txn: Option<&Transaction>) -> StorageResult<()> {
        let mut guard = self.buffer_pool.fetch_page_write(row_id.page_id())?;
        TablePage::from_data(&mut guard).rollback_delete(row_id.slot_num())
    }

    /// Overwrite the row at `row_id`, in place when the page has room,
    /// otherwise as a delete-and-reinsert. Returns the row's address
    /// after the update.
    pub fn update_tuple(
        &self,
        row: &mut Row,
        row_id: RowId,
        txn: Option<&Transaction>,
    ) -> StorageResult<RowId> {
        let mut bytes = Vec::new();
        row.serialize_to(&mut bytes, &self.schema)?;
        if bytes.len() > MAX_TUPLE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "row of {} bytes cannot fit in an empty page",
                bytes.len()
            )));
        }

        let updated_in_place = {
            let mut guard = self.buffer_pool.fetch_page_write(row_id.page_id())?;
            TablePage::from_data(&mut guard).update_tuple(row_id.slot_num(), &bytes)?
        };
        if updated_in_place {
            row.set_row_id(row_id);
            return Ok(row_id);
        }

        // The page cannot absorb the growth: retire the old version and
        // reinsert the new one wherever it fits.
        self.mark_delete(row_id, txn)?;
        self.insert_tuple(row, txn)?;
        Ok(row.row_id())
    }

    /// Cursor over live rows in (page, slot) order.
    pub fn iter(&self) -> TableIterator {
        TableIterator {
            buffer_pool: self.buffer_pool.clone(),
            schema: self.schema.clone(),
            current_page_id: Some(self.first_page_id),
            next_slot: 0,
        }
    }

    /// Walk the chain and release every page of the table.
    pub fn delete_table(self) -> StorageResult<()> {
        let mut page_id = Some(self.first_page_id);
        while let Some(current) = page_id {
            let next = {
                let guard = self.buffer_pool.fetch_page(current)?;
                TablePageRef::from_data(&guard).next_page_id()
            };
            if !self.buffer_pool.delete_page(current)? {
                return Err(StorageError::InvalidArgument(format!(
                    "table page {} is still pinned",
                    current
                )));
            }
            page_id = next;
        }
        Ok(())
    }

    pub fn lock_manager(&self) -> Option<&Arc<LockManager>> {
        self.lock_manager.as_ref()
    }

    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }
}

/// Cursor over the live rows of a heap. Each advancement fetches the
/// page through the buffer pool and releases it before yielding, so the
/// iterator never outlives its pins.
#[derive(Clone)]
pub struct TableIterator {
    buffer_pool: BufferPoolManager,
    schema: Arc<Schema>,
    current_page_id: Option<PageId>,
    next_slot: u32,
}

impl TableIterator {
    fn next_row(&mut self) -> StorageResult<Option<Row>> {
        loop {
            let page_id = match self.current_page_id {
                Some(page_id) => page_id,
                None => return Ok(None),
            };
            let guard = self.buffer_pool.fetch_page(page_id)?;
            let page = TablePageRef::from_data(&guard);

            let live = if self.next_slot == 0 {
                page.first_tuple_slot()
            } else {
                page.next_tuple_slot(self.next_slot - 1)
            };
            match live {
                Some(slot) => {
                    let bytes = page.get_tuple(slot)?;
                    let (mut row, _) = Row::deserialize_from(bytes, &self.schema)?;
                    row.set_row_id(RowId::new(page_id, slot));
                    self.next_slot = slot + 1;
                    return Ok(Some(row));
                }
                None => {
                    self.current_page_id = page.next_page_id();
                    self.next_slot = 0;
                }
            }
        }
    }
}

impl Iterator for TableIterator {
    type Item = StorageResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}
