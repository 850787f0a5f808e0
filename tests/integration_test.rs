//! End-to-end tests wiring the disk manager, buffer pool, heap, catalog
//! pages, and B+ tree together the way an execution engine would.

use anyhow::Result;
use std::sync::Arc;
use stratadb::access::btree::key::I32KeyComparator;
use stratadb::access::{BPlusTree, TableHeap};
use stratadb::catalog::{format_storage, CatalogMeta, TableMetadata, CATALOG_META_PAGE_ID};
use stratadb::record::{Column, Field, Row, Schema, TypeId};
use stratadb::storage::buffer::clock::ClockReplacer;
use stratadb::storage::buffer::lru::LruReplacer;
use stratadb::storage::{BufferPoolManager, DiskManager, PAGE_SIZE};
use tempfile::{tempdir, TempDir};

fn sample_schema() -> Result<Schema> {
    Ok(Schema::new(vec![
        Column::new("id", TypeId::Int, 0, false, true)?,
        Column::new_char("name", 64, 1, true, false),
        Column::new("account", TypeId::Float, 2, true, false)?,
    ]))
}

fn sample_row(id: i32) -> Row {
    Row::new(vec![
        Field::Int(id),
        Field::Char(format!("customer-{}", id)),
        Field::Float(id as f32 + 0.25),
    ])
}

fn int_key(value: i32) -> [u8; 4] {
    value.to_le_bytes()
}

fn setup(pool_size: usize) -> Result<(TempDir, BufferPoolManager)> {
    let dir = tempdir()?;
    let disk_manager = Arc::new(DiskManager::create(&dir.path().join("test.db"))?);
    let buffer_pool = BufferPoolManager::new(
        disk_manager,
        Box::new(LruReplacer::new(pool_size)),
        pool_size,
    );
    format_storage(&buffer_pool)?;
    Ok((dir, buffer_pool))
}

#[test]
fn test_table_with_secondary_index() -> Result<()> {
    let (_dir, buffer_pool) = setup(50)?;
    let schema = Arc::new(sample_schema()?);

    let heap = TableHeap::create(buffer_pool.clone(), schema.clone(), None, None)?;
    let mut index = BPlusTree::new(
        0,
        buffer_pool.clone(),
        Arc::new(I32KeyComparator),
        4,
        16,
        16,
    )?;

    // Insert rows and index them by id.
    let mut row_ids = Vec::new();
    for id in 0..500 {
        let mut row = sample_row(id);
        heap.insert_tuple(&mut row, None)?;
        index.insert(&int_key(id), row.row_id(), None)?;
        row_ids.push(row.row_id());
    }

    // Point queries go index -> heap.
    for id in (0..500).step_by(37) {
        let row_id = index.get_value(&int_key(id))?.expect("indexed key");
        let row = heap.get_tuple(row_id, None)?;
        assert_eq!(row.field(0)?, &Field::Int(id));
        assert_eq!(row.field(1)?, &Field::Char(format!("customer-{}", id)));
    }

    // Delete through the index, then verify both structures agree.
    for id in 100..200 {
        let row_id = index.get_value(&int_key(id))?.expect("indexed key");
        heap.mark_delete(row_id, None)?;
        heap.apply_delete(row_id, None)?;
        index.remove(&int_key(id), None)?;
    }
    assert_eq!(index.get_value(&int_key(150))?, None);

    let surviving: Vec<i32> = heap
        .iter()
        .map(|row| match row.unwrap().field(0).unwrap() {
            Field::Int(v) => *v,
            other => panic!("unexpected field {:?}", other),
        })
        .collect();
    assert_eq!(surviving.len(), 400);
    assert!(surviving.iter().all(|id| !(100..200).contains(id)));

    // Range scan resumes at the first surviving key past the gap.
    let mut scan = index.begin_at(&int_key(100))?;
    let (key, _) = scan.next().unwrap()?;
    assert_eq!(i32::from_le_bytes(key.as_slice().try_into().unwrap()), 200);

    assert!(buffer_pool.check_all_unpinned());
    Ok(())
}

#[test]
fn test_catalog_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("test.db");
    let schema = sample_schema()?;
    let table_row_count = 120;

    {
        let disk_manager = Arc::new(DiskManager::create(&file_path)?);
        let buffer_pool =
            BufferPoolManager::new(disk_manager, Box::new(LruReplacer::new(50)), 50);
        format_storage(&buffer_pool)?;

        // Create the table and record it in the catalog pages.
        let heap = TableHeap::create(buffer_pool.clone(), Arc::new(schema.clone()), None, None)?;
        for id in 0..table_row_count {
            let mut row = sample_row(id);
            heap.insert_tuple(&mut row, None)?;
        }

        let table_meta = TableMetadata::new(0, heap.first_page_id(), schema.clone());
        let (meta_page_id, mut guard) = buffer_pool.new_page()?;
        let mut bytes = Vec::new();
        table_meta.serialize_to(&mut bytes);
        guard[..bytes.len()].copy_from_slice(&bytes);
        drop(guard);

        let mut catalog_meta = CatalogMeta::new();
        catalog_meta.insert_table(0, meta_page_id)?;
        let mut guard = buffer_pool.fetch_page_write(CATALOG_META_PAGE_ID)?;
        let mut bytes = Vec::new();
        catalog_meta.serialize_to(&mut bytes);
        guard[..bytes.len()].copy_from_slice(&bytes);
        drop(guard);

        buffer_pool.flush_all()?;
    }

    {
        let disk_manager = Arc::new(DiskManager::open(&file_path)?);
        let buffer_pool =
            BufferPoolManager::new(disk_manager, Box::new(LruReplacer::new(50)), 50);

        // Walk catalog meta -> table meta -> heap.
        let guard = buffer_pool.fetch_page(CATALOG_META_PAGE_ID)?;
        let (catalog_meta, _) = CatalogMeta::deserialize_from(&guard[..])?;
        drop(guard);
        let &meta_page_id = catalog_meta.table_meta_pages().get(&0).expect("table 0");

        let guard = buffer_pool.fetch_page(meta_page_id)?;
        let (table_meta, _) = TableMetadata::deserialize_from(&guard[..])?;
        drop(guard);
        assert_eq!(table_meta.schema(), &schema);

        let heap = TableHeap::open(
            buffer_pool.clone(),
            table_meta.first_page_id(),
            Arc::new(table_meta.schema().clone()),
            None,
            None,
        );
        let count = heap.iter().count();
        assert_eq!(count, table_row_count as usize);
    }
    Ok(())
}

#[test]
fn test_clock_replacer_full_stack() -> Result<()> {
    let dir = tempdir()?;
    let disk_manager = Arc::new(DiskManager::create(&dir.path().join("test.db"))?);
    // A pool far smaller than the working set forces steady eviction.
    let buffer_pool = BufferPoolManager::new(disk_manager, Box::new(ClockReplacer::new(8)), 8);
    format_storage(&buffer_pool)?;

    let schema = Arc::new(sample_schema()?);
    let heap = TableHeap::create(buffer_pool.clone(), schema, None, None)?;
    for id in 0..1000 {
        let mut row = sample_row(id);
        heap.insert_tuple(&mut row, None)?;
    }

    let mut seen = 0;
    for (expected, row) in heap.iter().enumerate() {
        assert_eq!(row?.field(0)?, &Field::Int(expected as i32));
        seen += 1;
    }
    assert_eq!(seen, 1000);
    assert_eq!(buffer_pool.num_resident_pages(), 8);
    assert!(buffer_pool.check_all_unpinned());
    Ok(())
}

#[test]
fn test_bytes_survive_eviction_storms() -> Result<()> {
    let (_dir, buffer_pool) = setup(4)?;

    // Write a distinctive pattern to many pages through write guards.
    let mut page_ids = Vec::new();
    for i in 0..64u32 {
        let (page_id, mut guard) = buffer_pool.new_page()?;
        for (j, byte) in guard.iter_mut().enumerate().take(16) {
            *byte = ((i as usize + j) % 251) as u8;
        }
        drop(guard);
        page_ids.push(page_id);
    }

    // Interleave reads to shuffle the replacer, then verify every page.
    for (i, &page_id) in page_ids.iter().enumerate().rev() {
        let guard = buffer_pool.fetch_page(page_id)?;
        for j in 0..16 {
            assert_eq!(guard[j], ((i + j) % 251) as u8, "page {:?}", page_id);
        }
        drop(guard);
    }
    assert!(buffer_pool.check_all_unpinned());
    assert_eq!(PAGE_SIZE, 4096);
    Ok(())
}
