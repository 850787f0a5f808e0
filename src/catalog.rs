//! On-disk catalog representation.
//!
//! The catalog manager itself lives above this crate; here are the page
//! codecs it persists through: the catalog meta page (logical page 0)
//! mapping table and index ids to their metadata pages, and the
//! serialized per-table / per-index metadata blobs.

use crate::record::schema::Schema;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::index_roots_page::{IndexRootsPage, INDEX_ROOTS_PAGE_ID};
use crate::storage::page::PageId;
use std::collections::BTreeMap;

pub const CATALOG_METADATA_MAGIC_NUM: u32 = 89849;
pub const TABLE_METADATA_MAGIC_NUM: u32 = 344528;
pub const INDEX_METADATA_MAGIC_NUM: u32 = 344529;

/// Logical page reserved for the serialized catalog meta.
pub const CATALOG_META_PAGE_ID: PageId = PageId(0);

/// Directory of every table's and index's metadata page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogMeta {
    table_meta_pages: BTreeMap<u32, PageId>,
    index_meta_pages: BTreeMap<u32, PageId>,
}

impl CatalogMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_meta_pages(&self) -> &BTreeMap<u32, PageId> {
        &self.table_meta_pages
    }

    pub fn index_meta_pages(&self) -> &BTreeMap<u32, PageId> {
        &self.index_meta_pages
    }

    pub fn insert_table(&mut self, table_id: u32, meta_page_id: PageId) -> StorageResult<()> {
        if self.table_meta_pages.contains_key(&table_id) {
            return Err(StorageError::AlreadyExists(format!(
                "table {} is already cataloged",
                table_id
            )));
        }
        self.table_meta_pages.insert(table_id, meta_page_id);
        Ok(())
    }

    pub fn remove_table(&mut self, table_id: u32) -> StorageResult<PageId> {
        self.table_meta_pages
            .remove(&table_id)
            .ok_or_else(|| StorageError::NotFound(format!("table {} is not cataloged", table_id)))
    }

    pub fn insert_index(&mut self, index_id: u32, meta_page_id: PageId) -> StorageResult<()> {
        if self.index_meta_pages.contains_key(&index_id) {
            return Err(StorageError::AlreadyExists(format!(
                "index {} is already cataloged",
                index_id
            )));
        }
        self.index_meta_pages.insert(index_id, meta_page_id);
        Ok(())
    }

    pub fn remove_index(&mut self, index_id: u32) -> StorageResult<PageId> {
        self.index_meta_pages
            .remove(&index_id)
            .ok_or_else(|| StorageError::NotFound(format!("index {} is not cataloged", index_id)))
    }

    pub fn next_table_id(&self) -> u32 {
        self.table_meta_pages
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    pub fn next_index_id(&self) -> u32 {
        self.index_meta_pages
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&CATALOG_METADATA_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(self.table_meta_pages.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.index_meta_pages.len() as u32).to_le_bytes());
        for (&table_id, &page_id) in &self.table_meta_pages {
            buf.extend_from_slice(&table_id.to_le_bytes());
            buf.extend_from_slice(&page_id.0.to_le_bytes());
        }
        for (&index_id, &page_id) in &self.index_meta_pages {
            buf.extend_from_slice(&index_id.to_le_bytes());
            buf.extend_from_slice(&page_id.0.to_le_bytes());
        }
    }

    pub fn serialized_size(&self) -> usize {
        4 * 3 + (self.table_meta_pages.len() + self.index_meta_pages.len()) * 8
    }

    pub fn deserialize_from(buf: &[u8]) -> StorageResult<(CatalogMeta, usize)> {
        let magic = take_u32(buf, 0)?;
        if magic != CATALOG_METADATA_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad catalog meta magic number: {}",
                magic
            )));
        }
        let table_count = take_u32(buf, 4)?;
        let index_count = take_u32(buf, 8)?;
        let mut offset = 12;
        let mut meta = CatalogMeta::new();
        for _ in 0..table_count {
            let table_id = take_u32(buf, offset)?;
            let page_id = PageId(take_u32(buf, offset + 4)?);
            meta.table_meta_pages.insert(table_id, page_id);
            offset += 8;
        }
        for _ in 0..index_count {
            let index_id = take_u32(buf, offset)?;
            let page_id = PageId(take_u32(buf, offset + 4)?);
            meta.index_meta_pages.insert(index_id, page_id);
            offset += 8;
        }
        Ok((meta, offset))
    }
}

/// Per-table metadata blob: id, heap root, and the serialized schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    table_id: u32,
    first_page_id: PageId,
    schema: Schema,
}

impl TableMetadata {
    pub fn new(table_id: u32, first_page_id: PageId, schema: Schema) -> Self {
        Self {
            table_id,
            first_page_id,
            schema,
        }
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&TABLE_METADATA_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&self.first_page_id.0.to_le_bytes());
        self.schema.serialize_to(buf);
    }

    pub fn serialized_size(&self) -> usize {
        4 * 3 + self.schema.serialized_size()
    }

    pub fn deserialize_from(buf: &[u8]) -> StorageResult<(TableMetadata, usize)> {
        let magic = take_u32(buf, 0)?;
        if magic != TABLE_METADATA_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad table metadata magic number: {}",
                magic
            )));
        }
        let table_id = take_u32(buf, 4)?;
        let first_page_id = PageId(take_u32(buf, 8)?);
        let (schema, consumed) = Schema::deserialize_from(&buf[12..])?;
        Ok((
            TableMetadata {
                table_id,
                first_page_id,
                schema,
            },
            12 + consumed,
        ))
    }
}

/// Per-index metadata blob: id, name, owning table, and the positions of
/// the key columns within the table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    index_id: u32,
    name: String,
    table_id: u32,
    key_map: Vec<u32>,
}

impl IndexMetadata {
    pub fn new(index_id: u32, name: impl Into<String>, table_id: u32, key_map: Vec<u32>) -> Self {
        Self {
            index_id,
            name: name.into(),
            table_id,
            key_map,
        }
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn key_map(&self) -> &[u32] {
        &self.key_map
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&INDEX_METADATA_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&self.index_id.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&(self.key_map.len() as u32).to_le_bytes());
        for &column_index in &self.key_map {
            buf.extend_from_slice(&column_index.to_le_bytes());
        }
    }

    pub fn serialized_size(&self) -> usize {
        4 * 4 + self.name.len() + 4 + self.key_map.len() * 4
    }

    pub fn deserialize_from(buf: &[u8]) -> StorageResult<(IndexMetadata, usize)> {
        let magic = take_u32(buf, 0)?;
        if magic != INDEX_METADATA_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad index metadata magic number: {}",
                magic
            )));
        }
        let index_id = take_u32(buf, 4)?;
        let name_len = take_u32(buf, 8)? as usize;
        if buf.len() < 12 + name_len + 8 {
            return Err(StorageError::Corruption(
                "index metadata is truncated".to_string(),
            ));
        }
        let name = String::from_utf8(buf[12..12 + name_len].to_vec()).map_err(|_| {
            StorageError::Corruption("index name is not valid utf-8".to_string())
        })?;
        let mut offset = 12 + name_len;
        let table_id = take_u32(buf, offset)?;
        offset += 4;
        let key_count = take_u32(buf, offset)? as usize;
        offset += 4;
        let mut key_map = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            key_map.push(take_u32(buf, offset)?);
            offset += 4;
        }
        Ok((
            IndexMetadata {
                index_id,
                name,
                table_id,
                key_map,
            },
            offset,
        ))
    }
}

/// Lay out the fixed-purpose pages of a fresh database: the catalog meta
/// page at logical page 0 and the index roots page at logical page 1.
pub fn format_storage(buffer_pool: &BufferPoolManager) -> StorageResult<()> {
    let (catalog_page_id, mut guard) = buffer_pool.new_page()?;
    if catalog_page_id != CATALOG_META_PAGE_ID {
        return Err(StorageError::InvalidArgument(format!(
            "catalog meta page allocated at {}, expected {}",
            catalog_page_id, CATALOG_META_PAGE_ID
        )));
    }
    let mut bytes = Vec::new();
    CatalogMeta::new().serialize_to(&mut bytes);
    guard[..bytes.len()].copy_from_slice(&bytes);
    drop(guard);

    let (roots_page_id, roots_guard) = buffer_pool.new_page()?;
    if roots_page_id != INDEX_ROOTS_PAGE_ID {
        return Err(StorageError::InvalidArgument(format!(
            "index roots page allocated at {}, expected {}",
            roots_page_id, INDEX_ROOTS_PAGE_ID
        )));
    }
    IndexRootsPage::init(roots_guard);
    Ok(())
}

fn take_u32(buf: &[u8], offset: usize) -> StorageResult<u32> {
    if buf.len() < offset + 4 {
        return Err(StorageError::Corruption(
            "catalog bytes are truncated".to_string(),
        ));
    }
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::column::Column;
    use crate::record::types::TypeId;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::disk::DiskManager;
    use anyhow::Result;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_catalog_meta_round_trip() -> Result<()> {
        let mut meta = CatalogMeta::new();
        meta.insert_table(0, PageId(3))?;
        meta.insert_table(1, PageId(9))?;
        meta.insert_index(0, PageId(12))?;

        let mut buf = Vec::new();
        meta.serialize_to(&mut buf);
        assert_eq!(buf.len(), meta.serialized_size());

        let (decoded, consumed) = CatalogMeta::deserialize_from(&buf)?;
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, meta);
        Ok(())
    }

    #[test]
    fn test_catalog_meta_duplicate_ids() -> Result<()> {
        let mut meta = CatalogMeta::new();
        meta.insert_table(0, PageId(3))?;
        assert!(matches!(
            meta.insert_table(0, PageId(4)),
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(
            meta.remove_index(5),
            Err(StorageError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_next_ids() -> Result<()> {
        let mut meta = CatalogMeta::new();
        assert_eq!(meta.next_table_id(), 0);
        meta.insert_table(0, PageId(3))?;
        meta.insert_table(4, PageId(5))?;
        assert_eq!(meta.next_table_id(), 5);
        assert_eq!(meta.next_index_id(), 0);
        Ok(())
    }

    #[test]
    fn test_table_metadata_round_trip() -> Result<()> {
        let schema = Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, true)?,
            Column::new_char("name", 32, 1, true, false),
        ]);
        let meta = TableMetadata::new(7, PageId(21), schema);

        let mut buf = Vec::new();
        meta.serialize_to(&mut buf);
        assert_eq!(buf.len(), meta.serialized_size());

        let (decoded, consumed) = TableMetadata::deserialize_from(&buf)?;
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, meta);
        Ok(())
    }

    #[test]
    fn test_index_metadata_round_trip() -> Result<()> {
        let meta = IndexMetadata::new(3, "idx_account", 7, vec![0, 2]);

        let mut buf = Vec::new();
        meta.serialize_to(&mut buf);
        assert_eq!(buf.len(), meta.serialized_size());

        let (decoded, consumed) = IndexMetadata::deserialize_from(&buf)?;
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, meta);
        Ok(())
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let mut buf = Vec::new();
        CatalogMeta::new().serialize_to(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            CatalogMeta::deserialize_from(&buf),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_format_storage() -> Result<()> {
        let dir = tempdir()?;
        let disk_manager = Arc::new(DiskManager::create(&dir.path().join("test.db"))?);
        let buffer_pool =
            BufferPoolManager::new(disk_manager, Box::new(LruReplacer::new(10)), 10);

        format_storage(&buffer_pool)?;

        // Page 0 deserializes as an empty catalog.
        let guard = buffer_pool.fetch_page(CATALOG_META_PAGE_ID)?;
        let (meta, _) = CatalogMeta::deserialize_from(&guard[..])?;
        assert_eq!(meta, CatalogMeta::new());
        drop(guard);

        // Page 1 is a valid, empty roots registry.
        let guard = buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        let roots = IndexRootsPage::load(guard)?;
        assert_eq!(roots.count(), 0);
        Ok(())
    }
}
