//! Rows and their on-disk codec.
//!
//! Serialized layout: magic, page id, slot number, field count, null
//! bitmap length, null bitmap, then each non-null field's bytes in column
//! order. The round trip is bit-exact for non-null fields and preserves
//! null flags.

use crate::record::field::Field;
use crate::record::schema::Schema;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, INVALID_PAGE_ID};
use serde::{Deserialize, Serialize};

pub const ROW_MAGIC_NUM: u32 = 200611;

/// Physical address of a row: page id plus slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowId {
    page_id: PageId,
    slot_num: u32,
}

impl RowId {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }

    /// Sentinel used by iterators to mean "past the end".
    pub fn invalid() -> Self {
        Self {
            page_id: PageId(INVALID_PAGE_ID),
            slot_num: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.page_id.0 != INVALID_PAGE_ID
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn slot_num(&self) -> u32 {
        self.slot_num
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RowId({}, {})", self.page_id.0, self.slot_num)
    }
}

/// A sequence of fields plus the row's physical address.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    row_id: RowId,
    fields: Vec<Field>,
}

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            row_id: RowId::invalid(),
            fields,
        }
    }

    pub fn with_row_id(row_id: RowId, fields: Vec<Field>) -> Self {
        Self { row_id, fields }
    }

    pub fn row_id(&self) -> RowId {
        self.row_id
    }

    pub fn set_row_id(&mut self, row_id: RowId) {
        self.row_id = row_id;
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> StorageResult<&Field> {
        self.fields.get(index).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "field index {} out of range ({} fields)",
                index,
                self.fields.len()
            ))
        })
    }

    /// Project the key columns of `key_schema` out of this row.
    pub fn key_from_row(&self, schema: &Schema, key_schema: &Schema) -> StorageResult<Row> {
        let mut fields = Vec::with_capacity(key_schema.column_count());
        for column in key_schema.columns() {
            let index = schema.column_index(column.name()).ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "key column {} is not part of the schema",
                    column.name()
                ))
            })?;
            fields.push(self.field(index)?.clone());
        }
        Ok(Row::new(fields))
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>, schema: &Schema) -> StorageResult<usize> {
        if self.fields.len() != schema.column_count() {
            return Err(StorageError::InvalidArgument(format!(
                "row has {} fields but the schema has {} columns",
                self.fields.len(),
                schema.column_count()
            )));
        }
        let start = buf.len();
        buf.extend_from_slice(&ROW_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&self.row_id.page_id().0.to_le_bytes());
        buf.extend_from_slice(&self.row_id.slot_num().to_le_bytes());
        buf.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());

        let bitmap_len = null_bitmap_len(self.fields.len());
        buf.extend_from_slice(&(bitmap_len as u32).to_le_bytes());
        let mut bitmap = vec![0u8; bitmap_len];
        for (i, field) in self.fields.iter().enumerate() {
            if field.is_null() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        buf.extend_from_slice(&bitmap);

        for field in &self.fields {
            field.serialize_to(buf);
        }
        Ok(buf.len() - start)
    }

    pub fn serialized_size(&self, schema: &Schema) -> usize {
        debug_assert_eq!(self.fields.len(), schema.column_count());
        let mut size = 4 * 5 + null_bitmap_len(self.fields.len());
        for field in &self.fields {
            size += field.serialized_size();
        }
        size
    }

    /// Read one row from the front of `buf`, typing null fields from the
    /// schema. Returns the row and the bytes consumed.
    pub fn deserialize_from(buf: &[u8], schema: &Schema) -> StorageResult<(Row, usize)> {
        let magic = take_u32(buf, 0)?;
        if magic != ROW_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad row magic number: {}",
                magic
            )));
        }
        let page_id = take_u32(buf, 4)?;
        let slot_num = take_u32(buf, 8)?;
        let field_count = take_u32(buf, 12)? as usize;
        if field_count != schema.column_count() {
            return Err(StorageError::Corruption(format!(
                "row stores {} fields but the schema has {} columns",
                field_count,
                schema.column_count()
            )));
        }
        let bitmap_len = take_u32(buf, 16)? as usize;
        if bitmap_len != null_bitmap_len(field_count) || buf.len() < 20 + bitmap_len {
            return Err(StorageError::Corruption(
                "row null bitmap is malformed".to_string(),
            ));
        }
        let bitmap = &buf[20..20 + bitmap_len];
        let mut offset = 20 + bitmap_len;

        let mut fields = Vec::with_capacity(field_count);
        for i in 0..field_count {
            let type_id = schema.column(i)?.type_id();
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                fields.push(Field::Null(type_id));
            } else {
                let (field, consumed) = Field::deserialize_from(&buf[offset..], type_id)?;
                fields.push(field);
                offset += consumed;
            }
        }

        Ok((
            Row {
                row_id: RowId::new(PageId(page_id), slot_num),
                fields,
            },
            offset,
        ))
    }
}

fn null_bitmap_len(field_count: usize) -> usize {
    field_count.div_ceil(8)
}

fn take_u32(buf: &[u8], offset: usize) -> StorageResult<u32> {
    if buf.len() < offset + 4 {
        return Err(StorageError::Corruption(
            "row bytes are truncated".to_string(),
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
    use anyhow::Result;

    fn sample_schema() -> Result<Schema> {
        Ok(Schema::new(vec![
            Column::new("id", TypeId::Int, 0, false, false)?,
            Column::new_char("name", 64, 1, true, false),
            Column::new("account", TypeId::Float, 2, true, false)?,
        ]))
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let schema = sample_schema()?;
        let row = Row::with_row_id(
            RowId::new(PageId(3), 7),
            vec![
                Field::Int(188),
                Field::Char("stratadb".to_string()),
                Field::Float(19.99),
            ],
        );

        let mut buf = Vec::new();
        let written = row.serialize_to(&mut buf, &schema)?;
        assert_eq!(written, row.serialized_size(&schema));

        let (decoded, consumed) = Row::deserialize_from(&buf, &schema)?;
        assert_eq!(consumed, written);
        assert_eq!(decoded, row);
        Ok(())
    }

    #[test]
    fn test_null_fields_preserved() -> Result<()> {
        let schema = sample_schema()?;
        let row = Row::new(vec![
            Field::Int(188),
            Field::Null(TypeId::Char),
            Field::Null(TypeId::Float),
        ]);

        let mut buf = Vec::new();
        let written = row.serialize_to(&mut buf, &schema)?;
        assert_eq!(written, row.serialized_size(&schema));

        let (decoded, _) = Row::deserialize_from(&buf, &schema)?;
        assert!(decoded.field(1)?.is_null());
        assert!(decoded.field(2)?.is_null());
        assert_eq!(decoded.field(0)?, &Field::Int(188));
        assert_eq!(decoded, row);
        Ok(())
    }

    #[test]
    fn test_empty_row_round_trip() -> Result<()> {
        let schema = Schema::new(vec![]);
        let row = Row::new(vec![]);

        let mut buf = Vec::new();
        let written = row.serialize_to(&mut buf, &schema)?;
        assert_eq!(written, row.serialized_size(&schema));

        let (decoded, consumed) = Row::deserialize_from(&buf, &schema)?;
        assert_eq!(consumed, written);
        assert_eq!(decoded.fields().len(), 0);
        Ok(())
    }

    #[test]
    fn test_field_count_mismatch_rejected() -> Result<()> {
        let schema = sample_schema()?;
        let row = Row::new(vec![Field::Int(1)]);
        let mut buf = Vec::new();
        assert!(row.serialize_to(&mut buf, &schema).is_err());
        Ok(())
    }

    #[test]
    fn test_key_from_row() -> Result<()> {
        let schema = sample_schema()?;
        let key_schema = Schema::with_managed(
            vec![Column::new("id", TypeId::Int, 0, false, false)?],
            false,
        );
        let row = Row::new(vec![
            Field::Int(42),
            Field::Char("x".to_string()),
            Field::Float(1.0),
        ]);

        let key = row.key_from_row(&schema, &key_schema)?;
        assert_eq!(key.fields(), &[Field::Int(42)]);
        Ok(())
    }

    #[test]
    fn test_bad_magic_is_corruption() -> Result<()> {
        let schema = sample_schema()?;
        let row = Row::new(vec![
            Field::Int(1),
            Field::Null(TypeId::Char),
            Field::Null(TypeId::Float),
        ]);
        let mut buf = Vec::new();
        row.serialize_to(&mut buf, &schema)?;
        buf[0] ^= 0xff;
        assert!(matches!(
            Row::deserialize_from(&buf, &schema),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }
}
