//! Ordered column list describing a table or an index key.

use crate::record::column::Column;
use crate::storage::error::{StorageError, StorageResult};

pub const SCHEMA_MAGIC_NUM: u32 = 200715;

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<Column>,
    // Whether this schema owns its column definitions or mirrors another
    // table's. Kept as a serialized flag for layout compatibility.
    is_managed: bool,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            is_managed: true,
        }
    }

    pub fn with_managed(columns: Vec<Column>, is_managed: bool) -> Self {
        Self {
            columns,
            is_managed,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: usize) -> StorageResult<&Column> {
        self.columns.get(index).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "column index {} out of range ({} columns)",
                index,
                self.columns.len()
            ))
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn is_managed(&self) -> bool {
        self.is_managed
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&SCHEMA_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for column in &self.columns {
            column.serialize_to(buf);
        }
        buf.extend_from_slice(&(self.is_managed as u32).to_le_bytes());
    }

    pub fn serialized_size(&self) -> usize {
        4 * 3 + self
            .columns
            .iter()
            .map(|c| c.serialized_size())
            .sum::<usize>()
    }

    /// Read one schema from the front of `buf`, returning it and the
    /// bytes consumed.
    pub fn deserialize_from(buf: &[u8]) -> StorageResult<(Schema, usize)> {
        let magic = take_u32(buf, 0)?;
        if magic != SCHEMA_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad schema magic number: {}",
                magic
            )));
        }
        let column_count = take_u32(buf, 4)? as usize;
        let mut offset = 8;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let (column, consumed) = Column::deserialize_from(&buf[offset..])?;
            columns.push(column);
            offset += consumed;
        }
        let is_managed = take_u32(buf, offset)? != 0;
        offset += 4;
        Ok((
            Schema {
                columns,
                is_managed,
            },
            offset,
        ))
    }
}

fn take_u32(buf: &[u8], offset: usize) -> StorageResult<u32> {
    if buf.len() < offset + 4 {
        return Err(StorageError::Corruption(
            "schema bytes are truncated".to_string(),
        ));
    }
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}
