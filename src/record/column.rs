//! Column metadata and its on-disk codec.

use crate::record::types::TypeId;
use crate::storage::error::{StorageError, StorageResult};

pub const COLUMN_MAGIC_NUM: u32 = 210928;

/// One column of a schema: name, type, declared length (meaningful for
/// Char), positional index, and the nullable/unique flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    type_id: TypeId,
    length: u32,
    index: u32,
    nullable: bool,
    unique: bool,
}

impl Column {
    /// Fixed-width column (Int or Float); the length is implied by the
    /// type.
    pub fn new(
        name: impl Into<String>,
        type_id: TypeId,
        index: u32,
        nullable: bool,
        unique: bool,
    ) -> StorageResult<Self> {
        let length = match type_id {
            TypeId::Int | TypeId::Float => 4,
            TypeId::Char => {
                return Err(StorageError::InvalidArgument(
                    "char columns must declare a length".to_string(),
                ))
            }
        };
        Ok(Self {
            name: name.into(),
            type_id,
            length,
            index,
            nullable,
            unique,
        })
    }

    /// Char column with a declared length.
    pub fn new_char(
        name: impl Into<String>,
        length: u32,
        index: u32,
        nullable: bool,
        unique: bool,
    ) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::Char,
            length,
            index,
            nullable,
            unique,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&COLUMN_MAGIC_NUM.to_le_bytes());
        buf.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(&(self.type_id as u32).to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&(self.nullable as u32).to_le_bytes());
        buf.extend_from_slice(&(self.unique as u32).to_le_bytes());
    }

    pub fn serialized_size(&self) -> usize {
        4 * 7 + self.name.len()
    }

    /// Read one column from the front of `buf`, returning it and the
    /// bytes consumed.
    pub fn deserialize_from(buf: &[u8]) -> StorageResult<(Column, usize)> {
        let magic = take_u32(buf, 0)?;
        if magic != COLUMN_MAGIC_NUM {
            return Err(StorageError::Corruption(format!(
                "bad column magic number: {}",
                magic
            )));
        }
        let name_len = take_u32(buf, 4)? as usize;
        if buf.len() < 8 + name_len + 20 {
            return Err(StorageError::Corruption(
                "column bytes are truncated".to_string(),
            ));
        }
        let name = String::from_utf8(buf[8..8 + name_len].to_vec())
            .map_err(|_| StorageError::Corruption("column name is not valid utf-8".to_string()))?;
        let mut offset = 8 + name_len;
        let type_id = TypeId::from_u32(take_u32(buf, offset)?)?;
        offset += 4;
        let length = take_u32(buf, offset)?;
        offset += 4;
        let index = take_u32(buf, offset)?;
        offset += 4;
        let nullable = take_u32(buf, offset)? != 0;
        offset += 4;
        let unique = take_u32(buf, offset)? != 0;
        offset += 4;

        Ok((
            Column {
                name,
                type_id,
                length,
                index,
                nullable,
                unique,
            },
            offset,
        ))
    }
}

fn take_u32(buf: &[u8], offset: usize) -> StorageResult<u32> {
    if buf.len() < offset + 4 {
        return Err(StorageError::Corruption(
            "column bytes are truncated".to_string(),
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
    use anyhow::Result;

    #[test]
    fn test_round_trip() -> Result<()> {
        let columns = [
            Column::new("id", TypeId::Int, 0, false, true)?,
            Column::new("account", TypeId::Float, 2, true, false)?,
            Column::new_char("name", 64, 1, true, false),
        ];
        for column in &columns {
            let mut buf = Vec::new();
            column.serialize_to(&mut buf);
            assert_eq!(buf.len(), column.serialized_size());
            let (decoded, consumed) = Column::deserialize_from(&buf)?;
            assert_eq!(consumed, buf.len());
            assert_eq!(&decoded, column);
        }
        Ok(())
    }

    #[test]
    fn test_char_requires_length_constructor() {
        assert!(Column::new("name", TypeId::Char, 0, false, false).is_err());
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let mut buf = Vec::new();
        Column::new_char("name", 64, 1, true, false).serialize_to(&mut buf);
        buf[0] ^= 0xff;
        assert!(matches!(
            Column::deserialize_from(&buf),
            Err(StorageError::Corruption(_))
        ));
    }
}
