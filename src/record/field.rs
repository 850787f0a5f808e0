//! Typed values, nullable per column.
//!
//! Serialization is per type: Int is 4 bytes little-endian, Float is
//! 4 bytes IEEE-754, Char is a length-prefixed byte string. Nulls carry
//! their column type but serialize to nothing; the row's null bitmap
//! records them.

use crate::record::types::TypeId;
use crate::storage::error::{StorageError, StorageResult};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Int(i32),
    Float(f32),
    Char(String),
    Null(TypeId),
}

impl Field {
    pub fn type_id(&self) -> TypeId {
        match self {
            Field::Int(_) => TypeId::Int,
            Field::Float(_) => TypeId::Float,
            Field::Char(_) => TypeId::Char,
            Field::Null(type_id) => *type_id,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null(_))
    }

    /// SQL-style comparison: any comparison against null is undecided.
    pub fn compare(&self, other: &Field) -> StorageResult<Option<Ordering>> {
        match (self, other) {
            (Field::Null(_), _) | (_, Field::Null(_)) => Ok(None),
            (Field::Int(a), Field::Int(b)) => Ok(Some(a.cmp(b))),
            (Field::Float(a), Field::Float(b)) => Ok(a.partial_cmp(b)),
            (Field::Char(a), Field::Char(b)) => Ok(Some(a.cmp(b))),
            _ => Err(StorageError::InvalidArgument(format!(
                "cannot compare {:?} with {:?}",
                self.type_id(),
                other.type_id()
            ))),
        }
    }

    /// Append the field's bytes to `buf`. Nulls write nothing.
    pub fn serialize_to(&self, buf: &mut Vec<u8>) {
        match self {
            Field::Int(value) => buf.extend_from_slice(&value.to_le_bytes()),
            Field::Float(value) => buf.extend_from_slice(&value.to_le_bytes()),
            Field::Char(value) => {
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(value.as_bytes());
            }
            Field::Null(_) => {}
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            Field::Int(_) | Field::Float(_) => 4,
            Field::Char(value) => 4 + value.len(),
            Field::Null(_) => 0,
        }
    }

    /// Read one field of `type_id` from the front of `buf`, returning the
    /// field and the bytes consumed.
    pub fn deserialize_from(buf: &[u8], type_id: TypeId) -> StorageResult<(Field, usize)> {
        match type_id {
            TypeId::Int => {
                let raw = take_u32(buf, 0)?;
                Ok((Field::Int(raw as i32), 4))
            }
            TypeId::Float => {
                let raw = take_u32(buf, 0)?;
                Ok((Field::Float(f32::from_bits(raw)), 4))
            }
            TypeId::Char => {
                let len = take_u32(buf, 0)? as usize;
                if buf.len() < 4 + len {
                    return Err(StorageError::Corruption(
                        "char field is truncated".to_string(),
                    ));
                }
                let value = String::from_utf8(buf[4..4 + len].to_vec()).map_err(|_| {
                    StorageError::Corruption("char field is not valid utf-8".to_string())
                })?;
                Ok((Field::Char(value), 4 + len))
            }
        }
    }
}

fn take_u32(buf: &[u8], offset: usize) -> StorageResult<u32> {
    if buf.len() < offset + 4 {
        return Err(StorageError::Corruption(
            "field bytes are truncated".to_string(),
        ));
    }
    Ok(u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}
