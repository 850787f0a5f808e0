use crate::storage::error::{StorageError, StorageResult};

/// Column data types supported by the record layer.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeId {
    Int = 1,
    Float = 2,
    Char = 3,
}

impl TypeId {
    pub fn from_u32(value: u32) -> StorageResult<Self> {
        match value {
            1 => Ok(TypeId::Int),
            2 => Ok(TypeId::Float),
            3 => Ok(TypeId::Char),
            other => Err(StorageError::Corruption(format!(
                "unknown type id: {}",
                other
            ))),
        }
    }
}
