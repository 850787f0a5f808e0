//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("tuple not found: slot {slot_id} is empty or deleted")]
    TupleNotFound { slot_id: u32 },

    #[error("invalid slot id: {slot_id} (max: {max_slot})")]
    InvalidSlotId { slot_id: u32, max_slot: u32 },

    #[error("page is full: requires {required} bytes but only {available} available")]
    PageFull { required: usize, available: usize },

    #[error("buffer pool is full: cannot allocate new frame")]
    BufferPoolFull,

    #[error("page not found: {0}")]
    PageNotFound(PageId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
