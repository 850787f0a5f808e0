pub mod btree_internal_page;
pub mod btree_leaf_page;
pub mod btree_page;
pub mod index_roots_page;
pub mod table_page;

use serde::{Deserialize, Serialize};

/// Logical identifier of a page within the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// On-disk sentinel for "no page".
pub const INVALID_PAGE_ID: u32 = u32::MAX;

impl PageId {
    /// Decode an on-disk page id field into an in-memory option.
    pub fn from_raw(raw: u32) -> Option<PageId> {
        if raw == INVALID_PAGE_ID {
            None
        } else {
            Some(PageId(raw))
        }
    }

    /// Encode an optional page id into its on-disk representation.
    pub fn to_raw(page_id: Option<PageId>) -> u32 {
        page_id.map(|p| p.0).unwrap_or(INVALID_PAGE_ID)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

pub use table_page::TablePage;
