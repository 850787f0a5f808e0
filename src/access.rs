pub mod btree;
pub mod heap;

pub use btree::BPlusTree;
pub use heap::{TableHeap, TableIterator};
