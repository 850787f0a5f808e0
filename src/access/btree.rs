//! Disk-resident B+ tree over fixed-width keys.
//!
//! Nodes never hold pointers to each other: every node records only its
//! parent's page id and traversal re-fetches children through the buffer
//! pool, so eviction can never dangle a reference. Keys are unique and
//! compared by the comparator injected at construction. The tree's root
//! is persisted in the index roots page (logical page 1) on every root
//! change.

pub mod iterator;
pub mod key;

use crate::access::btree::iterator::TreeIterator;
use crate::record::row::RowId;
use crate::storage::buffer::{BufferPoolManager, PageWriteGuard};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_internal_page::BTreeInternalPage;
use crate::storage::page::btree_leaf_page::BTreeLeafPage;
use crate::storage::page::btree_page::{page_type_of, BTreePageType, KeyComparator};
use crate::storage::page::index_roots_page::{IndexRootsPage, INDEX_ROOTS_PAGE_ID};
use crate::storage::page::PageId;
use crate::transaction::Transaction;
use std::sync::Arc;

pub struct BPlusTree {
    index_id: u32,
    buffer_pool: BufferPoolManager,
    comparator: Arc<dyn KeyComparator>,
    key_size: u32,
    leaf_max_size: u32,
    internal_max_size: u32,
    root_page_id: Option<PageId>,
    /// Whether the index already has an entry in the roots page.
    registered: bool,
}

impl BPlusTree {
    /// Open (or begin) the tree for `index_id`, loading its root from the
    /// index roots page.
    pub fn new(
        index_id: u32,
        buffer_pool: BufferPoolManager,
        comparator: Arc<dyn KeyComparator>,
        key_size: u32,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> StorageResult<Self> {
        let (root_page_id, registered) = {
            let guard = buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
            let roots = IndexRootsPage::load(guard)?;
            (roots.get_root_id(index_id), roots.contains(index_id))
        };
        Ok(Self {
            index_id,
            buffer_pool,
            comparator,
            key_size,
            leaf_max_size,
            internal_max_size,
            root_page_id,
            registered,
        })
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.is_none()
    }

    pub fn root_page_id(&self) -> Option<PageId> {
        self.root_page_id
    }

    /// Point query: the RowId stored under `key`, if present.
    pub fn get_value(&self, key: &[u8]) -> StorageResult<Option<RowId>> {
        self.check_key(key)?;
        if self.root_page_id.is_none() {
            return Ok(None);
        }
        let leaf_id = self.find_leaf(Some(key))?;
        let guard = self.buffer_pool.fetch_page(leaf_id)?;
        let leaf = BTreeLeafPage::load(guard)?;
        Ok(leaf.lookup(key, &*self.comparator))
    }

    /// Insert a unique key. A duplicate fails with `AlreadyExists` and
    /// leaves the tree untouched.
    pub fn insert(
        &mut self,
        key: &[u8],
        row_id: RowId,
        _txn: Option<&Transaction>,
    ) -> StorageResult<()> {
        self.check_key(key)?;
        if self.root_page_id.is_none() {
            return self.start_new_tree(key, row_id);
        }
        self.insert_into_leaf(key, row_id)
    }

    /// Remove `key` if present; removing a missing key is a no-op.
    pub fn remove(&mut self, key: &[u8], _txn: Option<&Transaction>) -> StorageResult<()> {
        self.check_key(key)?;
        if self.root_page_id.is_none() {
            return Ok(());
        }
        let leaf_id = self.find_leaf(Some(key))?;

        let (size, min_size, first_key) = {
            let guard = self.buffer_pool.fetch_page_write(leaf_id)?;
            let mut leaf = BTreeLeafPage::load(guard)?;
            if !leaf.remove_record(key, &*self.comparator) {
                return Ok(());
            }
            let first_key = if leaf.size() > 0 {
                Some(leaf.key_at(0).to_vec())
            } else {
                None
            };
            (leaf.size(), leaf.min_size(), first_key)
        };

        // The removed key may have been a separator in some ancestor;
        // rewrite separators up the leftmost-ancestor chain.
        if let Some(first_key) = &first_key {
            self.update_ancestor_separators(leaf_id, first_key)?;
        }

        if size < min_size {
            self.coalesce_or_redistribute(leaf_id)?;
        }
        Ok(())
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> StorageResult<TreeIterator> {
        if self.root_page_id.is_none() {
            return Ok(TreeIterator::end(self.buffer_pool.clone()));
        }
        let leaf_id = self.find_leaf(None)?;
        Ok(TreeIterator::new(
            self.buffer_pool.clone(),
            Some((leaf_id, 0)),
        ))
    }

    /// Iterator positioned at the first key `>=` the probe.
    pub fn begin_at(&self, key: &[u8]) -> StorageResult<TreeIterator> {
        self.check_key(key)?;
        if self.root_page_id.is_none() {
            return Ok(TreeIterator::end(self.buffer_pool.clone()));
        }
        let leaf_id = self.find_leaf(Some(key))?;
        let guard = self.buffer_pool.fetch_page(leaf_id)?;
        let leaf = BTreeLeafPage::load(guard)?;
        let index = leaf.key_index(key, &*self.comparator);
        let position = if index < leaf.size() {
            Some((leaf_id, index))
        } else {
            // The probe falls past this leaf; resume at the next one.
            leaf.next_page_id().map(|next| (next, 0))
        };
        Ok(TreeIterator::new(self.buffer_pool.clone(), position))
    }

    /// Delete every page of the tree, post-order, leaving it empty.
    pub fn destroy(&mut self) -> StorageResult<()> {
        if let Some(root) = self.root_page_id.take() {
            self.destroy_subtree(root)?;
            self.update_root_page_id()?;
        }
        Ok(())
    }

    fn destroy_subtree(&self, page_id: PageId) -> StorageResult<()> {
        let children = {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            match page_type_of(&guard)? {
                BTreePageType::Leaf => Vec::new(),
                BTreePageType::Internal => BTreeInternalPage::load(guard)?.children(),
            }
        };
        for child in children {
            self.destroy_subtree(child)?;
        }
        // Destroying the children may have evicted this page, and
        // delete_page releases the disk allocation only while the page is
        // resident.
        self.buffer_pool.fetch_page(page_id)?;
        if !self.buffer_pool.delete_page(page_id)? {
            return Err(StorageError::InvalidArgument(format!(
                "tree page {} is still pinned",
                page_id
            )));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> StorageResult<()> {
        if key.len() != self.key_size as usize {
            return Err(StorageError::InvalidArgument(format!(
                "key is {} bytes but the tree stores {}-byte keys",
                key.len(),
                self.key_size
            )));
        }
        Ok(())
    }

    /// Descend from the root to the leaf that owns `key`, or to the
    /// leftmost leaf when no key is given.
    fn find_leaf(&self, key: Option<&[u8]>) -> StorageResult<PageId> {
        let mut page_id = self.root_page_id.ok_or_else(|| {
            StorageError::NotFound(format!("index {} has no root", self.index_id))
        })?;
        loop {
            let guard = self.buffer_pool.fetch_page(page_id)?;
            match page_type_of(&guard)? {
                BTreePageType::Leaf => return Ok(page_id),
                BTreePageType::Internal => {
                    let node = BTreeInternalPage::load(guard)?;
                    page_id = match key {
                        Some(key) => node.lookup_child(key, &*self.comparator),
                        None => node.value_at(0),
                    };
                }
            }
        }
    }

    fn start_new_tree(&mut self, key: &[u8], row_id: RowId) -> StorageResult<()> {
        let (root_id, guard) = self.buffer_pool.new_page()?;
        let mut leaf =
            BTreeLeafPage::init(guard, root_id, None, self.key_size, self.leaf_max_size);
        leaf.insert(key, row_id, &*self.comparator);
        drop(leaf);
        self.root_page_id = Some(root_id);
        self.update_root_page_id()
    }

    fn insert_into_leaf(&mut self, key: &[u8], row_id: RowId) -> StorageResult<()> {
        let leaf_id = self.find_leaf(Some(key))?;
        let guard = self.buffer_pool.fetch_page_write(leaf_id)?;
        let mut leaf = BTreeLeafPage::load(guard)?;
        if leaf.lookup(key, &*self.comparator).is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "key already present in index {}",
                self.index_id
            )));
        }

        leaf.insert(key, row_id, &*self.comparator);
        if leaf.size() <= leaf.max_size() {
            return Ok(());
        }

        // Split: the new right sibling takes the upper half.
        let (new_leaf_id, new_guard) = self.buffer_pool.new_page()?;
        let mut new_leaf = BTreeLeafPage::init(
            new_guard,
            new_leaf_id,
            leaf.parent_page_id(),
            self.key_size,
            self.leaf_max_size,
        );
        leaf.move_half_to(&mut new_leaf);
        let separator = new_leaf.key_at(0).to_vec();
        let parent = leaf.parent_page_id();
        drop(leaf);
        drop(new_leaf);
        self.insert_into_parent(leaf_id, parent, &separator, new_leaf_id)
    }

    /// Hook the freshly split-off `right_id` into the tree, creating a
    /// new root when `left_id` was the root, and splitting ancestors as
    /// overflow propagates.
    fn insert_into_parent(
        &mut self,
        left_id: PageId,
        parent: Option<PageId>,
        key: &[u8],
        right_id: PageId,
    ) -> StorageResult<()> {
        let parent_id = match parent {
            None => {
                let (root_id, guard) = self.buffer_pool.new_page()?;
                let mut root = BTreeInternalPage::init(
                    guard,
                    root_id,
                    None,
                    self.key_size,
                    self.internal_max_size,
                );
                root.populate_new_root(left_id, key, right_id);
                drop(root);
                self.reparent(&[left_id, right_id], Some(root_id))?;
                self.root_page_id = Some(root_id);
                return self.update_root_page_id();
            }
            Some(parent_id) => parent_id,
        };

        let guard = self.buffer_pool.fetch_page_write(parent_id)?;
        let mut node = BTreeInternalPage::load(guard)?;
        node.insert_node_after(left_id, key, right_id)?;
        if node.size() <= node.max_size() {
            return Ok(());
        }

        let (new_node_id, new_guard) = self.buffer_pool.new_page()?;
        let mut new_node = BTreeInternalPage::init(
            new_guard,
            new_node_id,
            node.parent_page_id(),
            self.key_size,
            self.internal_max_size,
        );
        let moved = node.move_half_to(&mut new_node);
        let separator = new_node.key_at(0).to_vec();
        let grandparent = node.parent_page_id();
        drop(node);
        drop(new_node);
        self.reparent(&moved, Some(new_node_id))?;
        self.insert_into_parent(parent_id, grandparent, &separator, new_node_id)
    }

    /// Walk up from `child_id` while it is its parent's first child; at
    /// the first ancestor where it is not, rewrite that separator to the
    /// subtree's new smallest key.
    fn update_ancestor_separators(
        &mut self,
        start_id: PageId,
        first_key: &[u8],
    ) -> StorageResult<()> {
        let mut child_id = start_id;
        loop {
            let parent_id = match self.parent_of(child_id)? {
                Some(parent_id) => parent_id,
                None => return Ok(()),
            };
            let index = {
                let guard = self.buffer_pool.fetch_page(parent_id)?;
                let node = BTreeInternalPage::load(guard)?;
                node.value_index(child_id).ok_or_else(|| {
                    StorageError::Corruption(format!(
                        "page {} is not a child of its parent {}",
                        child_id, parent_id
                    ))
                })?
            };
            if index == 0 {
                child_id = parent_id;
                continue;
            }
            let guard = self.buffer_pool.fetch_page_write(parent_id)?;
            let mut node = BTreeInternalPage::load(guard)?;
            node.set_key_at(index, first_key);
            return Ok(());
        }
    }

    fn parent_of(&self, page_id: PageId) -> StorageResult<Option<PageId>> {
        let guard = self.buffer_pool.fetch_page(page_id)?;
        match page_type_of(&guard)? {
            BTreePageType::Leaf => Ok(BTreeLeafPage::load(guard)?.parent_page_id()),
            BTreePageType::Internal => Ok(BTreeInternalPage::load(guard)?.parent_page_id()),
        }
    }

    /// Restore the minimum-occupancy invariant of an underflowing node by
    /// borrowing from a sibling when the pair can spare an entry, or by
    /// merging into one page when it cannot.
    fn coalesce_or_redistribute(&mut self, node_id: PageId) -> StorageResult<()> {
        let (node_size, parent, is_leaf) = {
            let guard = self.buffer_pool.fetch_page(node_id)?;
            match page_type_of(&guard)? {
                BTreePageType::Leaf => {
                    let node = BTreeLeafPage::load(guard)?;
                    (node.size(), node.parent_page_id(), true)
                }
                BTreePageType::Internal => {
                    let node = BTreeInternalPage::load(guard)?;
                    (node.size(), node.parent_page_id(), false)
                }
            }
        };
        let parent_id = match parent {
            None => return self.adjust_root(node_id),
            Some(parent_id) => parent_id,
        };

        let parent_guard = self.buffer_pool.fetch_page_write(parent_id)?;
        let mut parent = BTreeInternalPage::load(parent_guard)?;
        let index = parent.value_index(node_id).ok_or_else(|| {
            StorageError::Corruption(format!(
                "page {} is not a child of its parent {}",
                node_id, parent_id
            ))
        })?;
        // Prefer the right sibling when the node is the first child,
        // otherwise the left sibling.
        let sibling_id = if index == 0 {
            parent.value_at(1)
        } else {
            parent.value_at(index - 1)
        };
        let sibling_size = {
            let guard = self.buffer_pool.fetch_page(sibling_id)?;
            match page_type_of(&guard)? {
                BTreePageType::Leaf => BTreeLeafPage::load(guard)?.size(),
                BTreePageType::Internal => BTreeInternalPage::load(guard)?.size(),
            }
        };
        let max_size = if is_leaf {
            self.leaf_max_size
        } else {
            self.internal_max_size
        };

        if sibling_size + node_size > max_size {
            return self.redistribute(&mut parent, index, node_id, sibling_id, is_leaf);
        }

        // Merge the right node of the pair into the left one.
        let (left_id, right_id, right_index) = if index == 0 {
            (node_id, sibling_id, 1)
        } else {
            (sibling_id, node_id, index)
        };
        let middle_key = parent.key_at(right_index).to_vec();

        if is_leaf {
            let left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let mut left = BTreeLeafPage::load(left_guard)?;
            let right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let mut right = BTreeLeafPage::load(right_guard)?;
            right.move_all_to(&mut left);
        } else {
            let moved = {
                let left_guard = self.buffer_pool.fetch_page_write(left_id)?;
                let mut left = BTreeInternalPage::load(left_guard)?;
                let right_guard = self.buffer_pool.fetch_page_write(right_id)?;
                let mut right = BTreeInternalPage::load(right_guard)?;
                right.move_all_to(&mut left, &middle_key)
            };
            self.reparent(&moved, Some(left_id))?;
        }

        if !self.buffer_pool.delete_page(right_id)? {
            return Err(StorageError::InvalidArgument(format!(
                "merged tree page {} is still pinned",
                right_id
            )));
        }
        parent.remove(right_index);

        let parent_size = parent.size();
        let parent_min = parent.min_size();
        drop(parent);
        if parent_size < parent_min {
            return self.coalesce_or_redistribute(parent_id);
        }
        Ok(())
    }

    /// Move one entry from the sibling into the node and refresh the
    /// parent separator between them.
    fn redistribute(
        &mut self,
        parent: &mut BTreeInternalPage<PageWriteGuard>,
        index: u32,
        node_id: PageId,
        sibling_id: PageId,
        is_leaf: bool,
    ) -> StorageResult<()> {
        if is_leaf {
            let node_guard = self.buffer_pool.fetch_page_write(node_id)?;
            let mut node = BTreeLeafPage::load(node_guard)?;
            let sibling_guard = self.buffer_pool.fetch_page_write(sibling_id)?;
            let mut sibling = BTreeLeafPage::load(sibling_guard)?;
            if index == 0 {
                // Right sibling lends its smallest entry.
                sibling.move_first_to_end_of(&mut node);
                let separator = sibling.key_at(0).to_vec();
                drop(node);
                drop(sibling);
                parent.set_key_at(1, &separator);
            } else {
                // Left sibling lends its largest entry.
                sibling.move_last_to_front_of(&mut node);
                let separator = node.key_at(0).to_vec();
                drop(node);
                drop(sibling);
                parent.set_key_at(index, &separator);
            }
            return Ok(());
        }

        let node_guard = self.buffer_pool.fetch_page_write(node_id)?;
        let mut node = BTreeInternalPage::load(node_guard)?;
        let sibling_guard = self.buffer_pool.fetch_page_write(sibling_id)?;
        let mut sibling = BTreeInternalPage::load(sibling_guard)?;
        if index == 0 {
            // The parent separator comes down with the borrowed child and
            // the sibling's next smallest subtree key goes up.
            let middle_key = parent.key_at(1).to_vec();
            let moved_child = sibling.move_first_to_end_of(&mut node, &middle_key);
            let separator = sibling.key_at(0).to_vec();
            drop(node);
            drop(sibling);
            self.reparent(&[moved_child], Some(node_id))?;
            parent.set_key_at(1, &separator);
        } else {
            let middle_key = parent.key_at(index).to_vec();
            let separator = sibling.key_at(sibling.size() - 1).to_vec();
            let moved_child = sibling.move_last_to_front_of(&mut node, &middle_key);
            drop(node);
            drop(sibling);
            self.reparent(&[moved_child], Some(node_id))?;
            parent.set_key_at(index, &separator);
        }
        Ok(())
    }

    /// Shrink the root: an empty leaf root empties the tree; an internal
    /// root with a single child hands the root over to that child.
    fn adjust_root(&mut self, root_id: PageId) -> StorageResult<()> {
        enum RootChange {
            None,
            DeleteTree,
            Collapse(PageId),
        }

        let change = {
            let guard = self.buffer_pool.fetch_page(root_id)?;
            match page_type_of(&guard)? {
                BTreePageType::Leaf => {
                    let root = BTreeLeafPage::load(guard)?;
                    if root.size() == 0 {
                        RootChange::DeleteTree
                    } else {
                        RootChange::None
                    }
                }
                BTreePageType::Internal => {
                    let root = BTreeInternalPage::load(guard)?;
                    if root.size() == 1 {
                        RootChange::Collapse(root.value_at(0))
                    } else {
                        RootChange::None
                    }
                }
            }
        };

        match change {
            RootChange::None => Ok(()),
            RootChange::DeleteTree => {
                if !self.buffer_pool.delete_page(root_id)? {
                    return Err(StorageError::InvalidArgument(format!(
                        "tree root {} is still pinned",
                        root_id
                    )));
                }
                self.root_page_id = None;
                self.update_root_page_id()
            }
            RootChange::Collapse(child_id) => {
                if !self.buffer_pool.delete_page(root_id)? {
                    return Err(StorageError::InvalidArgument(format!(
                        "tree root {} is still pinned",
                        root_id
                    )));
                }
                self.reparent(&[child_id], None)?;
                self.root_page_id = Some(child_id);
                self.update_root_page_id()
            }
        }
    }

    /// Rewrite the parent pointer of each page through the buffer pool.
    fn reparent(&self, children: &[PageId], parent: Option<PageId>) -> StorageResult<()> {
        for &child_id in children {
            let guard = self.buffer_pool.fetch_page_write(child_id)?;
            match page_type_of(&guard)? {
                BTreePageType::Leaf => BTreeLeafPage::load(guard)?.set_parent_page_id(parent),
                BTreePageType::Internal => {
                    BTreeInternalPage::load(guard)?.set_parent_page_id(parent)
                }
            }
        }
        Ok(())
    }

    /// Persist the current root id, inserting the registry entry on the
    /// first root change and updating it afterwards.
    fn update_root_page_id(&mut self) -> StorageResult<()> {
        let guard = self.buffer_pool.fetch_page_write(INDEX_ROOTS_PAGE_ID)?;
        let mut roots = IndexRootsPage::load(guard)?;
        if self.registered {
            roots.update(self.index_id, self.root_page_id)
        } else {
            roots.insert(self.index_id, self.root_page_id)?;
            self.registered = true;
            Ok(())
        }
    }
}
