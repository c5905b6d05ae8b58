//! On-page layouts for tree nodes and the index-roots directory.
//!
//! Every node starts with a 24-byte common header:
//!
//! ```text
//! 0   page_type      u32   1 = internal, 2 = leaf
//! 4   key_size       u32
//! 8   size           u32   pairs in the node (children, for internals)
//! 12  max_size       u32
//! 16  parent_page_id i32
//! 20  page_id        i32
//! ```
//!
//! Leaves continue with `next_page_id: i32` at 24 and store
//! `key ∥ RowId (u32 page, u32 slot)` pairs from 28. Internals store
//! `key ∥ child_page_id (i32)` pairs from 24; `key[0]` is a dummy that is
//! never compared.

use common::{PageId, RowId, PAGE_SIZE};

pub const INTERNAL_HEADER: usize = 24;
pub const LEAF_HEADER: usize = 28;

const TYPE_INTERNAL: u32 = 1;
const TYPE_LEAF: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    Leaf,
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("in-page read"))
}

fn get_i32(data: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(data[at..at + 4].try_into().expect("in-page read"))
}

fn put_u32(data: &mut [u8], at: usize, v: u32) {
    data[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i32(data: &mut [u8], at: usize, v: i32) {
    data[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Read-only view of a tree node.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    data: &'a [u8; PAGE_SIZE],
}

impl<'a> NodeRef<'a> {
    pub fn new(data: &'a [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn node_type(&self) -> NodeType {
        match get_u32(self.data, 0) {
            TYPE_INTERNAL => NodeType::Internal,
            TYPE_LEAF => NodeType::Leaf,
            other => panic!("corrupt tree node: unknown page type {other}"),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type() == NodeType::Leaf
    }

    pub fn key_size(&self) -> usize {
        get_u32(self.data, 4) as usize
    }

    pub fn size(&self) -> usize {
        get_u32(self.data, 8) as usize
    }

    pub fn max_size(&self) -> usize {
        get_u32(self.data, 12) as usize
    }

    /// Minimum pairs a non-root node must keep: `⌈max_size/2⌉`.
    pub fn min_size(&self) -> usize {
        (self.max_size() + 1) / 2
    }

    pub fn parent_page_id(&self) -> PageId {
        PageId(get_i32(self.data, 16))
    }

    pub fn page_id(&self) -> PageId {
        PageId(get_i32(self.data, 20))
    }

    pub fn is_root(&self) -> bool {
        !self.parent_page_id().is_valid()
    }

    fn pair_size(&self) -> usize {
        match self.node_type() {
            NodeType::Leaf => self.key_size() + 8,
            NodeType::Internal => self.key_size() + 4,
        }
    }

    fn pairs_off(&self) -> usize {
        match self.node_type() {
            NodeType::Leaf => LEAF_HEADER,
            NodeType::Internal => INTERNAL_HEADER,
        }
    }

    pub fn key_at(&self, idx: usize) -> &'a [u8] {
        debug_assert!(idx < self.size());
        let at = self.pairs_off() + idx * self.pair_size();
        &self.data[at..at + self.key_size()]
    }

    pub fn leaf_next_page_id(&self) -> PageId {
        debug_assert!(self.is_leaf());
        PageId(get_i32(self.data, 24))
    }

    pub fn leaf_value_at(&self, idx: usize) -> RowId {
        debug_assert!(self.is_leaf());
        debug_assert!(idx < self.size());
        let at = self.pairs_off() + idx * self.pair_size() + self.key_size();
        RowId::new(PageId(get_u32(self.data, at) as i32), get_u32(self.data, at + 4))
    }

    pub fn child_at(&self, idx: usize) -> PageId {
        debug_assert!(!self.is_leaf());
        debug_assert!(idx < self.size());
        let at = self.pairs_off() + idx * self.pair_size() + self.key_size();
        PageId(get_i32(self.data, at))
    }

    /// Index of `child` among this internal node's children, if present.
    pub fn child_index(&self, child: PageId) -> Option<usize> {
        (0..self.size()).find(|&i| self.child_at(i) == child)
    }
}

/// Mutable view of a tree node.
pub struct NodeMut<'a> {
    data: &'a mut [u8; PAGE_SIZE],
}

impl<'a> NodeMut<'a> {
    pub fn new(data: &'a mut [u8; PAGE_SIZE]) -> Self {
        Self { data }
    }

    pub fn as_ref(&self) -> NodeRef<'_> {
        NodeRef::new(self.data)
    }

    pub fn init_leaf(&mut self, page_id: PageId, parent: PageId, key_size: usize, max_size: usize) {
        self.data.fill(0);
        put_u32(self.data, 0, TYPE_LEAF);
        put_u32(self.data, 4, key_size as u32);
        put_u32(self.data, 8, 0);
        put_u32(self.data, 12, max_size as u32);
        put_i32(self.data, 16, parent.0);
        put_i32(self.data, 20, page_id.0);
        put_i32(self.data, 24, PageId::INVALID.0);
    }

    pub fn init_internal(
        &mut self,
        page_id: PageId,
        parent: PageId,
        key_size: usize,
        max_size: usize,
    ) {
        self.data.fill(0);
        put_u32(self.data, 0, TYPE_INTERNAL);
        put_u32(self.data, 4, key_size as u32);
        put_u32(self.data, 8, 0);
        put_u32(self.data, 12, max_size as u32);
        put_i32(self.data, 16, parent.0);
        put_i32(self.data, 20, page_id.0);
    }

    pub fn set_size(&mut self, size: usize) {
        put_u32(self.data, 8, size as u32);
    }

    pub fn set_parent_page_id(&mut self, parent: PageId) {
        put_i32(self.data, 16, parent.0);
    }

    pub fn set_leaf_next_page_id(&mut self, next: PageId) {
        debug_assert!(self.as_ref().is_leaf());
        put_i32(self.data, 24, next.0);
    }

    fn pair_range(&self, idx: usize) -> (usize, usize) {
        let view = self.as_ref();
        let pair = match view.node_type() {
            NodeType::Leaf => view.key_size() + 8,
            NodeType::Internal => view.key_size() + 4,
        };
        let off = match view.node_type() {
            NodeType::Leaf => LEAF_HEADER,
            NodeType::Internal => INTERNAL_HEADER,
        };
        (off + idx * pair, pair)
    }

    pub fn set_key_at(&mut self, idx: usize, key: &[u8]) {
        let key_size = self.as_ref().key_size();
        debug_assert_eq!(key.len(), key_size);
        let (at, _) = self.pair_range(idx);
        self.data[at..at + key_size].copy_from_slice(key);
    }

    pub fn set_leaf_value_at(&mut self, idx: usize, rid: RowId) {
        let key_size = self.as_ref().key_size();
        let (at, _) = self.pair_range(idx);
        put_u32(self.data, at + key_size, rid.page_id.0 as u32);
        put_u32(self.data, at + key_size + 4, rid.slot);
    }

    pub fn set_child_at(&mut self, idx: usize, child: PageId) {
        let key_size = self.as_ref().key_size();
        let (at, _) = self.pair_range(idx);
        put_i32(self.data, at + key_size, child.0);
    }

    /// Shift pairs `[idx, size)` one position right, opening a gap at `idx`.
    pub fn open_gap(&mut self, idx: usize) {
        let size = self.as_ref().size();
        debug_assert!(idx <= size);
        let (start, pair) = self.pair_range(idx);
        let end = start + (size - idx) * pair;
        self.data.copy_within(start..end, start + pair);
        self.set_size(size + 1);
    }

    /// Remove the pair at `idx`, closing the gap.
    pub fn remove_at(&mut self, idx: usize) {
        let size = self.as_ref().size();
        debug_assert!(idx < size);
        let (start, pair) = self.pair_range(idx);
        let end = self.pair_range(size).0;
        self.data.copy_within(start + pair..end, start);
        self.set_size(size - 1);
    }

    /// Raw bytes of pairs `[from, size)`, for bulk moves between nodes.
    pub fn pairs_bytes(&self, from: usize) -> Vec<u8> {
        let size = self.as_ref().size();
        debug_assert!(from <= size);
        let (start, _) = self.pair_range(from);
        let end = self.pair_range(size).0;
        self.data[start..end].to_vec()
    }

    /// Append raw pair bytes at the node's end.
    pub fn append_pairs(&mut self, bytes: &[u8]) {
        let size = self.as_ref().size();
        let (start, pair) = self.pair_range(size);
        debug_assert_eq!(bytes.len() % pair, 0);
        debug_assert!(start + bytes.len() <= PAGE_SIZE);
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.set_size(size + bytes.len() / pair);
    }

    /// Drop the trailing pairs `[from, size)` after they moved elsewhere.
    pub fn truncate(&mut self, from: usize) {
        debug_assert!(from <= self.as_ref().size());
        self.set_size(from);
    }
}

pub const INDEX_ROOTS_MAGIC_NUM: u32 = u32::from_le_bytes(*b"ROOT");

/// The index-roots page: `(index_id → root_page_id)` pairs behind a magic
/// number and a count. Lives at a fixed logical page id.
pub struct IndexRootsPage;

impl IndexRootsPage {
    const HEADER: usize = 8;
    const ENTRY: usize = 8;

    pub fn format(data: &mut [u8; PAGE_SIZE]) {
        data.fill(0);
        put_u32(data, 0, INDEX_ROOTS_MAGIC_NUM);
        put_u32(data, 4, 0);
    }

    fn count(data: &[u8; PAGE_SIZE]) -> usize {
        if get_u32(data, 0) != INDEX_ROOTS_MAGIC_NUM {
            return 0;
        }
        get_u32(data, 4) as usize
    }

    fn entry_at(data: &[u8; PAGE_SIZE], idx: usize) -> (u32, PageId) {
        let at = Self::HEADER + idx * Self::ENTRY;
        (get_u32(data, at), PageId(get_i32(data, at + 4)))
    }

    pub fn get(data: &[u8; PAGE_SIZE], index_id: u32) -> Option<PageId> {
        (0..Self::count(data))
            .map(|i| Self::entry_at(data, i))
            .find(|(id, _)| *id == index_id)
            .map(|(_, root)| root)
    }

    /// Insert a fresh entry. Returns false when the id is already present
    /// or the page is full.
    pub fn insert(data: &mut [u8; PAGE_SIZE], index_id: u32, root: PageId) -> bool {
        if get_u32(data, 0) != INDEX_ROOTS_MAGIC_NUM {
            Self::format(data);
        }
        let count = Self::count(data);
        if Self::get(data, index_id).is_some()
            || Self::HEADER + (count + 1) * Self::ENTRY > PAGE_SIZE
        {
            return false;
        }
        let at = Self::HEADER + count * Self::ENTRY;
        put_u32(data, at, index_id);
        put_i32(data, at + 4, root.0);
        put_u32(data, 4, count as u32 + 1);
        true
    }

    pub fn update(data: &mut [u8; PAGE_SIZE], index_id: u32, root: PageId) -> bool {
        for i in 0..Self::count(data) {
            let at = Self::HEADER + i * Self::ENTRY;
            if get_u32(data, at) == index_id {
                put_i32(data, at + 4, root.0);
                return true;
            }
        }
        false
    }

    pub fn delete(data: &mut [u8; PAGE_SIZE], index_id: u32) -> bool {
        let count = Self::count(data);
        for i in 0..count {
            let at = Self::HEADER + i * Self::ENTRY;
            if get_u32(data, at) == index_id {
                let tail_start = at + Self::ENTRY;
                let tail_end = Self::HEADER + count * Self::ENTRY;
                data.copy_within(tail_start..tail_end, at);
                put_u32(data, 4, count as u32 - 1);
                return true;
            }
        }
        false
    }
}
