//! On-disk B+-tree index over the buffer pool.
//!
//! An ordered, unique map from fixed-width keys to row ids. All nodes live
//! in buffer-pool pages; the root id of every index is persisted in the
//! index-roots page so trees survive restarts. Mutating operations take
//! `&mut self`, serializing structural changes per index.

#[cfg(test)]
mod tests;

mod key;
mod page;

pub use key::KeyCodec;
pub use page::{IndexRootsPage, NodeMut, NodeRef, NodeType, INTERNAL_HEADER, LEAF_HEADER};

use std::cmp::Ordering;
use std::sync::Arc;

use buffer::{BufferPool, PageGuard};
use common::{IndexId, PageId, RowId, INDEX_ROOTS_PAGE_ID, PAGE_SIZE};
use record::Row;
use tracing::debug;

/// A clustered, unique B+-tree index.
pub struct BPlusTree {
    index_id: IndexId,
    bp: Arc<BufferPool>,
    codec: KeyCodec,
    leaf_max: usize,
    internal_max: usize,
    root_page_id: PageId,
}

impl BPlusTree {
    /// Bind the tree for `index_id`, registering it in the index-roots page
    /// on first use. `leaf_max`/`internal_max` default to the page-filling
    /// fan-out for the codec's key size; supplied and computed sizes are
    /// rounded down to an even count.
    pub fn new(
        index_id: IndexId,
        bp: Arc<BufferPool>,
        codec: KeyCodec,
        leaf_max: Option<usize>,
        internal_max: Option<usize>,
    ) -> Self {
        let key_size = codec.key_size();
        assert!(key_size > 0, "index keys must be at least one byte wide");
        // fan-outs are kept even: a split divides max_size pairs into
        // ⌈max/2⌉ and ⌊max/2⌋, and only an even max_size puts both halves
        // at the ⌈max/2⌉ occupancy floor
        let leaf_capacity = ((PAGE_SIZE - LEAF_HEADER) / (key_size + 8)) & !1;
        let internal_capacity = ((PAGE_SIZE - INTERNAL_HEADER) / (key_size + 4)) & !1;
        assert!(leaf_capacity >= 2, "key too wide for a leaf page");
        assert!(internal_capacity >= 4, "key too wide for an internal page");
        let leaf_max = leaf_max.unwrap_or(leaf_capacity).clamp(2, leaf_capacity) & !1;
        let internal_max =
            internal_max.unwrap_or(internal_capacity).clamp(4, internal_capacity) & !1;

        let root_page_id = {
            let guard = fetch(&bp, INDEX_ROOTS_PAGE_ID);
            let existing = {
                let page = guard.read();
                IndexRootsPage::get(page.data(), index_id.0)
            };
            match existing {
                Some(root) => root,
                None => {
                    let mut page = guard.write();
                    IndexRootsPage::insert(page.data_mut(), index_id.0, PageId::INVALID);
                    PageId::INVALID
                }
            }
        };

        Self {
            index_id,
            bp,
            codec,
            leaf_max,
            internal_max,
            root_page_id,
        }
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn is_empty(&self) -> bool {
        !self.root_page_id.is_valid()
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    /// Levels between root and leaves, inclusive. An empty tree has height
    /// zero.
    pub fn height(&self) -> usize {
        let mut height = 0;
        let mut pid = self.root_page_id;
        while pid.is_valid() {
            height += 1;
            let guard = fetch(&self.bp, pid);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            if node.is_leaf() {
                break;
            }
            pid = node.child_at(0);
        }
        height
    }

    /// Point lookup.
    pub fn get_value(&self, key: &Row) -> Option<RowId> {
        if self.is_empty() {
            return None;
        }
        let encoded = self.codec.encode(key);
        let leaf_pid = self.find_leaf(Some(&encoded));
        let guard = fetch(&self.bp, leaf_pid);
        let page = guard.read();
        let node = NodeRef::new(page.data());
        match self.leaf_search(&node, &encoded) {
            Ok(idx) => Some(node.leaf_value_at(idx)),
            Err(_) => None,
        }
    }

    /// Insert a unique key. Returns false (and changes nothing) when the
    /// key already exists.
    pub fn insert(&mut self, key: &Row, rid: RowId) -> bool {
        let encoded = self.codec.encode(key);
        if self.is_empty() {
            self.start_new_tree(&encoded, rid);
            return true;
        }
        let leaf_pid = self.find_leaf(Some(&encoded));
        let needs_split = {
            let guard = fetch(&self.bp, leaf_pid);
            let mut page = guard.write();
            let mut node = NodeMut::new(page.data_mut());
            match self.leaf_search(&node.as_ref(), &encoded) {
                Ok(_) => return false,
                Err(pos) => {
                    node.open_gap(pos);
                    node.set_key_at(pos, &encoded);
                    node.set_leaf_value_at(pos, rid);
                }
            }
            node.as_ref().size() == self.leaf_max
        };
        if needs_split {
            self.split_leaf(leaf_pid);
        }
        true
    }

    /// Delete `key`. Absent keys are a no-op.
    pub fn remove(&mut self, key: &Row) {
        if self.is_empty() {
            return;
        }
        let encoded = self.codec.encode(key);
        let leaf_pid = self.find_leaf(Some(&encoded));
        let underflow = {
            let guard = fetch(&self.bp, leaf_pid);
            let mut page = guard.write();
            let mut node = NodeMut::new(page.data_mut());
            match self.leaf_search(&node.as_ref(), &encoded) {
                Ok(idx) => node.remove_at(idx),
                Err(_) => return,
            }
            let view = node.as_ref();
            if view.is_root() {
                view.size() == 0
            } else {
                view.size() < view.min_size()
            }
        };
        if underflow {
            self.coalesce_or_redistribute(leaf_pid);
        }
    }

    /// Iterate the whole tree in ascending key order.
    pub fn iter(&self) -> TreeIterator<'_> {
        if self.is_empty() {
            return TreeIterator {
                tree: self,
                page_id: PageId::INVALID,
                slot: 0,
            };
        }
        TreeIterator {
            tree: self,
            page_id: self.find_leaf(None),
            slot: 0,
        }
    }

    /// Iterate starting at the first key `>= key`.
    pub fn iter_from(&self, key: &Row) -> TreeIterator<'_> {
        if self.is_empty() {
            return TreeIterator {
                tree: self,
                page_id: PageId::INVALID,
                slot: 0,
            };
        }
        let encoded = self.codec.encode(key);
        let leaf_pid = self.find_leaf(Some(&encoded));
        let (page_id, slot) = {
            let guard = fetch(&self.bp, leaf_pid);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            let pos = match self.leaf_search(&node, &encoded) {
                Ok(idx) => idx,
                Err(idx) => idx,
            };
            if pos < node.size() {
                (leaf_pid, pos)
            } else {
                (node.leaf_next_page_id(), 0)
            }
        };
        TreeIterator {
            tree: self,
            page_id,
            slot,
        }
    }

    /// Delete every page of the tree and drop its roots-page entry.
    pub fn destroy(&mut self) {
        if self.root_page_id.is_valid() {
            self.destroy_subtree(self.root_page_id);
        }
        let guard = fetch(&self.bp, INDEX_ROOTS_PAGE_ID);
        let mut page = guard.write();
        IndexRootsPage::delete(page.data_mut(), self.index_id.0);
        self.root_page_id = PageId::INVALID;
    }

    fn destroy_subtree(&self, pid: PageId) {
        let children = {
            let guard = fetch(&self.bp, pid);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            if node.is_leaf() {
                Vec::new()
            } else {
                (0..node.size()).map(|i| node.child_at(i)).collect()
            }
        };
        for child in children {
            self.destroy_subtree(child);
        }
        self.bp.delete_page(pid);
    }

    // ---- descent helpers ----

    /// Leaf that should contain `key`; the leftmost leaf when `key` is
    /// `None`. The tree must be non-empty.
    fn find_leaf(&self, key: Option<&[u8]>) -> PageId {
        let mut pid = self.root_page_id;
        loop {
            let guard = fetch(&self.bp, pid);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            if node.is_leaf() {
                return pid;
            }
            pid = match key {
                None => node.child_at(0),
                Some(k) => node.child_at(self.internal_lookup(&node, k)),
            };
        }
    }

    /// Child index whose key range contains `key`. `key[0]` is the dummy
    /// lower bound, so the search starts at index 1.
    fn internal_lookup(&self, node: &NodeRef<'_>, key: &[u8]) -> usize {
        let mut lo = 1;
        let mut hi = node.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.codec.compare(node.key_at(mid), key) != Ordering::Greater {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo - 1
    }

    /// Binary search within a leaf: `Ok(idx)` on an exact hit, `Err(pos)`
    /// with the insertion point otherwise.
    fn leaf_search(&self, node: &NodeRef<'_>, key: &[u8]) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = node.size();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.codec.compare(node.key_at(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    // ---- insertion ----

    fn start_new_tree(&mut self, key: &[u8], rid: RowId) {
        let pid = {
            let guard = self.new_tree_page();
            let pid = guard.page_id();
            let mut page = guard.write();
            let mut node = NodeMut::new(page.data_mut());
            node.init_leaf(pid, PageId::INVALID, self.codec.key_size(), self.leaf_max);
            node.open_gap(0);
            node.set_key_at(0, key);
            node.set_leaf_value_at(0, rid);
            pid
        };
        self.root_page_id = pid;
        self.update_root_page_id();
        debug!(index = self.index_id.0, root = pid.0, "started new tree");
    }

    fn split_leaf(&mut self, pid: PageId) {
        let new_guard = self.new_tree_page();
        let new_pid = new_guard.page_id();

        let separator = {
            let guard = fetch(&self.bp, pid);
            let mut page = guard.write();
            let mut node = NodeMut::new(page.data_mut());
            let size = node.as_ref().size();
            let keep = size - size / 2;
            let moved = node.pairs_bytes(keep);
            let parent = node.as_ref().parent_page_id();
            let next = node.as_ref().leaf_next_page_id();
            let separator = node.as_ref().key_at(keep).to_vec();
            {
                let mut new_page = new_guard.write();
                let mut new_node = NodeMut::new(new_page.data_mut());
                new_node.init_leaf(new_pid, parent, self.codec.key_size(), self.leaf_max);
                new_node.append_pairs(&moved);
                new_node.set_leaf_next_page_id(next);
            }
            node.truncate(keep);
            node.set_leaf_next_page_id(new_pid);
            separator
        };
        drop(new_guard);
        self.insert_into_parent(pid, separator, new_pid);
    }

    fn split_internal(&mut self, pid: PageId) {
        let new_guard = self.new_tree_page();
        let new_pid = new_guard.page_id();

        let (separator, moved_children) = {
            let guard = fetch(&self.bp, pid);
            let mut page = guard.write();
            let mut node = NodeMut::new(page.data_mut());
            let size = node.as_ref().size();
            let keep = size - size / 2;
            let moved = node.pairs_bytes(keep);
            let parent = node.as_ref().parent_page_id();
            // the split key moves up; it stays behind as the right node's
            // never-compared dummy
            let separator = node.as_ref().key_at(keep).to_vec();
            {
                let mut new_page = new_guard.write();
                let mut new_node = NodeMut::new(new_page.data_mut());
                new_node.init_internal(new_pid, parent, self.codec.key_size(), self.internal_max);
                new_node.append_pairs(&moved);
            }
            node.truncate(keep);
            let moved_children = {
                let new_page = new_guard.read();
                let new_node = NodeRef::new(new_page.data());
                (0..new_node.size()).map(|i| new_node.child_at(i)).collect::<Vec<_>>()
            };
            (separator, moved_children)
        };
        for child in moved_children {
            self.set_parent(child, new_pid);
        }
        drop(new_guard);
        self.insert_into_parent(pid, separator, new_pid);
    }

    fn insert_into_parent(&mut self, left_pid: PageId, separator: Vec<u8>, right_pid: PageId) {
        let parent_pid = {
            let guard = fetch(&self.bp, left_pid);
            let page = guard.read();
            NodeRef::new(page.data()).parent_page_id()
        };

        if !parent_pid.is_valid() {
            // the old root split: grow a new root above it
            let guard = self.new_tree_page();
            let root_pid = guard.page_id();
            {
                let mut page = guard.write();
                let mut root = NodeMut::new(page.data_mut());
                root.init_internal(
                    root_pid,
                    PageId::INVALID,
                    self.codec.key_size(),
                    self.internal_max,
                );
                root.open_gap(0);
                root.set_child_at(0, left_pid);
                root.open_gap(1);
                root.set_key_at(1, &separator);
                root.set_child_at(1, right_pid);
            }
            drop(guard);
            self.set_parent(left_pid, root_pid);
            self.set_parent(right_pid, root_pid);
            self.root_page_id = root_pid;
            self.update_root_page_id();
            return;
        }

        let needs_split = {
            let guard = fetch(&self.bp, parent_pid);
            let mut page = guard.write();
            let mut parent = NodeMut::new(page.data_mut());
            let idx = parent
                .as_ref()
                .child_index(left_pid)
                .expect("split child is under its parent")
                + 1;
            parent.open_gap(idx);
            parent.set_key_at(idx, &separator);
            parent.set_child_at(idx, right_pid);
            parent.as_ref().size() == self.internal_max
        };
        self.set_parent(right_pid, parent_pid);
        if needs_split {
            self.split_internal(parent_pid);
        }
    }

    // ---- deletion ----

    fn coalesce_or_redistribute(&mut self, pid: PageId) {
        let (is_root, parent_pid) = {
            let guard = fetch(&self.bp, pid);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            (node.is_root(), node.parent_page_id())
        };
        if is_root {
            self.adjust_root(pid);
            return;
        }

        let (idx, sibling_pid) = {
            let guard = fetch(&self.bp, parent_pid);
            let page = guard.read();
            let parent = NodeRef::new(page.data());
            let idx = parent
                .child_index(pid)
                .expect("underflowing node is under its parent");
            let sibling_idx = if idx == 0 { 1 } else { idx - 1 };
            (idx, parent.child_at(sibling_idx))
        };

        let (node_size, sibling_size, max_size) = {
            let node_guard = fetch(&self.bp, pid);
            let sibling_guard = fetch(&self.bp, sibling_pid);
            let node_page = node_guard.read();
            let sibling_page = sibling_guard.read();
            let node = NodeRef::new(node_page.data());
            (
                node.size(),
                NodeRef::new(sibling_page.data()).size(),
                node.max_size(),
            )
        };

        if node_size + sibling_size < max_size {
            self.coalesce(parent_pid, idx, pid, sibling_pid);
        } else {
            self.redistribute(parent_pid, idx, pid, sibling_pid);
        }
    }

    /// Merge the right node of the pair into the left and drop the
    /// separator from the parent, recursing when the parent underflows.
    fn coalesce(&mut self, parent_pid: PageId, idx: usize, node_pid: PageId, sibling_pid: PageId) {
        let (left_pid, right_pid, right_index) = if idx == 0 {
            (node_pid, sibling_pid, 1)
        } else {
            (sibling_pid, node_pid, idx)
        };
        let separator = {
            let guard = fetch(&self.bp, parent_pid);
            let page = guard.read();
            NodeRef::new(page.data()).key_at(right_index).to_vec()
        };

        let moved_children = {
            let left_guard = fetch(&self.bp, left_pid);
            let right_guard = fetch(&self.bp, right_pid);
            let mut left_page = left_guard.write();
            let mut right_page = right_guard.write();
            let mut left = NodeMut::new(left_page.data_mut());
            let mut right = NodeMut::new(right_page.data_mut());
            let mut moved_children = Vec::new();
            if left.as_ref().is_leaf() {
                let moved = right.pairs_bytes(0);
                left.append_pairs(&moved);
                left.set_leaf_next_page_id(right.as_ref().leaf_next_page_id());
            } else {
                // the separator comes back down in place of the right
                // node's dummy key
                right.set_key_at(0, &separator);
                let moved = right.pairs_bytes(0);
                moved_children = (0..right.as_ref().size())
                    .map(|i| right.as_ref().child_at(i))
                    .collect();
                left.append_pairs(&moved);
            }
            right.truncate(0);
            moved_children
        };
        for child in moved_children {
            self.set_parent(child, left_pid);
        }
        self.bp.delete_page(right_pid);

        let parent_underflow = {
            let guard = fetch(&self.bp, parent_pid);
            let mut page = guard.write();
            let mut parent = NodeMut::new(page.data_mut());
            parent.remove_at(right_index);
            let view = parent.as_ref();
            if view.is_root() {
                view.size() == 1
            } else {
                view.size() < view.min_size()
            }
        };
        if parent_underflow {
            self.coalesce_or_redistribute(parent_pid);
        }
    }

    /// Move one pair from the sibling into the underflowing node and patch
    /// the parent's separator.
    fn redistribute(
        &mut self,
        parent_pid: PageId,
        idx: usize,
        node_pid: PageId,
        sibling_pid: PageId,
    ) {
        let node_guard = fetch(&self.bp, node_pid);
        let sibling_guard = fetch(&self.bp, sibling_pid);
        let parent_guard = fetch(&self.bp, parent_pid);
        let mut node_page = node_guard.write();
        let mut sibling_page = sibling_guard.write();
        let mut parent_page = parent_guard.write();
        let mut node = NodeMut::new(node_page.data_mut());
        let mut sibling = NodeMut::new(sibling_page.data_mut());
        let mut parent = NodeMut::new(parent_page.data_mut());

        let mut adopted: Option<PageId> = None;
        if node.as_ref().is_leaf() {
            if idx == 0 {
                // right sibling: its first pair moves to our end
                let key = sibling.as_ref().key_at(0).to_vec();
                let value = sibling.as_ref().leaf_value_at(0);
                sibling.remove_at(0);
                let end = node.as_ref().size();
                node.open_gap(end);
                node.set_key_at(end, &key);
                node.set_leaf_value_at(end, value);
                let new_first = sibling.as_ref().key_at(0).to_vec();
                parent.set_key_at(1, &new_first);
            } else {
                // left sibling: its last pair moves to our front
                let last = sibling.as_ref().size() - 1;
                let key = sibling.as_ref().key_at(last).to_vec();
                let value = sibling.as_ref().leaf_value_at(last);
                sibling.truncate(last);
                node.open_gap(0);
                node.set_key_at(0, &key);
                node.set_leaf_value_at(0, value);
                parent.set_key_at(idx, &key);
            }
        } else if idx == 0 {
            // right sibling: its first child moves to our end, woven in
            // with the parent separator
            let separator = parent.as_ref().key_at(1).to_vec();
            let moved_child = sibling.as_ref().child_at(0);
            let new_separator = sibling.as_ref().key_at(1).to_vec();
            sibling.remove_at(0);
            let end = node.as_ref().size();
            node.open_gap(end);
            node.set_key_at(end, &separator);
            node.set_child_at(end, moved_child);
            parent.set_key_at(1, &new_separator);
            adopted = Some(moved_child);
        } else {
            // left sibling: its last child moves to our front
            let separator = parent.as_ref().key_at(idx).to_vec();
            let last = sibling.as_ref().size() - 1;
            let moved_child = sibling.as_ref().child_at(last);
            let moved_key = sibling.as_ref().key_at(last).to_vec();
            sibling.truncate(last);
            node.open_gap(0);
            node.set_child_at(0, moved_child);
            node.set_key_at(1, &separator);
            parent.set_key_at(idx, &moved_key);
            adopted = Some(moved_child);
        }

        drop(node_page);
        drop(sibling_page);
        drop(parent_page);
        if let Some(child) = adopted {
            self.set_parent(child, node_pid);
        }
    }

    /// The root underflowed: promote its only child, or clear an empty
    /// tree.
    fn adjust_root(&mut self, root_pid: PageId) {
        enum Action {
            Promote(PageId),
            Clear,
            Keep,
        }
        let action = {
            let guard = fetch(&self.bp, root_pid);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            if !node.is_leaf() && node.size() == 1 {
                Action::Promote(node.child_at(0))
            } else if node.is_leaf() && node.size() == 0 {
                Action::Clear
            } else {
                Action::Keep
            }
        };
        match action {
            Action::Promote(child) => {
                self.set_parent(child, PageId::INVALID);
                self.bp.delete_page(root_pid);
                self.root_page_id = child;
                self.update_root_page_id();
            }
            Action::Clear => {
                self.bp.delete_page(root_pid);
                self.root_page_id = PageId::INVALID;
                self.update_root_page_id();
            }
            Action::Keep => {}
        }
    }

    // ---- plumbing ----

    fn new_tree_page(&self) -> PageGuard<'_> {
        self.bp.new_page().expect("buffer pool exhausted")
    }

    fn set_parent(&self, pid: PageId, parent: PageId) {
        let guard = fetch(&self.bp, pid);
        let mut page = guard.write();
        NodeMut::new(page.data_mut()).set_parent_page_id(parent);
    }

    /// Mirror the in-memory root id into the index-roots page.
    fn update_root_page_id(&self) {
        let guard = fetch(&self.bp, INDEX_ROOTS_PAGE_ID);
        let mut page = guard.write();
        if !IndexRootsPage::update(page.data_mut(), self.index_id.0, self.root_page_id) {
            IndexRootsPage::insert(page.data_mut(), self.index_id.0, self.root_page_id);
        }
    }
}

fn fetch<'a>(bp: &'a Arc<BufferPool>, pid: PageId) -> PageGuard<'a> {
    bp.fetch_page(pid).expect("buffer pool exhausted")
}

/// Forward cursor over the leaf chain. Yields `(key, rid)` pairs in
/// ascending key order; an iterator whose page id is invalid is exhausted.
pub struct TreeIterator<'a> {
    tree: &'a BPlusTree,
    page_id: PageId,
    slot: usize,
}

impl Iterator for TreeIterator<'_> {
    type Item = (Row, RowId);

    fn next(&mut self) -> Option<(Row, RowId)> {
        while self.page_id.is_valid() {
            let guard = fetch(&self.tree.bp, self.page_id);
            let page = guard.read();
            let node = NodeRef::new(page.data());
            if self.slot < node.size() {
                let key = self.tree.codec.decode(node.key_at(self.slot));
                let rid = node.leaf_value_at(self.slot);
                self.slot += 1;
                return Some((key, rid));
            }
            self.page_id = node.leaf_next_page_id();
            self.slot = 0;
        }
        None
    }
}
