//! Table heaps: tuples stored across a doubly linked list of slotted pages.


mod table_page;

pub use table_page::{tuple_bytes, TablePage, TablePageMut, UpdateResult, MAX_TUPLE_SIZE};

use std::sync::{Arc, Mutex};

use buffer::BufferPool;
use common::{DbError, DbResult, PageId, RowId};
use record::{Row, Schema};
use tracing::debug;
use txn::{LockManager, Txn};

/// A linked list of slotted pages holding one table's tuples.
///
/// When built with a lock manager, mutations take the row's exclusive lock
/// and reads its shared lock before touching the page latch, so a blocked
/// lock request never holds a latch.
pub struct TableHeap {
    bp: Arc<BufferPool>,
    schema: Arc<Schema>,
    first_page_id: PageId,
    last_page_id: Mutex<PageId>,
    lock_mgr: Option<Arc<LockManager>>,
}

impl TableHeap {
    /// Create a heap with one empty page.
    pub fn create(
        bp: Arc<BufferPool>,
        schema: Arc<Schema>,
        lock_mgr: Option<Arc<LockManager>>,
    ) -> DbResult<TableHeap> {
        let first_page_id = {
            let guard = bp
                .new_page()
                .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
            let pid = guard.page_id();
            let mut page = guard.write();
            TablePageMut::new(page.data_mut()).init(pid, PageId::INVALID);
            pid
        };
        debug!(page = first_page_id.0, "created table heap");
        Ok(Self {
            bp,
            schema,
            first_page_id,
            last_page_id: Mutex::new(first_page_id),
            lock_mgr,
        })
    }

    /// Bind a heap that already exists on disk.
    pub fn open(
        bp: Arc<BufferPool>,
        schema: Arc<Schema>,
        first_page_id: PageId,
        lock_mgr: Option<Arc<LockManager>>,
    ) -> TableHeap {
        Self {
            bp,
            schema,
            first_page_id,
            last_page_id: Mutex::new(first_page_id),
            lock_mgr,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.bp
    }

    /// Insert a tuple, assigning `row.rid`. Starts at the cached tail page
    /// and grows the chain when no page has room.
    pub fn insert_tuple(&self, row: &mut Row, txn: Option<&Txn>) -> DbResult<()> {
        let bytes = tuple_bytes(row, &self.schema);
        if bytes.len() > MAX_TUPLE_SIZE {
            return Err(DbError::Failed(format!(
                "tuple of {} bytes exceeds page capacity",
                bytes.len()
            )));
        }

        let mut pid = *self.last_page_id.lock().expect("heap latch poisoned");
        let rid = loop {
            let guard = self
                .bp
                .fetch_page(pid)
                .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
            let mut page = guard.write();
            let mut table_page = TablePageMut::new(page.data_mut());
            if let Some(slot) = table_page.insert_tuple(&bytes) {
                *self.last_page_id.lock().expect("heap latch poisoned") = pid;
                break RowId::new(pid, slot);
            }
            let next = table_page.as_ref().next_page_id();
            if next.is_valid() {
                pid = next;
                continue;
            }
            // tail is full: grow the chain
            let new_guard = self
                .bp
                .new_page()
                .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
            let new_pid = new_guard.page_id();
            {
                let mut new_page = new_guard.write();
                TablePageMut::new(new_page.data_mut()).init(new_pid, pid);
            }
            table_page.set_next_page_id(new_pid);
            pid = new_pid;
        };

        row.rid = rid;
        if let (Some(lock_mgr), Some(txn)) = (&self.lock_mgr, txn) {
            if !txn.holds_exclusive(rid) {
                lock_mgr.lock_exclusive(txn, rid)?;
            }
        }
        Ok(())
    }

    /// Read the tuple at `rid`. Tombstoned tuples are still readable.
    pub fn get_tuple(&self, rid: RowId, txn: Option<&Txn>) -> DbResult<Row> {
        if let (Some(lock_mgr), Some(txn)) = (&self.lock_mgr, txn) {
            if !txn.holds_exclusive(rid) && !txn.holds_shared(rid) {
                lock_mgr.lock_shared(txn, rid)?;
            }
        }
        let guard = self
            .bp
            .fetch_page(rid.page_id)
            .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
        let page = guard.read();
        let table_page = TablePage::new(page.data());
        let mut row = table_page
            .get_tuple(rid.slot, &self.schema)
            .ok_or(DbError::KeyNotFound)?;
        row.rid = rid;
        Ok(row)
    }

    /// Tombstone the tuple so the delete can still be rolled back.
    pub fn mark_delete(&self, rid: RowId, txn: Option<&Txn>) -> DbResult<()> {
        self.lock_exclusive_for(rid, txn)?;
        self.with_page_mut(rid.page_id, |table_page| {
            if table_page.mark_delete(rid.slot) {
                Ok(())
            } else {
                Err(DbError::KeyNotFound)
            }
        })
    }

    /// Free the slot for good.
    pub fn apply_delete(&self, rid: RowId, txn: Option<&Txn>) -> DbResult<()> {
        self.lock_exclusive_for(rid, txn)?;
        self.with_page_mut(rid.page_id, |table_page| {
            if table_page.apply_delete(rid.slot) {
                Ok(())
            } else {
                Err(DbError::KeyNotFound)
            }
        })
    }

    /// Clear a tombstone set by [`TableHeap::mark_delete`].
    pub fn rollback_delete(&self, rid: RowId, txn: Option<&Txn>) -> DbResult<()> {
        self.lock_exclusive_for(rid, txn)?;
        self.with_page_mut(rid.page_id, |table_page| {
            if table_page.rollback_delete(rid.slot) {
                Ok(())
            } else {
                Err(DbError::KeyNotFound)
            }
        })
    }

    /// Replace the tuple at `rid` with `row`, returning the old tuple.
    /// When the replacement does not fit in its page the tuple moves:
    /// the old slot is freed, the row is reinserted elsewhere, and
    /// `row.rid` carries the new location (index entries must follow).
    pub fn update_tuple(&self, row: &mut Row, rid: RowId, txn: Option<&Txn>) -> DbResult<Row> {
        self.lock_exclusive_for(rid, txn)?;
        let bytes = tuple_bytes(row, &self.schema);

        enum Outcome {
            Done(Row),
            Relocate(Row),
        }
        let outcome = self.with_page_mut(rid.page_id, |table_page| {
            let mut old = table_page
                .as_ref()
                .get_tuple(rid.slot, &self.schema)
                .ok_or(DbError::KeyNotFound)?;
            old.rid = rid;
            match table_page.update_tuple(rid.slot, &bytes) {
                UpdateResult::Updated => Ok(Outcome::Done(old)),
                UpdateResult::NotFound => Err(DbError::KeyNotFound),
                UpdateResult::Deleted => {
                    Err(DbError::Failed("update of a deleted tuple".into()))
                }
                UpdateResult::TooLarge => {
                    table_page.apply_delete(rid.slot);
                    Ok(Outcome::Relocate(old))
                }
            }
        })?;

        match outcome {
            Outcome::Done(old) => {
                row.rid = rid;
                Ok(old)
            }
            Outcome::Relocate(old) => {
                self.insert_tuple(row, txn)?;
                Ok(old)
            }
        }
    }

    /// Free every page of the heap. The caller must hold no pins on them.
    pub fn delete_table(&self) -> DbResult<()> {
        let mut pid = self.first_page_id;
        while pid.is_valid() {
            let next = {
                let guard = self
                    .bp
                    .fetch_page(pid)
                    .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
                let page = guard.read();
                TablePage::new(page.data()).next_page_id()
            };
            if !self.bp.delete_page(pid) {
                return Err(DbError::Failed(format!("page {pid} still pinned")));
            }
            pid = next;
        }
        Ok(())
    }

    /// Forward cursor over the visible tuples.
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator {
            heap: self,
            rid: self.first_rid(),
        }
    }

    fn first_rid(&self) -> RowId {
        self.first_visible_from(self.first_page_id, None)
    }

    /// Next visible rid after `rid`, or the invalid sentinel.
    fn next_rid(&self, rid: RowId) -> RowId {
        self.first_visible_from(rid.page_id, Some(rid.slot))
    }

    /// Scan pages beginning at `pid`; in the first page start after `after`
    /// when given, else from slot 0.
    fn first_visible_from(&self, pid: PageId, after: Option<u32>) -> RowId {
        let mut pid = pid;
        let mut after = after;
        while pid.is_valid() {
            let Some(guard) = self.bp.fetch_page(pid) else {
                return RowId::INVALID;
            };
            let page = guard.read();
            let table_page = TablePage::new(page.data());
            let found = match after.take() {
                Some(slot) => table_page.next_tuple_slot(slot),
                None => table_page.first_tuple_slot(),
            };
            if let Some(slot) = found {
                return RowId::new(pid, slot);
            }
            pid = table_page.next_page_id();
        }
        RowId::INVALID
    }

    fn lock_exclusive_for(&self, rid: RowId, txn: Option<&Txn>) -> DbResult<()> {
        if let (Some(lock_mgr), Some(txn)) = (&self.lock_mgr, txn) {
            if txn.holds_exclusive(rid) {
                return Ok(());
            }
            if txn.holds_shared(rid) {
                return lock_mgr.lock_upgrade(txn, rid);
            }
            lock_mgr.lock_exclusive(txn, rid)?;
        }
        Ok(())
    }

    fn with_page_mut<T>(
        &self,
        pid: PageId,
        f: impl FnOnce(&mut TablePageMut<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        let guard = self
            .bp
            .fetch_page(pid)
            .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
        let mut page = guard.write();
        let mut table_page = TablePageMut::new(page.data_mut());
        f(&mut table_page)
    }
}

/// Forward iterator over a heap's visible tuples. Terminates at the
/// `(INVALID_PAGE_ID, 0)` sentinel.
pub struct TableIterator<'a> {
    heap: &'a TableHeap,
    rid: RowId,
}

impl TableIterator<'_> {
    /// The rid the iterator currently points at.
    pub fn rid(&self) -> RowId {
        self.rid
    }
}

impl Iterator for TableIterator<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        while self.rid.is_valid() {
            let current = self.rid;
            self.rid = self.heap.next_rid(current);
            if let Ok(row) = self.heap.get_tuple(current, None) {
                return Some(row);
            }
        }
        None
    }
}
