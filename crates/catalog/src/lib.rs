//! The catalog: persistent metadata for tables and indexes, materialized
//! into live [`TableHeap`] and [`BPlusTree`] bindings on startup.


mod meta;

pub use meta::{
    CatalogMeta, IndexMetadata, TableMetadata, CATALOG_MAGIC_NUM, INDEX_METADATA_MAGIC_NUM,
    TABLE_METADATA_MAGIC_NUM,
};

use std::sync::{Arc, Mutex};

use ahash::RandomState;
use btree::{BPlusTree, KeyCodec};
use buffer::BufferPool;
use common::{DbError, DbResult, IndexId, PageId, RowId, TableId, CATALOG_META_PAGE_ID};
use hashbrown::HashMap;
use record::codec::{Reader, Writer};
use record::{Row, Schema};
use storage::TableHeap;
use tracing::debug;
use txn::LockManager;

type Map<K, V> = HashMap<K, V, RandomState>;

/// A table bound to its heap.
pub struct TableInfo {
    meta: TableMetadata,
    heap: TableHeap,
}

impl std::fmt::Debug for TableInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableInfo").field("meta", &self.meta).finish()
    }
}

impl TableInfo {
    pub fn table_id(&self) -> TableId {
        self.meta.table_id
    }

    pub fn name(&self) -> &str {
        &self.meta.table_name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.meta.schema
    }

    pub fn heap(&self) -> &TableHeap {
        &self.heap
    }

    pub fn meta(&self) -> &TableMetadata {
        &self.meta
    }
}

/// An index bound to its tree. The tree is behind a mutex: structural
/// changes to one index are serialized, readers of other indexes proceed.
pub struct IndexInfo {
    meta: IndexMetadata,
    key_schema: Arc<Schema>,
    tree: Mutex<BPlusTree>,
}

impl std::fmt::Debug for IndexInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexInfo")
            .field("meta", &self.meta)
            .field("key_schema", &self.key_schema)
            .finish()
    }
}

impl IndexInfo {
    pub fn index_id(&self) -> IndexId {
        self.meta.index_id
    }

    pub fn name(&self) -> &str {
        &self.meta.index_name
    }

    pub fn table_id(&self) -> TableId {
        self.meta.table_id
    }

    pub fn key_schema(&self) -> &Arc<Schema> {
        &self.key_schema
    }

    pub fn meta(&self) -> &IndexMetadata {
        &self.meta
    }

    /// Project a full table row onto this index's key columns.
    pub fn key_row(&self, row: &Row) -> Row {
        let values = self
            .meta
            .key_map
            .iter()
            .map(|&ordinal| row.values[ordinal as usize].clone())
            .collect();
        let mut key = Row::new(values);
        key.rid = row.rid;
        key
    }

    /// Index the tuple at `row.rid`. Fails on a duplicate key.
    pub fn insert_entry(&self, row: &Row) -> DbResult<()> {
        let key = self.key_row(row);
        let mut tree = self.tree.lock().expect("index latch poisoned");
        if tree.insert(&key, row.rid) {
            Ok(())
        } else {
            Err(DbError::Failed(format!(
                "duplicate key in unique index '{}'",
                self.meta.index_name
            )))
        }
    }

    /// Drop the entry for `row`, if present.
    pub fn remove_entry(&self, row: &Row) {
        let key = self.key_row(row);
        self.tree.lock().expect("index latch poisoned").remove(&key);
    }

    /// Point lookup with a key already in key-schema order.
    pub fn lookup(&self, key: &Row) -> Option<RowId> {
        self.tree.lock().expect("index latch poisoned").get_value(key)
    }

    /// Every `(key, rid)` pair in ascending key order.
    pub fn scan(&self) -> Vec<(Row, RowId)> {
        self.tree.lock().expect("index latch poisoned").iter().collect()
    }

    fn destroy(&self) {
        self.tree.lock().expect("index latch poisoned").destroy();
    }
}

struct CatalogState {
    meta: CatalogMeta,
    tables: Map<TableId, Arc<TableInfo>>,
    table_names: Map<String, TableId>,
    indexes: Map<IndexId, Arc<IndexInfo>>,
    index_names: Map<String, Map<String, IndexId>>,
    next_table_id: TableId,
    next_index_id: IndexId,
}

impl CatalogState {
    fn empty() -> Self {
        Self {
            meta: CatalogMeta::default(),
            tables: Map::default(),
            table_names: Map::default(),
            indexes: Map::default(),
            index_names: Map::default(),
            next_table_id: TableId(0),
            next_index_id: IndexId(0),
        }
    }
}

/// Owns every table and index registration. Each mutation serializes a new
/// catalog meta page and flushes it.
pub struct CatalogManager {
    bp: Arc<BufferPool>,
    lock_mgr: Option<Arc<LockManager>>,
    state: Mutex<CatalogState>,
}

impl CatalogManager {
    /// `init` starts a fresh catalog; otherwise the catalog meta page is
    /// read back and every table and index is rebound.
    pub fn new(
        bp: Arc<BufferPool>,
        lock_mgr: Option<Arc<LockManager>>,
        init: bool,
    ) -> DbResult<CatalogManager> {
        let manager = CatalogManager {
            bp,
            lock_mgr,
            state: Mutex::new(CatalogState::empty()),
        };
        if init {
            let state = manager.state.lock().expect("catalog latch poisoned");
            manager.write_meta_page(&state);
            drop(state);
            return Ok(manager);
        }

        let meta = {
            let guard = manager
                .bp
                .fetch_page(CATALOG_META_PAGE_ID)
                .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
            let page = guard.read();
            let mut reader = Reader::new(page.data());
            CatalogMeta::deserialize_from(&mut reader)?
        };

        let mut state = manager.state.lock().expect("catalog latch poisoned");
        state.next_table_id = meta.next_table_id();
        state.next_index_id = meta.next_index_id();

        for (&table_id, &meta_page) in &meta.table_meta_pages {
            let table_meta = {
                let guard = manager
                    .bp
                    .fetch_page(meta_page)
                    .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
                let page = guard.read();
                let mut reader = Reader::new(page.data());
                TableMetadata::deserialize_from(&mut reader)?
            };
            debug_assert_eq!(table_meta.table_id, table_id);
            let heap = TableHeap::open(
                manager.bp.clone(),
                table_meta.schema.clone(),
                table_meta.first_page_id,
                manager.lock_mgr.clone(),
            );
            state.table_names.insert(table_meta.table_name.clone(), table_id);
            state.tables.insert(
                table_id,
                Arc::new(TableInfo {
                    meta: table_meta,
                    heap,
                }),
            );
        }

        for &meta_page in meta.index_meta_pages.values() {
            let index_meta = {
                let guard = manager
                    .bp
                    .fetch_page(meta_page)
                    .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
                let page = guard.read();
                let mut reader = Reader::new(page.data());
                IndexMetadata::deserialize_from(&mut reader)?
            };
            let table = state
                .tables
                .get(&index_meta.table_id)
                .ok_or_else(|| {
                    DbError::Failed(format!(
                        "index '{}' references unknown table id {}",
                        index_meta.index_name, index_meta.table_id.0
                    ))
                })?
                .clone();
            let info = manager.bind_index(index_meta, &table);
            state
                .index_names
                .entry(table.name().to_string())
                .or_default()
                .insert(info.name().to_string(), info.index_id());
            state.indexes.insert(info.index_id(), info);
        }
        state.meta = meta;
        drop(state);
        Ok(manager)
    }

    pub fn create_table(&self, table_name: &str, schema: Schema) -> DbResult<Arc<TableInfo>> {
        let mut state = self.state.lock().expect("catalog latch poisoned");
        if state.table_names.contains_key(table_name) {
            return Err(DbError::TableAlreadyExist(table_name.to_string()));
        }
        let table_id = state.next_table_id;
        state.next_table_id = TableId(table_id.0 + 1);

        let schema = Arc::new(schema);
        let heap = TableHeap::create(self.bp.clone(), schema.clone(), self.lock_mgr.clone())?;
        let table_meta = TableMetadata {
            table_id,
            table_name: table_name.to_string(),
            first_page_id: heap.first_page_id(),
            schema,
        };
        let meta_page = self.write_table_meta(&table_meta)?;

        state.meta.table_meta_pages.insert(table_id, meta_page);
        let info = Arc::new(TableInfo {
            meta: table_meta,
            heap,
        });
        state.tables.insert(table_id, info.clone());
        state.table_names.insert(table_name.to_string(), table_id);
        self.write_meta_page(&state);
        debug!(table = table_name, id = table_id.0, "created table");
        Ok(info)
    }

    pub fn get_table(&self, table_name: &str) -> DbResult<Arc<TableInfo>> {
        let state = self.state.lock().expect("catalog latch poisoned");
        let table_id = state
            .table_names
            .get(table_name)
            .copied()
            .ok_or_else(|| DbError::TableNotExist(table_name.to_string()))?;
        Ok(state.tables[&table_id].clone())
    }

    pub fn get_table_by_id(&self, table_id: TableId) -> DbResult<Arc<TableInfo>> {
        let state = self.state.lock().expect("catalog latch poisoned");
        state
            .tables
            .get(&table_id)
            .cloned()
            .ok_or_else(|| DbError::TableNotExist(format!("#{}", table_id.0)))
    }

    pub fn get_tables(&self) -> Vec<Arc<TableInfo>> {
        let state = self.state.lock().expect("catalog latch poisoned");
        let mut tables: Vec<_> = state.tables.values().cloned().collect();
        tables.sort_by_key(|t| t.table_id());
        tables
    }

    /// Drop a table, its heap pages, and every index defined on it.
    pub fn drop_table(&self, table_name: &str) -> DbResult<()> {
        let mut state = self.state.lock().expect("catalog latch poisoned");
        let table_id = state
            .table_names
            .get(table_name)
            .copied()
            .ok_or_else(|| DbError::TableNotExist(table_name.to_string()))?;

        let index_ids: Vec<IndexId> = state
            .index_names
            .remove(table_name)
            .map(|by_name| by_name.into_values().collect())
            .unwrap_or_default();
        for index_id in index_ids {
            if let Some(info) = state.indexes.remove(&index_id) {
                info.destroy();
            }
            if let Some(meta_page) = state.meta.index_meta_pages.remove(&index_id) {
                self.bp.delete_page(meta_page);
            }
        }

        let info = state.tables.remove(&table_id).expect("table maps agree");
        state.table_names.remove(table_name);
        info.heap().delete_table()?;
        if let Some(meta_page) = state.meta.table_meta_pages.remove(&table_id) {
            self.bp.delete_page(meta_page);
        }
        self.write_meta_page(&state);
        debug!(table = table_name, "dropped table");
        Ok(())
    }

    /// Create an index over `key_columns` and backfill it from the heap.
    pub fn create_index(
        &self,
        table_name: &str,
        index_name: &str,
        key_columns: &[&str],
    ) -> DbResult<Arc<IndexInfo>> {
        let mut state = self.state.lock().expect("catalog latch poisoned");
        let table_id = state
            .table_names
            .get(table_name)
            .copied()
            .ok_or_else(|| DbError::TableNotExist(table_name.to_string()))?;
        if state
            .index_names
            .get(table_name)
            .is_some_and(|by_name| by_name.contains_key(index_name))
        {
            return Err(DbError::IndexAlreadyExist(index_name.to_string()));
        }
        let table = state.tables[&table_id].clone();

        let mut key_map = Vec::with_capacity(key_columns.len());
        for name in key_columns {
            let ordinal = table
                .schema()
                .column_index(name)
                .ok_or_else(|| DbError::ColumnNameNotExist(name.to_string()))?;
            key_map.push(ordinal as u32);
        }

        let index_id = state.next_index_id;
        state.next_index_id = IndexId(index_id.0 + 1);
        let index_meta = IndexMetadata {
            index_id,
            index_name: index_name.to_string(),
            table_id,
            key_map,
        };
        let meta_page = self.write_index_meta(&index_meta)?;
        let info = self.bind_index(index_meta, &table);

        // existing tuples are indexed immediately
        for row in table.heap().iter() {
            info.insert_entry(&row)?;
        }

        state.meta.index_meta_pages.insert(index_id, meta_page);
        state
            .index_names
            .entry(table_name.to_string())
            .or_default()
            .insert(index_name.to_string(), index_id);
        state.indexes.insert(index_id, info.clone());
        self.write_meta_page(&state);
        debug!(index = index_name, table = table_name, "created index");
        Ok(info)
    }

    pub fn get_index(&self, table_name: &str, index_name: &str) -> DbResult<Arc<IndexInfo>> {
        let state = self.state.lock().expect("catalog latch poisoned");
        let index_id = state
            .index_names
            .get(table_name)
            .and_then(|by_name| by_name.get(index_name))
            .copied()
            .ok_or_else(|| DbError::IndexNotFound(index_name.to_string()))?;
        Ok(state.indexes[&index_id].clone())
    }

    pub fn get_table_indexes(&self, table_name: &str) -> DbResult<Vec<Arc<IndexInfo>>> {
        let state = self.state.lock().expect("catalog latch poisoned");
        if !state.table_names.contains_key(table_name) {
            return Err(DbError::TableNotExist(table_name.to_string()));
        }
        let mut indexes: Vec<_> = state
            .index_names
            .get(table_name)
            .map(|by_name| {
                by_name
                    .values()
                    .map(|id| state.indexes[id].clone())
                    .collect()
            })
            .unwrap_or_default();
        indexes.sort_by_key(|i| i.index_id());
        Ok(indexes)
    }

    pub fn drop_index(&self, table_name: &str, index_name: &str) -> DbResult<()> {
        let mut state = self.state.lock().expect("catalog latch poisoned");
        let index_id = state
            .index_names
            .get_mut(table_name)
            .and_then(|by_name| by_name.remove(index_name))
            .ok_or_else(|| DbError::IndexNotFound(index_name.to_string()))?;

        if let Some(info) = state.indexes.remove(&index_id) {
            info.destroy();
        }
        if let Some(meta_page) = state.meta.index_meta_pages.remove(&index_id) {
            self.bp.delete_page(meta_page);
        }
        self.write_meta_page(&state);
        debug!(index = index_name, table = table_name, "dropped index");
        Ok(())
    }

    fn bind_index(&self, meta: IndexMetadata, table: &Arc<TableInfo>) -> Arc<IndexInfo> {
        let key_columns: Vec<_> = meta
            .key_map
            .iter()
            .map(|&ordinal| table.schema().column(ordinal as usize).clone())
            .collect();
        let key_schema = Arc::new(Schema::new(key_columns));
        let codec = KeyCodec::new(key_schema.clone());
        let tree = BPlusTree::new(meta.index_id, self.bp.clone(), codec, None, None);
        Arc::new(IndexInfo {
            meta,
            key_schema,
            tree: Mutex::new(tree),
        })
    }

    fn write_table_meta(&self, meta: &TableMetadata) -> DbResult<PageId> {
        let guard = self
            .bp
            .new_page()
            .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
        let mut writer = Writer::new();
        meta.serialize_to(&mut writer);
        let bytes = writer.into_bytes();
        assert!(bytes.len() <= common::PAGE_SIZE, "table metadata overflows its page");
        guard.write().data_mut()[..bytes.len()].copy_from_slice(&bytes);
        Ok(guard.page_id())
    }

    fn write_index_meta(&self, meta: &IndexMetadata) -> DbResult<PageId> {
        let guard = self
            .bp
            .new_page()
            .ok_or_else(|| DbError::Failed("buffer pool exhausted".into()))?;
        let mut writer = Writer::new();
        meta.serialize_to(&mut writer);
        let bytes = writer.into_bytes();
        assert!(bytes.len() <= common::PAGE_SIZE, "index metadata overflows its page");
        guard.write().data_mut()[..bytes.len()].copy_from_slice(&bytes);
        Ok(guard.page_id())
    }

    /// Serialize the catalog root into its reserved page and flush it.
    fn write_meta_page(&self, state: &CatalogState) {
        let guard = self
            .bp
            .fetch_page(CATALOG_META_PAGE_ID)
            .expect("buffer pool exhausted");
        let mut writer = Writer::with_capacity(state.meta.serialized_size());
        state.meta.serialize_to(&mut writer);
        let bytes = writer.into_bytes();
        {
            let mut page = guard.write();
            page.data_mut().fill(0);
            page.data_mut()[..bytes.len()].copy_from_slice(&bytes);
        }
        drop(guard);
        self.bp.flush_page(CATALOG_META_PAGE_ID);
    }
}
