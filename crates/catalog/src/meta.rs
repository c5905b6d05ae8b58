//! Serialized metadata: the catalog root plus per-table and per-index
//! meta pages, each framed by its own magic number.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{DbError, DbResult, IndexId, PageId, TableId, PAGE_SIZE};
use record::codec::{Reader, Writer};
use record::Schema;

pub const CATALOG_MAGIC_NUM: u32 = u32::from_le_bytes(*b"CATM");
pub const TABLE_METADATA_MAGIC_NUM: u32 = u32::from_le_bytes(*b"TBLM");
pub const INDEX_METADATA_MAGIC_NUM: u32 = u32::from_le_bytes(*b"IDXM");

/// Root of the catalog: which meta page describes each table and index.
/// Serialized into the catalog meta page on every mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogMeta {
    pub table_meta_pages: BTreeMap<TableId, PageId>,
    pub index_meta_pages: BTreeMap<IndexId, PageId>,
}

impl CatalogMeta {
    pub fn serialized_size(&self) -> usize {
        12 + 8 * (self.table_meta_pages.len() + self.index_meta_pages.len())
    }

    pub fn serialize_to(&self, w: &mut Writer) {
        assert!(
            self.serialized_size() <= PAGE_SIZE,
            "catalog meta overflows its page"
        );
        w.put_u32(CATALOG_MAGIC_NUM);
        w.put_u32(self.table_meta_pages.len() as u32);
        w.put_u32(self.index_meta_pages.len() as u32);
        for (table_id, page_id) in &self.table_meta_pages {
            w.put_u32(table_id.0);
            w.put_u32(page_id.0 as u32);
        }
        for (index_id, page_id) in &self.index_meta_pages {
            w.put_u32(index_id.0);
            w.put_u32(page_id.0 as u32);
        }
    }

    pub fn deserialize_from(r: &mut Reader) -> DbResult<CatalogMeta> {
        let magic = r.get_u32()?;
        if magic != CATALOG_MAGIC_NUM {
            return Err(DbError::Failed(format!(
                "bad catalog magic number {magic:#x}"
            )));
        }
        let table_count = r.get_u32()? as usize;
        let index_count = r.get_u32()? as usize;
        let mut meta = CatalogMeta::default();
        for _ in 0..table_count {
            let table_id = TableId(r.get_u32()?);
            let page_id = PageId(r.get_u32()? as i32);
            meta.table_meta_pages.insert(table_id, page_id);
        }
        for _ in 0..index_count {
            let index_id = IndexId(r.get_u32()?);
            let page_id = PageId(r.get_u32()? as i32);
            meta.index_meta_pages.insert(index_id, page_id);
        }
        Ok(meta)
    }

    pub fn next_table_id(&self) -> TableId {
        TableId(
            self.table_meta_pages
                .keys()
                .last()
                .map_or(0, |id| id.0 + 1),
        )
    }

    pub fn next_index_id(&self) -> IndexId {
        IndexId(
            self.index_meta_pages
                .keys()
                .last()
                .map_or(0, |id| id.0 + 1),
        )
    }
}

/// Metadata describing one table, persisted on its own meta page.
#[derive(Clone, Debug)]
pub struct TableMetadata {
    pub table_id: TableId,
    pub table_name: String,
    pub first_page_id: PageId,
    pub schema: Arc<Schema>,
}

impl TableMetadata {
    pub fn serialize_to(&self, w: &mut Writer) {
        w.put_u32(TABLE_METADATA_MAGIC_NUM);
        w.put_u32(self.table_id.0);
        w.put_u32(self.table_name.len() as u32);
        w.put_bytes(self.table_name.as_bytes());
        w.put_i32(self.first_page_id.0);
        self.schema.serialize_to(w);
    }

    pub fn deserialize_from(r: &mut Reader) -> DbResult<TableMetadata> {
        let magic = r.get_u32()?;
        if magic != TABLE_METADATA_MAGIC_NUM {
            return Err(DbError::Failed(format!(
                "bad table metadata magic number {magic:#x}"
            )));
        }
        let table_id = TableId(r.get_u32()?);
        let name_len = r.get_u32()? as usize;
        let table_name = String::from_utf8(r.get_bytes(name_len)?.to_vec())
            .map_err(|e| DbError::Failed(format!("table name is not utf-8: {e}")))?;
        let first_page_id = PageId(r.get_i32()?);
        let schema = Arc::new(Schema::deserialize_from(r)?);
        Ok(TableMetadata {
            table_id,
            table_name,
            first_page_id,
            schema,
        })
    }
}

/// Metadata describing one index: its name, owning table, and the ordinals
/// of the key columns within the table schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexMetadata {
    pub index_id: IndexId,
    pub index_name: String,
    pub table_id: TableId,
    pub key_map: Vec<u32>,
}

impl IndexMetadata {
    pub fn serialize_to(&self, w: &mut Writer) {
        w.put_u32(INDEX_METADATA_MAGIC_NUM);
        w.put_u32(self.index_id.0);
        w.put_u32(self.index_name.len() as u32);
        w.put_bytes(self.index_name.as_bytes());
        w.put_u32(self.table_id.0);
        w.put_u32(self.key_map.len() as u32);
        for ordinal in &self.key_map {
            w.put_u32(*ordinal);
        }
    }

    pub fn deserialize_from(r: &mut Reader) -> DbResult<IndexMetadata> {
        let magic = r.get_u32()?;
        if magic != INDEX_METADATA_MAGIC_NUM {
            return Err(DbError::Failed(format!(
                "bad index metadata magic number {magic:#x}"
            )));
        }
        let index_id = IndexId(r.get_u32()?);
        let name_len = r.get_u32()? as usize;
        let index_name = String::from_utf8(r.get_bytes(name_len)?.to_vec())
            .map_err(|e| DbError::Failed(format!("index name is not utf-8: {e}")))?;
        let table_id = TableId(r.get_u32()?);
        let key_count = r.get_u32()? as usize;
        let mut key_map = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            key_map.push(r.get_u32()?);
        }
        Ok(IndexMetadata {
            index_id,
            index_name,
            table_id,
            key_map,
        })
    }
}
