//! Tuple and schema serialization.
//!
//! Columns, schemas and rows all serialize to little-endian byte layouts
//! framed by ASCII magic numbers, so a corrupted metadata page fails loudly
//! on load instead of materializing garbage.


pub mod codec;

use common::{DbError, DbResult, PageId, RowId};
use types::{TypeId, Value};

use crate::codec::{Reader, Writer};

pub const COLUMN_MAGIC_NUM: u32 = u32::from_le_bytes(*b"COLM");
pub const SCHEMA_MAGIC_NUM: u32 = u32::from_le_bytes(*b"SCHM");

/// One column of a table schema. `length` is the declared width for `Char`
/// columns and the fixed payload width (4) otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: TypeId,
    pub length: u32,
    pub table_index: u32,
    pub nullable: bool,
    pub unique: bool,
}

impl Column {
    /// Fixed-width column (Int or Float).
    pub fn new(name: impl Into<String>, ty: TypeId, table_index: u32, nullable: bool, unique: bool) -> Self {
        assert!(ty != TypeId::Char, "char columns require an explicit length");
        Self {
            name: name.into(),
            ty,
            length: 4,
            table_index,
            nullable,
            unique,
        }
    }

    /// Char column with a declared maximum length.
    pub fn with_length(
        name: impl Into<String>,
        ty: TypeId,
        length: u32,
        table_index: u32,
        nullable: bool,
        unique: bool,
    ) -> Self {
        assert!(ty == TypeId::Char, "only char columns carry a length");
        Self {
            name: name.into(),
            ty,
            length,
            table_index,
            nullable,
            unique,
        }
    }

    pub fn serialized_size(&self) -> usize {
        // magic + name length + name bytes + type + length + index + 2 flags
        4 + 4 + self.name.len() + 4 + 4 + 4 + 1 + 1
    }

    pub fn serialize_to(&self, w: &mut Writer) {
        w.put_u32(COLUMN_MAGIC_NUM);
        // the byte length of the name, never the size of the string object
        w.put_u32(self.name.len() as u32);
        w.put_bytes(self.name.as_bytes());
        w.put_u32(self.ty.as_u32());
        w.put_u32(self.length);
        w.put_u32(self.table_index);
        w.put_bool(self.nullable);
        w.put_bool(self.unique);
    }

    pub fn deserialize_from(r: &mut Reader) -> DbResult<Column> {
        let magic = r.get_u32()?;
        if magic != COLUMN_MAGIC_NUM {
            return Err(DbError::Failed(format!(
                "bad column magic number {magic:#x}"
            )));
        }
        let name_len = r.get_u32()? as usize;
        let name = String::from_utf8(r.get_bytes(name_len)?.to_vec())
            .map_err(|e| DbError::Failed(format!("column name is not utf-8: {e}")))?;
        let raw_ty = r.get_u32()?;
        let ty = TypeId::from_u32(raw_ty)
            .ok_or_else(|| DbError::Failed(format!("unknown column type tag {raw_ty}")))?;
        let length = r.get_u32()?;
        let table_index = r.get_u32()?;
        let nullable = r.get_bool()?;
        let unique = r.get_bool()?;
        Ok(Column {
            name,
            ty,
            length,
            table_index,
            nullable,
            unique,
        })
    }
}

/// Ordered sequence of columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Project the columns named in `key_columns` into a key schema,
    /// preserving the requested order. Fails on an unknown name.
    pub fn project(&self, key_columns: &[&str]) -> DbResult<Schema> {
        let mut projected = Vec::with_capacity(key_columns.len());
        for name in key_columns {
            let idx = self
                .column_index(name)
                .ok_or_else(|| DbError::ColumnNameNotExist(name.to_string()))?;
            projected.push(self.columns[idx].clone());
        }
        Ok(Schema::new(projected))
    }

    pub fn serialized_size(&self) -> usize {
        let cols: usize = self.columns.iter().map(Column::serialized_size).sum();
        // magic + column count + columns + trailing ownership byte
        4 + 4 + cols + 1
    }

    pub fn serialize_to(&self, w: &mut Writer) {
        w.put_u32(SCHEMA_MAGIC_NUM);
        w.put_u32(self.columns.len() as u32);
        for column in &self.columns {
            column.serialize_to(w);
        }
        // ownership marker kept for layout fidelity; always set
        w.put_bool(true);
    }

    pub fn deserialize_from(r: &mut Reader) -> DbResult<Schema> {
        let magic = r.get_u32()?;
        if magic != SCHEMA_MAGIC_NUM {
            return Err(DbError::Failed(format!(
                "bad schema magic number {magic:#x}"
            )));
        }
        let count = r.get_u32()? as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(Column::deserialize_from(r)?);
        }
        let _ = r.get_bool()?;
        Ok(Schema::new(columns))
    }
}

/// One tuple: its location plus one value per schema column.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub rid: RowId,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            rid: RowId::INVALID,
            values,
        }
    }

    pub fn with_rid(mut self, rid: RowId) -> Self {
        self.rid = rid;
        self
    }

    pub fn serialized_size(&self, schema: &Schema) -> usize {
        debug_assert_eq!(self.values.len(), schema.column_count());
        let payloads: usize = self.values.iter().map(Value::payload_len).sum();
        // rid + field count + null bitmap + payloads
        8 + 4 + self.values.len().div_ceil(8) + payloads
    }

    /// Layout: `RowId (u32 page, u32 slot)`, field count, MSB-first null
    /// bitmap (bit set means non-null), then the non-null payloads.
    pub fn serialize_to(&self, w: &mut Writer, schema: &Schema) {
        assert_eq!(
            self.values.len(),
            schema.column_count(),
            "row arity does not match schema"
        );
        w.put_u32(self.rid.page_id.0 as u32);
        w.put_u32(self.rid.slot);
        w.put_u32(self.values.len() as u32);
        let mut bitmap = vec![0u8; self.values.len().div_ceil(8)];
        for (i, value) in self.values.iter().enumerate() {
            if !value.is_null() {
                bitmap[i / 8] |= 1 << (7 - i % 8);
            }
        }
        w.put_bytes(&bitmap);
        for value in &self.values {
            value.encode_into(w.buf());
        }
    }

    pub fn deserialize_from(r: &mut Reader, schema: &Schema) -> DbResult<Row> {
        let page_id = PageId(r.get_u32()? as i32);
        let slot = r.get_u32()?;
        let count = r.get_u32()? as usize;
        if count != schema.column_count() {
            return Err(DbError::Failed(format!(
                "row field count {count} does not match schema arity {}",
                schema.column_count()
            )));
        }
        let bitmap = r.get_bytes(count.div_ceil(8))?.to_vec();
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let non_null = bitmap[i / 8] & (1 << (7 - i % 8)) != 0;
            if non_null {
                let ty = schema.column(i).ty;
                let (value, used) = Value::decode_from(r.remaining(), ty)
                    .ok_or_else(|| DbError::Failed("truncated row payload".into()))?;
                r.advance(used)?;
                values.push(value);
            } else {
                values.push(Value::Null);
            }
        }
        Ok(Row {
            rid: RowId::new(page_id, slot),
            values,
        })
    }

    /// Extract the key columns of this row in `key_schema` order.
    pub fn key_from_row(&self, schema: &Schema, key_schema: &Schema) -> DbResult<Row> {
        let mut values = Vec::with_capacity(key_schema.column_count());
        for column in key_schema.columns() {
            let idx = schema
                .column_index(&column.name)
                .ok_or_else(|| DbError::ColumnNameNotExist(column.name.clone()))?;
            values.push(self.values[idx].clone());
        }
        Ok(Row::new(values).with_rid(self.rid))
    }
}
