use std::cmp::Ordering;
use std::sync::Arc;

use record::{Row, Schema};
use types::{TypeId, Value};

/// Fixed-width key encoding for tree nodes.
///
/// Every key occupies exactly `key_size` bytes: Int and Float fields take
/// four little-endian bytes, Char fields their declared column length,
/// zero-padded. Comparison decodes numeric fields (their byte order is not
/// order-preserving) and compares Char fields as padded bytes, which
/// matches string order.
#[derive(Clone)]
pub struct KeyCodec {
    schema: Arc<Schema>,
    key_size: usize,
}

impl KeyCodec {
    pub fn new(schema: Arc<Schema>) -> Self {
        let key_size = schema
            .columns()
            .iter()
            .map(|c| match c.ty {
                TypeId::Int | TypeId::Float => 4,
                TypeId::Char => c.length as usize,
            })
            .sum();
        Self { schema, key_size }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Encode the key row into its fixed-width form. A null field encodes
    /// as zeroes of its column width.
    pub fn encode(&self, key: &Row) -> Vec<u8> {
        assert_eq!(
            key.values.len(),
            self.schema.column_count(),
            "key arity does not match the key schema"
        );
        let mut out = vec![0u8; self.key_size];
        let mut at = 0;
        for (value, column) in key.values.iter().zip(self.schema.columns()) {
            let width = match column.ty {
                TypeId::Int | TypeId::Float => 4,
                TypeId::Char => column.length as usize,
            };
            match value {
                Value::Int(v) => out[at..at + 4].copy_from_slice(&v.to_le_bytes()),
                Value::Float(v) => out[at..at + 4].copy_from_slice(&v.to_le_bytes()),
                Value::Char(s) => {
                    let bytes = s.as_bytes();
                    assert!(bytes.len() <= width, "char key exceeds its column length");
                    out[at..at + bytes.len()].copy_from_slice(bytes);
                }
                Value::Null => {}
            }
            at += width;
        }
        out
    }

    /// Decode a stored key back into a row of values.
    pub fn decode(&self, bytes: &[u8]) -> Row {
        debug_assert_eq!(bytes.len(), self.key_size);
        let mut values = Vec::with_capacity(self.schema.column_count());
        let mut at = 0;
        for column in self.schema.columns() {
            match column.ty {
                TypeId::Int => {
                    let raw = bytes[at..at + 4].try_into().expect("int key field");
                    values.push(Value::Int(i32::from_le_bytes(raw)));
                    at += 4;
                }
                TypeId::Float => {
                    let raw = bytes[at..at + 4].try_into().expect("float key field");
                    values.push(Value::Float(f32::from_le_bytes(raw)));
                    at += 4;
                }
                TypeId::Char => {
                    let width = column.length as usize;
                    let raw = &bytes[at..at + width];
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
                    let text = std::str::from_utf8(&raw[..end]).unwrap_or_default();
                    values.push(Value::Char(text.to_string()));
                    at += width;
                }
            }
        }
        Row::new(values)
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        debug_assert_eq!(a.len(), self.key_size);
        debug_assert_eq!(b.len(), self.key_size);
        let mut at = 0;
        for column in self.schema.columns() {
            let ord = match column.ty {
                TypeId::Int => {
                    let left = i32::from_le_bytes(a[at..at + 4].try_into().expect("int key"));
                    let right = i32::from_le_bytes(b[at..at + 4].try_into().expect("int key"));
                    at += 4;
                    left.cmp(&right)
                }
                TypeId::Float => {
                    let left = f32::from_le_bytes(a[at..at + 4].try_into().expect("float key"));
                    let right = f32::from_le_bytes(b[at..at + 4].try_into().expect("float key"));
                    at += 4;
                    left.total_cmp(&right)
                }
                TypeId::Char => {
                    let width = column.length as usize;
                    let ord = a[at..at + width].cmp(&b[at..at + width]);
                    at += width;
                    ord
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
