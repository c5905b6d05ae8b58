use std::cmp::Ordering;
use std::fmt;

/// Column type tags persisted inside schema pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TypeId {
    Int,
    Float,
    Char,
}

impl TypeId {
    pub fn from_u32(raw: u32) -> Option<TypeId> {
        match raw {
            0 => Some(TypeId::Int),
            1 => Some(TypeId::Float),
            2 => Some(TypeId::Char),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            TypeId::Int => 0,
            TypeId::Float => 1,
            TypeId::Char => 2,
        }
    }
}

/// A single field value inside a row. `Null` carries no payload; the row
/// codec records nullness in its bitmap instead.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i32),
    Float(f32),
    Char(String),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_id(&self) -> Option<TypeId> {
        match self {
            Value::Int(_) => Some(TypeId::Int),
            Value::Float(_) => Some(TypeId::Float),
            Value::Char(_) => Some(TypeId::Char),
            Value::Null => None,
        }
    }

    /// Compare two values of the same type. Cross-type comparison (and any
    /// comparison against `Null`) yields `None`. Floats use the IEEE total
    /// order so keys sort deterministically.
    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::Char(a), Value::Char(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn eq_same_type(&self, other: &Value) -> Option<bool> {
        self.cmp_same_type(other).map(|ord| ord == Ordering::Equal)
    }

    /// Serialized payload width within a row, excluding the null bitmap bit.
    /// Char fields are length-prefixed; null fields contribute nothing.
    pub fn payload_len(&self) -> usize {
        match self {
            Value::Int(_) | Value::Float(_) => 4,
            Value::Char(s) => 4 + s.len(),
            Value::Null => 0,
        }
    }

    /// Append the row-payload encoding of this value.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Float(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Char(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Null => {}
        }
    }

    /// Decode one value of `ty` from `buf`, returning the value and the
    /// number of bytes consumed.
    pub fn decode_from(buf: &[u8], ty: TypeId) -> Option<(Value, usize)> {
        match ty {
            TypeId::Int => {
                let raw = buf.get(..4)?;
                Some((Value::Int(i32::from_le_bytes(raw.try_into().ok()?)), 4))
            }
            TypeId::Float => {
                let raw = buf.get(..4)?;
                Some((Value::Float(f32::from_le_bytes(raw.try_into().ok()?)), 4))
            }
            TypeId::Char => {
                let len = u32::from_le_bytes(buf.get(..4)?.try_into().ok()?) as usize;
                let bytes = buf.get(4..4 + len)?;
                let text = std::str::from_utf8(bytes).ok()?;
                Some((Value::Char(text.to_string()), 4 + len))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Char(s) => write!(f, "{s}"),
            Value::Null => write!(f, "null"),
        }
    }
}
