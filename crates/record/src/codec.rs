//! Little-endian cursor helpers shared by every page codec.

use common::{DbError, DbResult};

/// Appends little-endian fields to a growable buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buf(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads little-endian fields from a byte slice, tracking its position.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn advance(&mut self, n: usize) -> DbResult<()> {
        if self.pos + n > self.buf.len() {
            return Err(truncated());
        }
        self.pos += n;
        Ok(())
    }

    pub fn get_u32(&mut self) -> DbResult<u32> {
        let raw = self.get_bytes(4)?;
        Ok(u32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub fn get_i32(&mut self) -> DbResult<i32> {
        let raw = self.get_bytes(4)?;
        Ok(i32::from_le_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub fn get_bool(&mut self) -> DbResult<bool> {
        Ok(self.get_bytes(1)?[0] != 0)
    }

    pub fn get_bytes(&mut self, n: usize) -> DbResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(truncated());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

fn truncated() -> DbError {
    DbError::Failed("truncated buffer while decoding".into())
}
