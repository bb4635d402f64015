//! Canonical binary encoding for content-addressed records.
//!
//! Every on-disk object whose identity is its own digest (dir-tree,
//! dir-meta, commit, commit-meta, tombstone-commit, and the archive-mode
//! file-content header) is built from these primitives rather than a
//! general-purpose serialisation format: fixed-width big-endian integers
//! and length-prefixed byte strings, assembled in a fixed field order by
//! each object type's own `to_canonical_bytes`. Byte-identical field
//! values always produce byte-identical output, which is the precondition
//! content addressing relies on — a guarantee a general encoder's wire
//! format is not contractually obligated to hold across versions.

use crate::{Error, Result};

#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// length-prefixed (u32 be) byte string.
    pub fn write_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    pub fn write_str(&mut self, v: &str) -> &mut Self {
        self.write_bytes(v.as_bytes())
    }

    /// raw digest bytes, fixed 32 bytes, no length prefix (length is implied).
    pub fn write_digest(&mut self, d: &crate::Digest) -> &mut Self {
        self.buf.extend_from_slice(d.as_bytes());
        self
    }

    /// optional digest: one presence byte then, if present, the digest.
    pub fn write_opt_digest(&mut self, d: Option<&crate::Digest>) -> &mut Self {
        match d {
            Some(d) => {
                self.write_u8(1);
                self.write_digest(d);
            }
            None => {
                self.write_u8(0);
            }
        }
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::MalformedObject("unexpected end of record".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| Error::MalformedObject("invalid utf-8 in record".into()))
    }

    pub fn read_digest(&mut self) -> Result<crate::Digest> {
        let b = self.take(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(crate::Digest::from_bytes(arr))
    }

    pub fn read_opt_digest(&mut self) -> Result<Option<crate::Digest>> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_digest()?)),
            other => Err(Error::MalformedObject(format!(
                "invalid presence byte {other} in record"
            ))),
        }
    }

    /// true once every byte of the buffer has been consumed; callers should
    /// check this after reading a record's known fields to reject trailing
    /// garbage.
    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn expect_end(&self) -> Result<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(Error::MalformedObject("trailing bytes in record".into()))
        }
    }
}
