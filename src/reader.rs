//! Bounds-checked primitive reads over a fixed byte region.
//!
//! Every accessor advances the cursor only on success.  A failed read leaves
//! the cursor where it was, so callers can probe and back off.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("read of {wanted} byte(s) at offset {offset} overruns region of {len} byte(s)")]
    OutOfBounds { offset: usize, wanted: usize, len: usize },
    #[error("string at offset {offset} has no NUL terminator before end of region")]
    Unterminated { offset: usize },
}

/// Byte order of the metadata blob.  The container header is always big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Metadata byte 0: `0` is little-endian, anything else big-endian.
    pub fn from_tag(tag: u8) -> Self {
        if tag == 0 { Endian::Little } else { Endian::Big }
    }

    pub fn tag(self) -> u8 {
        match self {
            Endian::Little => 0,
            Endian::Big    => 1,
        }
    }

    pub fn read_i16(self, b: &[u8]) -> i16 {
        match self {
            Endian::Little => LittleEndian::read_i16(b),
            Endian::Big    => BigEndian::read_i16(b),
        }
    }

    pub fn read_u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big    => BigEndian::read_u32(b),
        }
    }

    pub fn read_i32(self, b: &[u8]) -> i32 {
        self.read_u32(b) as i32
    }

    pub fn read_i64(self, b: &[u8]) -> i64 {
        match self {
            Endian::Little => LittleEndian::read_i64(b),
            Endian::Big    => BigEndian::read_i64(b),
        }
    }

    pub fn write_i16(self, b: &mut [u8], v: i16) {
        match self {
            Endian::Little => LittleEndian::write_i16(b, v),
            Endian::Big    => BigEndian::write_i16(b, v),
        }
    }

    pub fn write_u32(self, b: &mut [u8], v: u32) {
        match self {
            Endian::Little => LittleEndian::write_u32(b, v),
            Endian::Big    => BigEndian::write_u32(b, v),
        }
    }

    pub fn write_i32(self, b: &mut [u8], v: i32) {
        self.write_u32(b, v as u32)
    }

    pub fn write_i64(self, b: &mut [u8], v: i64) {
        match self {
            Endian::Little => LittleEndian::write_i64(b, v),
            Endian::Big    => BigEndian::write_i64(b, v),
        }
    }
}

/// Round `n` up to the next multiple of four.
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// ── ByteReader ───────────────────────────────────────────────────────────────

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf:        &'a [u8],
    pos:        usize,
    pub endian: Endian,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self { buf, pos: 0, endian }
    }

    pub fn at(buf: &'a [u8], pos: usize, endian: Endian) -> Self {
        Self { buf, pos, endian }
    }

    pub fn position(&self) -> usize { self.pos }
    pub fn len(&self) -> usize { self.buf.len() }
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    pub fn remaining(&self) -> usize { self.buf.len().saturating_sub(self.pos) }

    pub fn seek(&mut self, pos: usize) -> Result<(), ReadError> {
        if pos > self.buf.len() {
            return Err(self.oob(pos.saturating_sub(self.pos)));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], ReadError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len())
            .ok_or_else(|| self.oob(n))?;
        let buf = self.buf;
        let out = &buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Look at the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Result<&'a [u8], ReadError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len())
            .ok_or_else(|| self.oob(n))?;
        let buf = self.buf;
        Ok(&buf[self.pos..end])
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ReadError> {
        self.bytes(n).map(|_| ())
    }

    /// Advance to the next 4-byte boundary measured from `origin`.
    pub fn align4(&mut self, origin: usize) -> Result<(), ReadError> {
        let rel = self.pos.saturating_sub(origin);
        self.skip(align4(rel) - rel)
    }

    pub fn u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn i16(&mut self) -> Result<i16, ReadError> {
        let e = self.endian;
        self.bytes(2).map(|b| e.read_i16(b))
    }

    pub fn u32(&mut self) -> Result<u32, ReadError> {
        let e = self.endian;
        self.bytes(4).map(|b| e.read_u32(b))
    }

    pub fn i32(&mut self) -> Result<i32, ReadError> {
        self.u32().map(|v| v as i32)
    }

    pub fn i64(&mut self) -> Result<i64, ReadError> {
        let e = self.endian;
        self.bytes(8).map(|b| e.read_i64(b))
    }

    /// Big-endian `u32` regardless of `self.endian`.
    pub fn be_u32(&mut self) -> Result<u32, ReadError> {
        self.bytes(4).map(BigEndian::read_u32)
    }

    /// NUL-terminated string; the terminator is consumed but not returned.
    /// Invalid UTF-8 is replaced lossily.
    pub fn cstring(&mut self) -> Result<String, ReadError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let nul = rest.iter().position(|&b| b == 0)
            .ok_or(ReadError::Unterminated { offset: self.pos })?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(s)
    }

    fn oob(&self, wanted: usize) -> ReadError {
        ReadError::OutOfBounds { offset: self.pos, wanted, len: self.buf.len() }
    }
}
