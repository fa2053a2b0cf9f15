//! Fixed 20-byte container header.
//!
//! Five big-endian `u32` words, bit-exact on disk:
//!
//! | Offset | Field        |
//! |--------|--------------|
//! | 0      | `meta_size`  |
//! | 4      | `file_size`  |
//! | 8      | `version`    |
//! | 12     | `data_offset`|
//! | 16     | `reserved`   |
//!
//! The metadata blob is the *tail* of the file: it starts at
//! `file_size - meta_size`.  Object payloads live in front of it, starting at
//! the data base (`data_offset` when non-zero, else right after the header).

use byteorder::{BigEndian, WriteBytesExt};
use std::io::{self, Write};
use thiserror::Error;

use crate::reader::{ByteReader, Endian, ReadError};

pub const HEADER_SIZE: usize = 20;
pub const VERSION: u32 = 6;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Header truncated: {0}")]
    Truncated(#[from] ReadError),
    #[error("Unsupported SerializedFile version: {0} (expected {VERSION})")]
    UnsupportedVersion(u32),
    #[error("Corrupt header: meta_size={meta_size} file_size={file_size} data_base={data_base} actual_len={actual_len}")]
    CorruptHeader {
        meta_size:  u32,
        file_size:  u32,
        data_base:  u64,
        actual_len: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub meta_size:   u32,
    pub file_size:   u32,
    pub version:     u32,
    pub data_offset: u32,
    pub reserved:    u32,
}

impl ContainerHeader {
    pub fn new(meta_size: u32, file_size: u32) -> Self {
        Self { meta_size, file_size, version: VERSION, data_offset: 0, reserved: 0 }
    }

    /// Decode and validate the header at the front of `buf`, which must hold
    /// the whole container.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        let mut r = ByteReader::new(buf, Endian::Big);
        let hdr = Self {
            meta_size:   r.be_u32()?,
            file_size:   r.be_u32()?,
            version:     r.be_u32()?,
            data_offset: r.be_u32()?,
            reserved:    r.be_u32()?,
        };
        if hdr.version != VERSION {
            return Err(HeaderError::UnsupportedVersion(hdr.version));
        }
        hdr.validate(buf.len() as u64)?;
        Ok(hdr)
    }

    fn validate(&self, actual_len: u64) -> Result<(), HeaderError> {
        let ok = self.meta_size <= self.file_size
            && self.data_base() >= HEADER_SIZE as u64
            && self.data_base() <= self.meta_start()
            && u64::from(self.file_size) <= actual_len;
        if ok {
            Ok(())
        } else {
            Err(HeaderError::CorruptHeader {
                meta_size:  self.meta_size,
                file_size:  self.file_size,
                data_base:  self.data_base(),
                actual_len,
            })
        }
    }

    /// Absolute offset where the metadata blob begins.  Saturates to zero on
    /// a header that would fail validation.
    pub fn meta_start(&self) -> u64 {
        u64::from(self.file_size.saturating_sub(self.meta_size))
    }

    /// Origin that object offsets are relative to.
    pub fn data_base(&self) -> u64 {
        if self.data_offset != 0 { u64::from(self.data_offset) } else { HEADER_SIZE as u64 }
    }

    /// Length of the data region `[data_base, meta_start)`.
    pub fn data_len(&self) -> u64 {
        self.meta_start().saturating_sub(self.data_base())
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.meta_size)?;
        writer.write_u32::<BigEndian>(self.file_size)?;
        writer.write_u32::<BigEndian>(self.version)?;
        writer.write_u32::<BigEndian>(self.data_offset)?;
        writer.write_u32::<BigEndian>(self.reserved)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        // Writing into a fixed array of exactly HEADER_SIZE cannot fail.
        let _ = self.write(&mut out[..]);
        out
    }
}
