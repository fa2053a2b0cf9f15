//! Candidate object-table record shapes.
//!
//! Container builds in the wild disagree on the record layout and never say
//! which one they use.  Every known shape is listed in [`RecordLayout::ALL`];
//! the scanner tries them in that order and keeps the best-scoring one.
//! Supporting a new generation means adding one variant and one table row.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reader::Endian;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("path id {path_id} does not fit the {width}-byte path id of layout {layout:?}")]
pub struct RecordOverflow {
    pub path_id: i64,
    pub width:   usize,
    pub layout:  RecordLayout,
}

/// Layout-specific trailing fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecordTail {
    None,
    /// 20-byte records: class id and flags packed into one 32-bit word.
    Packed { class_id: i16, flags: i16 },
    /// 24-byte records: class id and flags as full words.
    Wide { class_id: i32, flags: i32 },
}

impl RecordTail {
    pub fn class_id(&self) -> Option<i32> {
        match *self {
            RecordTail::None => None,
            RecordTail::Packed { class_id, .. } => Some(i32::from(class_id)),
            RecordTail::Wide { class_id, .. } => Some(class_id),
        }
    }

    pub fn flags(&self) -> Option<i32> {
        match *self {
            RecordTail::None => None,
            RecordTail::Packed { flags, .. } => Some(i32::from(flags)),
            RecordTail::Wide { flags, .. } => Some(flags),
        }
    }
}

/// One decoded object-table record.  `offset` is relative to the data base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRecord {
    pub path_id:    i64,
    pub offset:     u32,
    pub size:       u32,
    pub type_index: i32,
    pub tail:       RecordTail,
}

impl ObjectRecord {
    /// Bounds/alignment check against a data region of `data_len` bytes.
    pub fn is_plausible(&self, data_len: u64) -> bool {
        let off = u64::from(self.offset);
        self.size > 0
            && off < data_len
            && off + u64::from(self.size) <= data_len
            && self.offset % 4 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordLayout {
    /// `pathId:i32, off, size, type`
    Compact,
    /// `Compact` + `class:i16, flags:i16`
    Packed,
    /// `Compact` + `class:i32, flags:i32`
    Wide,
    /// `off, size, type, pathId:i32`
    OffsetFirst,
    /// `pathId:i32, type, off, size`
    TypeFirst,
    /// `pathId:i64, off, size, type`
    LongPathId,
}

impl RecordLayout {
    /// Probe order.  Earlier rows win ties.
    pub const ALL: [RecordLayout; 6] = [
        RecordLayout::Compact,
        RecordLayout::Packed,
        RecordLayout::Wide,
        RecordLayout::OffsetFirst,
        RecordLayout::TypeFirst,
        RecordLayout::LongPathId,
    ];

    pub fn width(self) -> usize {
        match self {
            RecordLayout::Compact | RecordLayout::OffsetFirst | RecordLayout::TypeFirst => 16,
            RecordLayout::Packed | RecordLayout::LongPathId => 20,
            RecordLayout::Wide => 24,
        }
    }

    pub fn path_id_width(self) -> usize {
        match self {
            RecordLayout::LongPathId => 8,
            _ => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordLayout::Compact     => "compact",
            RecordLayout::Packed      => "packed",
            RecordLayout::Wide        => "wide",
            RecordLayout::OffsetFirst => "offsetFirst",
            RecordLayout::TypeFirst   => "typeFirst",
            RecordLayout::LongPathId  => "longPathId",
        }
    }

    /// Decode one record.  `b` must hold at least [`width`](Self::width) bytes.
    pub fn decode(self, b: &[u8], e: Endian) -> ObjectRecord {
        let word = |i: usize| e.read_u32(&b[i * 4..i * 4 + 4]);
        let int  = |i: usize| e.read_i32(&b[i * 4..i * 4 + 4]);
        match self {
            RecordLayout::Compact | RecordLayout::Packed | RecordLayout::Wide => ObjectRecord {
                path_id:    i64::from(int(0)),
                offset:     word(1),
                size:       word(2),
                type_index: int(3),
                tail: match self {
                    RecordLayout::Packed => RecordTail::Packed {
                        class_id: e.read_i16(&b[16..18]),
                        flags:    e.read_i16(&b[18..20]),
                    },
                    RecordLayout::Wide => RecordTail::Wide { class_id: int(4), flags: int(5) },
                    _ => RecordTail::None,
                },
            },
            RecordLayout::OffsetFirst => ObjectRecord {
                path_id:    i64::from(int(3)),
                offset:     word(0),
                size:       word(1),
                type_index: int(2),
                tail:       RecordTail::None,
            },
            RecordLayout::TypeFirst => ObjectRecord {
                path_id:    i64::from(int(0)),
                offset:     word(2),
                size:       word(3),
                type_index: int(1),
                tail:       RecordTail::None,
            },
            RecordLayout::LongPathId => ObjectRecord {
                path_id:    e.read_i64(&b[0..8]),
                offset:     word(2),
                size:       word(3),
                type_index: int(4),
                tail:       RecordTail::None,
            },
        }
    }

    /// Encode `rec` into `b` (at least [`width`](Self::width) bytes).  A tail
    /// that does not belong to this layout is written as zeros.
    pub fn encode(self, rec: &ObjectRecord, e: Endian, b: &mut [u8]) -> Result<(), RecordOverflow> {
        let path32 = || {
            i32::try_from(rec.path_id).map_err(|_| RecordOverflow {
                path_id: rec.path_id,
                width:   4,
                layout:  self,
            })
        };
        let mut put = |i: usize, v: u32| e.write_u32(&mut b[i * 4..i * 4 + 4], v);
        match self {
            RecordLayout::Compact | RecordLayout::Packed | RecordLayout::Wide => {
                put(0, path32()? as u32);
                put(1, rec.offset);
                put(2, rec.size);
                put(3, rec.type_index as u32);
                match (self, rec.tail) {
                    (RecordLayout::Packed, RecordTail::Packed { class_id, flags }) => {
                        e.write_i16(&mut b[16..18], class_id);
                        e.write_i16(&mut b[18..20], flags);
                    }
                    (RecordLayout::Wide, RecordTail::Wide { class_id, flags }) => {
                        put(4, class_id as u32);
                        put(5, flags as u32);
                    }
                    (RecordLayout::Packed, _) => put(4, 0),
                    (RecordLayout::Wide, _) => {
                        put(4, 0);
                        put(5, 0);
                    }
                    _ => {}
                }
            }
            RecordLayout::OffsetFirst => {
                put(0, rec.offset);
                put(1, rec.size);
                put(2, rec.type_index as u32);
                put(3, path32()? as u32);
            }
            RecordLayout::TypeFirst => {
                put(0, path32()? as u32);
                put(1, rec.type_index as u32);
                put(2, rec.offset);
                put(3, rec.size);
            }
            RecordLayout::LongPathId => {
                put(2, rec.offset);
                put(3, rec.size);
                put(4, rec.type_index as u32);
                e.write_i64(&mut b[0..8], rec.path_id);
            }
        }
        Ok(())
    }
}
