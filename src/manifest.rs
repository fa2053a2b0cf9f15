//! `manifest.json` — the contract between unpack and pack.
//!
//! Serialized with camelCase keys.  Deserialization also reads the older
//! tool's key names (PascalCase, `EntrySize` + `PathIdIs64` instead of a
//! layout name, `OffsetRel`/`ClassId`/`Flags` per entry, no file names) and
//! derives the missing pieces the way unpack would.  Only the key names carry
//! over: that tool laid metadata out in front of the payloads, and a manifest
//! describing that layout (`DataBase == MetaSize`) is rejected, since pack
//! always writes metadata at the tail.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::header::{ContainerHeader, HEADER_SIZE};
use crate::reader::Endian;
use crate::recovery::{ObjectRecord, ObjectTable, RecordLayout, RecordTail};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const METADATA_FILE: &str = "metadata.bin";
pub const OBJECTS_DIR:   &str = "objects";

const MAX_NAME_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Manifest inconsistent: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub index:      u32,
    pub path_id:    i64,
    pub offset:     u32,
    pub size:       u32,
    pub type_index: i32,
    pub tail:       RecordTail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name:       Option<String>,
    pub file:       String,
}

impl ManifestEntry {
    pub fn record(&self) -> ObjectRecord {
        ObjectRecord {
            path_id:    self.path_id,
            offset:     self.offset,
            size:       self.size,
            type_index: self.type_index,
            tail:       self.tail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version:       u32,
    pub meta_size:     u32,
    pub file_size:     u32,
    pub data_base:     u64,
    pub data_offset:   u32,
    pub reserved:      u32,
    pub endian:        Endian,
    pub table_offset:  usize,
    pub layout:        RecordLayout,
    pub record_width:  usize,
    pub path_id_width: usize,
    pub count:         u32,
    pub entries:       Vec<ManifestEntry>,
}

impl Manifest {
    /// Build from a recovered table.  `names[i]` is the display name of
    /// entry `i`, when one was found.
    pub fn from_table(hdr: &ContainerHeader, table: &ObjectTable, names: &[Option<String>]) -> Self {
        let entries = table.entries.iter().enumerate().map(|(i, rec)| {
            let name = names.get(i).cloned().flatten();
            ManifestEntry {
                index:      i as u32,
                path_id:    rec.path_id,
                offset:     rec.offset,
                size:       rec.size,
                type_index: rec.type_index,
                tail:       rec.tail,
                file:       object_file_name(i as u32, rec.path_id, rec.type_index, name.as_deref()),
                name,
            }
        }).collect();

        Self {
            version:       hdr.version,
            meta_size:     hdr.meta_size,
            file_size:     hdr.file_size,
            data_base:     hdr.data_base(),
            data_offset:   hdr.data_offset,
            reserved:      hdr.reserved,
            endian:        table.endian,
            table_offset:  table.table_offset,
            layout:        table.layout,
            record_width:  table.layout.width(),
            path_id_width: table.layout.path_id_width(),
            count:         table.count,
            entries,
        }
    }

    /// Data-region length of the container this manifest was taken from.
    pub fn data_len(&self) -> u64 {
        u64::from(self.file_size)
            .saturating_sub(u64::from(self.meta_size))
            .saturating_sub(self.data_base)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.entries.len() != self.count as usize {
            return Err(ManifestError::Inconsistent(format!(
                "count {} but {} entries", self.count, self.entries.len()
            )));
        }
        if self.record_width != self.layout.width() {
            return Err(ManifestError::Inconsistent(format!(
                "recordWidth {} does not match layout {} ({} B)",
                self.record_width, self.layout.name(), self.layout.width()
            )));
        }
        if self.data_base < HEADER_SIZE as u64 {
            return Err(ManifestError::Inconsistent(format!(
                "dataBase {} lies inside the {HEADER_SIZE}-byte header", self.data_base
            )));
        }
        if let Some((i, e)) = self.entries.iter().enumerate().find(|(i, e)| e.index as usize != *i) {
            return Err(ManifestError::Inconsistent(format!(
                "entry {i} carries index {}", e.index
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let m: Self = serde_json::from_slice(bytes)?;
        m.validate()?;
        Ok(m)
    }
}

// ── Deserialization with legacy support ──────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRaw {
    #[serde(default)]
    index:      Option<u32>,
    #[serde(alias = "PathId")]
    path_id:    i64,
    #[serde(alias = "OffsetRel", alias = "offsetRel")]
    offset:     u32,
    #[serde(alias = "Size")]
    size:       u32,
    #[serde(alias = "TypeIndex")]
    type_index: i32,
    #[serde(default)]
    tail:       Option<RecordTail>,
    #[serde(default, alias = "ClassId")]
    class_id:   Option<i32>,
    #[serde(default, alias = "Flags")]
    flags:      Option<i32>,
    #[serde(default)]
    name:       Option<String>,
    #[serde(default)]
    file:       Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestRaw {
    #[serde(alias = "Version")]
    version:       u32,
    #[serde(alias = "MetaSize")]
    meta_size:     u32,
    #[serde(alias = "FileSize")]
    file_size:     u32,
    #[serde(alias = "DataBase")]
    data_base:     u64,
    #[serde(default)]
    data_offset:   u32,
    #[serde(default)]
    reserved:      u32,
    #[serde(default)]
    endian:        Option<Endian>,
    #[serde(alias = "TableOffset")]
    table_offset:  usize,
    #[serde(default)]
    layout:        Option<RecordLayout>,
    #[serde(alias = "EntrySize")]
    record_width:  usize,
    #[serde(default)]
    path_id_width: Option<usize>,
    #[serde(default, alias = "PathIdIs64")]
    path_id_is64:  Option<bool>,
    #[serde(alias = "Count")]
    count:         u32,
    #[serde(alias = "Entries")]
    entries:       Vec<EntryRaw>,
}

fn legacy_layout(width: usize, long_path_id: bool) -> Option<RecordLayout> {
    RecordLayout::ALL
        .iter()
        .copied()
        .find(|l| l.width() == width && (l.path_id_width() == 8) == long_path_id)
}

fn legacy_tail(layout: RecordLayout, class_id: Option<i32>, flags: Option<i32>) -> Result<RecordTail, String> {
    let narrow = |field: &str, v: Option<i32>| {
        let v = v.unwrap_or(0);
        i16::try_from(v).map_err(|_| format!("{field} {v} does not fit the 16-bit field of layout packed"))
    };
    Ok(match (layout, class_id, flags) {
        (_, None, None) => RecordTail::None,
        (RecordLayout::Packed, c, f) => RecordTail::Packed {
            class_id: narrow("ClassId", c)?,
            flags:    narrow("Flags", f)?,
        },
        (RecordLayout::Wide, c, f) => RecordTail::Wide {
            class_id: c.unwrap_or(0),
            flags:    f.unwrap_or(0),
        },
        _ => RecordTail::None,
    })
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = ManifestRaw::deserialize(deserializer)?;
        let custom = |msg: String| <D::Error as serde::de::Error>::custom(msg);

        if raw.layout.is_none() && raw.data_base == u64::from(raw.meta_size) {
            return Err(custom(format!(
                "DataBase {} equals MetaSize: metadata in front of the payloads is not supported",
                raw.data_base
            )));
        }

        let long_path_id = raw.path_id_is64.unwrap_or(false) || raw.path_id_width == Some(8);
        let layout = match raw.layout {
            Some(l) => l,
            None => legacy_layout(raw.record_width, long_path_id).ok_or_else(|| {
                custom(format!(
                    "no record layout of {} bytes (64-bit path id: {long_path_id})",
                    raw.record_width
                ))
            })?,
        };

        let mut entries = Vec::with_capacity(raw.entries.len());
        for (i, e) in raw.entries.into_iter().enumerate() {
            let index = e.index.unwrap_or(i as u32);
            let tail = match e.tail {
                Some(t) => t,
                None => legacy_tail(layout, e.class_id, e.flags)
                    .map_err(|msg| custom(format!("entry {index}: {msg}")))?,
            };
            let file = e.file.unwrap_or_else(|| {
                object_file_name(index, e.path_id, e.type_index, e.name.as_deref())
            });
            entries.push(ManifestEntry {
                index,
                path_id: e.path_id,
                offset: e.offset,
                size: e.size,
                type_index: e.type_index,
                tail,
                name: e.name,
                file,
            });
        }

        Ok(Manifest {
            version:       raw.version,
            meta_size:     raw.meta_size,
            file_size:     raw.file_size,
            data_base:     raw.data_base,
            data_offset:   raw.data_offset,
            reserved:      raw.reserved,
            endian:        raw.endian.unwrap_or(Endian::Little),
            table_offset:  raw.table_offset,
            layout,
            record_width:  raw.record_width,
            path_id_width: layout.path_id_width(),
            count:         raw.count,
            entries,
        })
    }
}

// ── Object file naming ───────────────────────────────────────────────────────

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`, cap the length.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .take(MAX_NAME_LEN)
        .collect()
}

/// `{index:05}__pid-{pathId}__typ-{typeIndex}[__{name}].bin`
pub fn object_file_name(index: u32, path_id: i64, type_index: i32, name: Option<&str>) -> String {
    match name.map(sanitize_name).filter(|n| !n.is_empty()) {
        Some(n) => format!("{index:05}__pid-{path_id}__typ-{type_index}__{n}.bin"),
        None    => format!("{index:05}__pid-{path_id}__typ-{type_index}.bin"),
    }
}

/// Table index encoded at the front of an object file name.
pub fn parse_object_index(file_name: &str) -> Option<u32> {
    let stem = file_name.strip_suffix(".bin")?;
    let digits = stem.split("__").next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
