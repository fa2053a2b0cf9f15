//! Unpack / pack: the embedding surface.
//!
//! ```no_run
//! use sfv6::assets::{pack, unpack, PackOptions, UnpackOptions};
//!
//! // Split a container into objects/, metadata.bin and manifest.json.
//! let summary = unpack("level0.assets", "work", &UnpackOptions::default())?;
//! println!("{} objects", summary.objects);
//!
//! // Edit files under work/objects/, then rebuild.
//! pack("work", "level0.rebuilt.assets", &PackOptions::default())?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::header::{ContainerHeader, HeaderError, HEADER_SIZE};
use crate::manifest::{
    parse_object_index, Manifest, ManifestError, MANIFEST_FILE, METADATA_FILE, OBJECTS_DIR,
};
use crate::reader::align4;
use crate::recovery::{recover, ObjectRecord, ObjectTable, RecordOverflow, RecoveryError, ScanConfig};
use crate::typetree::{extract_name, NodeId, TypeTree, TypeTreeError};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum AssetsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    TypeTree(#[from] TypeTreeError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    RecordOverflow(#[from] RecordOverflow),
    #[error("Object {index} (path id {path_id}) range {offset}+{size} exceeds data region of {data_len} bytes")]
    DataRangeOutOfBounds {
        index:    usize,
        path_id:  i64,
        offset:   u32,
        size:     u32,
        data_len: u64,
    },
    #[error("Manifest not found: {0}")]
    ManifestMissing(PathBuf),
    #[error("Manifest mismatch: expected {expected} object(s), found {found}: {reason}")]
    ManifestMismatch {
        expected: u32,
        found:    usize,
        reason:   String,
    },
    #[error("Metadata size mismatch: {path} is {found} bytes, expected {expected} (or {expected} + {HEADER_SIZE} with header prefix)")]
    MetadataSizeMismatch {
        path:     PathBuf,
        expected: u32,
        found:    u64,
    },
    #[error("Rebuilt container is {0} bytes, beyond the 32-bit size fields")]
    ContainerTooLarge(u64),
}

// ── Options & summaries ───────────────────────────────────────────────────────

/// Configuration for [`unpack`].
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// Recover `m_Name` for each object and append it to the file name.
    pub extract_names: bool,
    pub scan:          ScanConfig,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self { extract_names: true, scan: ScanConfig::default() }
    }
}

/// Configuration for [`pack`].
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Original container; payloads with no file under `objects/` are
    /// copied from its byte ranges.
    pub source: Option<PathBuf>,
    pub scan:   ScanConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackSummary {
    pub objects:       usize,
    pub named:         usize,
    pub payload_bytes: u64,
    pub meta_size:     u32,
    pub table_offset:  usize,
    pub layout:        &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub objects:      usize,
    /// Payloads taken from [`PackOptions::source`].
    pub from_source:  usize,
    pub meta_size:    u32,
    pub file_size:    u32,
    pub table_offset: usize,
    /// The table was found somewhere other than where the manifest put it.
    pub relocated:    bool,
}

// ── Container ─────────────────────────────────────────────────────────────────

/// A parsed container: header, type trees and the recovered object table,
/// borrowing the raw bytes.
pub struct Container<'a> {
    bytes:         &'a [u8],
    pub header:    ContainerHeader,
    pub types:     TypeTree,
    /// Offset just past the type trees inside the metadata blob.
    pub types_end: usize,
    pub table:     ObjectTable,
}

impl<'a> Container<'a> {
    pub fn parse(bytes: &'a [u8], scan: &ScanConfig) -> Result<Self, AssetsError> {
        let header = ContainerHeader::parse(bytes)?;
        tracing::debug!(
            meta_size = header.meta_size,
            file_size = header.file_size,
            data_base = header.data_base(),
            "container header"
        );
        let meta = &bytes[header.meta_start() as usize..header.file_size as usize];
        let (types, types_end) = TypeTree::parse(meta)?;
        let table = recover(meta, types.endian, types_end, header.data_len(), scan)?;
        Ok(Self { bytes, header, types, types_end, table })
    }

    pub fn metadata(&self) -> &'a [u8] {
        let bytes = self.bytes;
        &bytes[self.header.meta_start() as usize..self.header.file_size as usize]
    }

    /// Fail on the first record whose range leaves the data region.
    pub fn validate_ranges(&self) -> Result<(), AssetsError> {
        (0..self.table.entries.len()).try_for_each(|i| self.payload(i).map(|_| ()))
    }

    /// Payload bytes of object `index`.  A table can be accepted with a few
    /// implausible records, so every access is bounds-checked.
    pub fn payload(&self, index: usize) -> Result<&'a [u8], AssetsError> {
        let bytes = self.bytes;
        let rec = &self.table.entries[index];
        let data_len = self.header.data_len();
        if u64::from(rec.offset) + u64::from(rec.size) > data_len {
            return Err(AssetsError::DataRangeOutOfBounds {
                index,
                path_id:  rec.path_id,
                offset:   rec.offset,
                size:     rec.size,
                data_len,
            });
        }
        let start = self.header.data_base() as usize + rec.offset as usize;
        Ok(&bytes[start..start + rec.size as usize])
    }

    /// Schema for a record, tried in order: the class id carried by the
    /// layout, `type_index` read as a class id, `type_index` as a position
    /// in the type list.
    pub fn schema(&self, rec: &ObjectRecord) -> Option<NodeId> {
        rec.tail
            .class_id()
            .and_then(|c| self.types.root(c))
            .or_else(|| self.types.root(rec.type_index))
            .or_else(|| {
                let i = usize::try_from(rec.type_index).ok()?;
                self.types.entries().get(i).map(|e| e.root)
            })
    }

    /// `m_Name` of object `index`; `None` when absent, empty or out of range.
    pub fn name(&self, index: usize) -> Option<String> {
        let rec = &self.table.entries[index];
        let root = self.schema(rec)?;
        let payload = self.payload(index).ok()?;
        extract_name(&self.types, root, payload, self.types.endian).filter(|n| !n.is_empty())
    }
}

// ── Unpack ────────────────────────────────────────────────────────────────────

/// Split `container` into `out_dir/{objects/, metadata.bin, manifest.json}`.
///
/// Every record range is checked before the first file is written.
pub fn unpack<P: AsRef<Path>, Q: AsRef<Path>>(
    container: P,
    out_dir:   Q,
    opts:      &UnpackOptions,
) -> Result<UnpackSummary, AssetsError> {
    let out_dir = out_dir.as_ref();
    let bytes = fs::read(container.as_ref())?;
    let c = Container::parse(&bytes, &opts.scan)?;
    c.validate_ranges()?;

    let count = c.table.entries.len();
    let names: Vec<Option<String>> = if opts.extract_names {
        (0..count).map(|i| c.name(i)).collect()
    } else {
        vec![None; count]
    };
    let manifest = Manifest::from_table(&c.header, &c.table, &names);

    let objects_dir = out_dir.join(OBJECTS_DIR);
    fs::create_dir_all(&objects_dir)?;
    remove_stale_objects(&objects_dir)?;
    let mut payload_bytes = 0u64;
    for (i, entry) in manifest.entries.iter().enumerate() {
        let payload = c.payload(i)?;
        fs::write(objects_dir.join(&entry.file), payload)?;
        payload_bytes += payload.len() as u64;
    }
    fs::write(out_dir.join(METADATA_FILE), c.metadata())?;
    fs::write(out_dir.join(MANIFEST_FILE), manifest.to_bytes()?)?;

    let summary = UnpackSummary {
        objects:      count,
        named:        names.iter().filter(|n| n.is_some()).count(),
        payload_bytes,
        meta_size:    c.header.meta_size,
        table_offset: c.table.table_offset,
        layout:       c.table.layout.name(),
    };
    tracing::info!(
        objects = summary.objects,
        named = summary.named,
        payload_bytes = summary.payload_bytes,
        out = %out_dir.display(),
        "unpacked"
    );
    Ok(summary)
}

// ── Pack ──────────────────────────────────────────────────────────────────────

/// Rebuild a container from a directory produced by [`unpack`].
pub fn pack<P: AsRef<Path>, Q: AsRef<Path>>(
    in_dir: P,
    out:    Q,
    opts:   &PackOptions,
) -> Result<PackSummary, AssetsError> {
    let in_dir = in_dir.as_ref();

    let manifest_path = in_dir.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(AssetsError::ManifestMissing(manifest_path));
    }
    let manifest = Manifest::from_bytes(&fs::read(&manifest_path)?)?;
    let mut meta = read_metadata(&in_dir.join(METADATA_FILE), manifest.meta_size)?;

    // Metadata may have been edited by hand; find the table again.
    let scan_from = match TypeTree::parse(&meta) {
        Ok((_, end)) => end,
        Err(e) => {
            tracing::warn!(error = %e, "type trees unreadable, scanning whole metadata");
            0
        }
    };
    let cfg = ScanConfig { expected_count: Some(manifest.count), ..opts.scan.clone() };
    let table = recover(&meta, manifest.endian, scan_from, manifest.data_len(), &cfg)?;
    let relocated = table.table_offset != manifest.table_offset || table.layout != manifest.layout;
    if relocated {
        tracing::warn!(
            manifest_offset = manifest.table_offset,
            manifest_layout = manifest.layout.name(),
            offset = table.table_offset,
            layout = table.layout.name(),
            "object table relocated"
        );
    }

    let mut payloads = collect_payloads(&in_dir.join(OBJECTS_DIR), manifest.count)?;
    let found = payloads.iter().filter(|p| p.is_some()).count();
    let from_source = payloads.len() - found;
    if from_source > 0 {
        let Some(source) = &opts.source else {
            return Err(AssetsError::ManifestMismatch {
                expected: manifest.count,
                found,
                reason:   "payload files missing and no source container given".into(),
            });
        };
        fill_from_source(source, &manifest, &mut payloads, found)?;
    }

    // ── Layout ───────────────────────────────────────────────────────────────
    let data_base = manifest.data_base as usize;
    let mut out_buf = vec![0u8; data_base.max(HEADER_SIZE)];
    let mut records = Vec::with_capacity(payloads.len());
    for (entry, payload) in manifest.entries.iter().zip(payloads.iter().flatten()) {
        out_buf.resize(data_base + align4(out_buf.len() - data_base), 0);
        let offset = out_buf.len() - data_base;
        out_buf.extend_from_slice(payload);
        records.push(ObjectRecord {
            path_id:    entry.path_id,
            offset:     u32::try_from(offset).map_err(|_| AssetsError::ContainerTooLarge(offset as u64))?,
            size:       u32::try_from(payload.len()).map_err(|_| AssetsError::ContainerTooLarge(payload.len() as u64))?,
            type_index: entry.type_index,
            tail:       entry.tail,
        });
    }
    out_buf.resize(data_base + align4(out_buf.len() - data_base), 0);

    // ── Table rewrite ────────────────────────────────────────────────────────
    let width = table.layout.width();
    table.endian.write_i32(&mut meta[table.table_offset..table.table_offset + 4], records.len() as i32);
    let block = &mut meta[table.records_range()];
    for (rec, slot) in records.iter().zip(block.chunks_exact_mut(width)) {
        table.layout.encode(rec, table.endian, slot)?;
    }

    let total = (out_buf.len() + meta.len()) as u64;
    let file_size = u32::try_from(total).map_err(|_| AssetsError::ContainerTooLarge(total))?;
    let header = ContainerHeader {
        meta_size:   manifest.meta_size,
        file_size,
        version:     manifest.version,
        data_offset: manifest.data_offset,
        reserved:    manifest.reserved,
    };
    out_buf[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    out_buf.extend_from_slice(&meta);
    fs::write(out.as_ref(), &out_buf)?;

    let summary = PackSummary {
        objects:      records.len(),
        from_source,
        meta_size:    header.meta_size,
        file_size,
        table_offset: table.table_offset,
        relocated,
    };
    tracing::info!(
        objects = summary.objects,
        from_source = summary.from_source,
        file_size = summary.file_size,
        out = %out.as_ref().display(),
        "packed"
    );
    Ok(summary)
}

/// Delete object files left by an earlier unpack into the same directory,
/// so each index is claimed by one file only.
fn remove_stale_objects(dir: &Path) -> Result<(), AssetsError> {
    let mut removed = 0usize;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let stale = path.is_file()
            && path.file_name().and_then(|n| n.to_str()).and_then(parse_object_index).is_some();
        if stale {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::debug!(removed, dir = %dir.display(), "removed stale object files");
    }
    Ok(())
}

/// Read `metadata.bin`, accepting an optional 20-byte header prefix.
fn read_metadata(path: &Path, meta_size: u32) -> Result<Vec<u8>, AssetsError> {
    if !path.is_file() {
        return Err(AssetsError::MetadataSizeMismatch { path: path.to_owned(), expected: meta_size, found: 0 });
    }
    let mut meta = fs::read(path)?;
    let expected = meta_size as usize;
    if meta.len() == expected + HEADER_SIZE {
        tracing::debug!(path = %path.display(), "stripping header prefix from metadata");
        meta.drain(..HEADER_SIZE);
    } else if meta.len() != expected {
        return Err(AssetsError::MetadataSizeMismatch {
            path:     path.to_owned(),
            expected: meta_size,
            found:    meta.len() as u64,
        });
    }
    Ok(meta)
}

/// Payload bytes by table index; `None` where no file was found.
fn collect_payloads(dir: &Path, count: u32) -> Result<Vec<Option<Vec<u8>>>, AssetsError> {
    let mismatch = |found: usize, reason: String| AssetsError::ManifestMismatch { expected: count, found, reason };

    let mut files: BTreeMap<u32, PathBuf> = BTreeMap::new();
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !path.is_file() || !file_name.ends_with(".bin") {
                continue;
            }
            let Some(index) = parse_object_index(file_name) else {
                return Err(mismatch(files.len(), format!("cannot read table index from {file_name}")));
            };
            if index >= count {
                return Err(mismatch(files.len(), format!("{file_name}: index {index} out of range")));
            }
            if let Some(prev) = files.insert(index, path.clone()) {
                return Err(mismatch(files.len(), format!(
                    "index {index} claimed by both {} and {file_name}",
                    prev.display()
                )));
            }
        }
    }

    let mut payloads = vec![None; count as usize];
    for (index, path) in files {
        payloads[index as usize] = Some(fs::read(path)?);
    }
    Ok(payloads)
}

fn fill_from_source(
    source:   &Path,
    manifest: &Manifest,
    payloads: &mut [Option<Vec<u8>>],
    found:    usize,
) -> Result<(), AssetsError> {
    let bytes = fs::read(source)?;
    let header = ContainerHeader::parse(&bytes)?;
    if header.meta_size != manifest.meta_size
        || header.file_size != manifest.file_size
        || header.data_base() != manifest.data_base
    {
        return Err(AssetsError::ManifestMismatch {
            expected: manifest.count,
            found,
            reason:   format!(
                "source {} has meta_size={} file_size={} data_base={}, manifest has {} / {} / {}",
                source.display(),
                header.meta_size,
                header.file_size,
                header.data_base(),
                manifest.meta_size,
                manifest.file_size,
                manifest.data_base,
            ),
        });
    }
    let data_len = header.data_len();
    let base = header.data_base() as usize;

    for (entry, slot) in manifest.entries.iter().zip(payloads.iter_mut()) {
        if slot.is_some() {
            continue;
        }
        if u64::from(entry.offset) + u64::from(entry.size) > data_len {
            return Err(AssetsError::DataRangeOutOfBounds {
                index:   entry.index as usize,
                path_id: entry.path_id,
                offset:  entry.offset,
                size:    entry.size,
                data_len,
            });
        }
        let start = base + entry.offset as usize;
        tracing::debug!(index = entry.index, path_id = entry.path_id, "payload read from source");
        *slot = Some(bytes[start..start + entry.size as usize].to_vec());
    }
    Ok(())
}
