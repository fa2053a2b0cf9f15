//! Object-table scanner: find the undeclared table inside the metadata blob.
//!
//! # How it works
//!
//! Nothing in the container says where the object table starts or which
//! record shape it uses.  The scanner treats every byte offset from
//! `scan_from` onward as a possible `count: i32` followed by `count` records,
//! and scores each [`RecordLayout`] there:
//!
//! 1. **Bounds** — the block must fit inside the metadata blob.
//! 2. **Sampled pass** — every `max(1, count / sample_target)`-th record is
//!    decoded; at least `sample_ratio` of them must be plausible.
//! 3. **Full pass** — all records are decoded.  `valid` counts plausible
//!    records, `mono` counts plausible records whose offset does not go
//!    backwards relative to the previous plausible one.
//!
//! A record is plausible when its size is positive, its offset is 4-aligned
//! and the range `[offset, offset + size)` lies inside the data region.
//!
//! ## Ranking
//!
//! | Priority | Criterion |
//! |----------|-----------|
//! | 1 | higher `valid / count` |
//! | 2 | higher `mono / valid` |
//! | 3 | earlier offset, earlier layout row |
//!
//! Ratios within `1e-4` count as equal.  The winner is accepted only when
//! its valid ratio reaches `accept_ratio`; there is no fallback.

use thiserror::Error;

use crate::reader::Endian;
use super::layout::{ObjectRecord, RecordLayout};

const RATIO_EPS: f64 = 1e-4;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Minimum full-pass valid ratio for the winner.
    pub accept_ratio:   f64,
    /// Minimum sampled-pass valid ratio before a full pass is attempted.
    pub sample_ratio:   f64,
    /// Roughly how many records the sampled pass looks at.
    pub sample_target:  usize,
    /// Counts above this are never considered.
    pub max_count:      u32,
    /// When set, only blocks declaring exactly this many records are scored.
    pub expected_count: Option<u32>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            accept_ratio:   0.95,
            sample_ratio:   0.90,
            sample_target:  128,
            max_count:      200_000,
            expected_count: None,
        }
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// Score of one `(offset, layout)` pair that survived the sampled pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub table_offset: usize,
    pub layout:       RecordLayout,
    pub count:        u32,
    pub valid:        u32,
    pub mono:         u32,
}

impl Candidate {
    pub fn valid_ratio(&self) -> f64 {
        if self.count == 0 { 0.0 } else { f64::from(self.valid) / f64::from(self.count) }
    }

    pub fn mono_ratio(&self) -> f64 {
        if self.valid == 0 { 0.0 } else { f64::from(self.mono) / f64::from(self.valid) }
    }

    /// Strictly better than `other` under the ranking above.
    pub fn beats(&self, other: &Candidate) -> bool {
        let dv = self.valid_ratio() - other.valid_ratio();
        if dv.abs() > RATIO_EPS {
            return dv > 0.0;
        }
        let dm = self.mono_ratio() - other.mono_ratio();
        dm.abs() > RATIO_EPS && dm > 0.0
    }

    pub fn describe(&self) -> String {
        format!(
            "offset {} layout {} ({} B) count {} valid {:.4} mono {:.4}",
            self.table_offset,
            self.layout.name(),
            self.layout.width(),
            self.count,
            self.valid_ratio(),
            self.mono_ratio(),
        )
    }
}

fn describe_best(best: &Option<Candidate>) -> String {
    best.map(|c| c.describe()).unwrap_or_else(|| "none".into())
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    #[error("Object table not found: {scanned} start position(s) scanned, {candidates} candidate(s) past pre-filter, best: {}", describe_best(.best))]
    ObjectTableNotFound {
        scanned:    usize,
        candidates: usize,
        best:       Option<Candidate>,
    },
}

/// A located and fully decoded object table.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectTable {
    /// Offset of the `count` word inside the metadata blob.
    pub table_offset: usize,
    pub layout:       RecordLayout,
    pub endian:       Endian,
    pub count:        u32,
    pub entries:      Vec<ObjectRecord>,
    pub valid_ratio:  f64,
    pub mono_ratio:   f64,
}

impl ObjectTable {
    /// Byte range of the record block (excluding the count word).
    pub fn records_range(&self) -> std::ops::Range<usize> {
        let start = self.table_offset + 4;
        start..start + self.count as usize * self.layout.width()
    }
}

/// Everything the scanner saw.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Start positions examined.
    pub scanned:    usize,
    /// Every candidate that passed the sampled pass, in offset order.
    pub candidates: Vec<Candidate>,
    pub best:       Option<Candidate>,
}

impl ScanReport {
    pub fn summary(&self) -> String {
        format!(
            "{} position(s) scanned, {} candidate(s), best: {}",
            self.scanned,
            self.candidates.len(),
            describe_best(&self.best),
        )
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Score every start position in `meta[scan_from..]` without deciding.
pub fn scan_report(
    meta:      &[u8],
    endian:    Endian,
    scan_from: usize,
    data_len:  u64,
    cfg:       &ScanConfig,
) -> ScanReport {
    let last = match meta.len().checked_sub(4) {
        Some(l) if scan_from <= l => l,
        _ => return ScanReport { scanned: 0, candidates: Vec::new(), best: None },
    };
    let positions = scan_from..=last;
    let scanned = positions.clone().count();

    #[cfg(feature = "parallel")]
    let per_position: Vec<Vec<Candidate>> = {
        use rayon::prelude::*;
        positions
            .into_par_iter()
            .map(|pos| score_position(meta, pos, endian, data_len, cfg))
            .collect()
    };

    #[cfg(not(feature = "parallel"))]
    let per_position: Vec<Vec<Candidate>> = positions
        .map(|pos| score_position(meta, pos, endian, data_len, cfg))
        .collect();

    let candidates: Vec<Candidate> = per_position.into_iter().flatten().collect();
    let best = candidates.iter().fold(None::<Candidate>, |best, c| match best {
        Some(b) if !c.beats(&b) => Some(b),
        _ => Some(*c),
    });

    ScanReport { scanned, candidates, best }
}

/// Locate and decode the object table, or fail with
/// [`RecoveryError::ObjectTableNotFound`].
pub fn recover(
    meta:      &[u8],
    endian:    Endian,
    scan_from: usize,
    data_len:  u64,
    cfg:       &ScanConfig,
) -> Result<ObjectTable, RecoveryError> {
    let report = scan_report(meta, endian, scan_from, data_len, cfg);
    let best = match report.best {
        Some(b) if b.valid_ratio() >= cfg.accept_ratio => b,
        best => {
            tracing::warn!(
                scanned = report.scanned,
                candidates = report.candidates.len(),
                best = %describe_best(&best),
                "object table not found"
            );
            return Err(RecoveryError::ObjectTableNotFound {
                scanned:    report.scanned,
                candidates: report.candidates.len(),
                best,
            });
        }
    };

    let table = decode_table(meta, endian, &best);
    tracing::info!(
        offset = table.table_offset,
        layout = table.layout.name(),
        count = table.count,
        valid_ratio = table.valid_ratio,
        mono_ratio = table.mono_ratio,
        "object table recovered"
    );
    Ok(table)
}

fn decode_table(meta: &[u8], endian: Endian, c: &Candidate) -> ObjectTable {
    let width = c.layout.width();
    let block = &meta[c.table_offset + 4..c.table_offset + 4 + c.count as usize * width];
    ObjectTable {
        table_offset: c.table_offset,
        layout:       c.layout,
        endian,
        count:        c.count,
        entries:      block.chunks_exact(width).map(|r| c.layout.decode(r, endian)).collect(),
        valid_ratio:  c.valid_ratio(),
        mono_ratio:   c.mono_ratio(),
    }
}

fn score_position(
    meta:     &[u8],
    pos:      usize,
    endian:   Endian,
    data_len: u64,
    cfg:      &ScanConfig,
) -> Vec<Candidate> {
    let count = endian.read_i32(&meta[pos..pos + 4]);
    if count <= 0 || count as u32 > cfg.max_count {
        return Vec::new();
    }
    let count = count as u32;
    if cfg.expected_count.is_some_and(|n| n != count) {
        return Vec::new();
    }
    RecordLayout::ALL
        .iter()
        .filter_map(|&layout| score_layout(meta, pos, count, layout, endian, data_len, cfg))
        .collect()
}

fn score_layout(
    meta:     &[u8],
    pos:      usize,
    count:    u32,
    layout:   RecordLayout,
    endian:   Endian,
    data_len: u64,
    cfg:      &ScanConfig,
) -> Option<Candidate> {
    let width = layout.width();
    let start = pos + 4;
    let end = start.checked_add(count as usize * width)?;
    if end > meta.len() {
        return None;
    }
    let block = &meta[start..end];
    let record = |i: usize| layout.decode(&block[i * width..(i + 1) * width], endian);

    let stride = (count as usize / cfg.sample_target.max(1)).max(1);
    let (mut sampled, mut sampled_ok) = (0usize, 0usize);
    for i in (0..count as usize).step_by(stride) {
        sampled += 1;
        if record(i).is_plausible(data_len) {
            sampled_ok += 1;
        }
    }
    if (sampled_ok as f64) < cfg.sample_ratio * sampled as f64 {
        return None;
    }

    let (mut valid, mut mono) = (0u32, 0u32);
    let mut prev: Option<u32> = None;
    for i in 0..count as usize {
        let rec = record(i);
        if !rec.is_plausible(data_len) {
            continue;
        }
        valid += 1;
        if prev.map_or(true, |p| rec.offset >= p) {
            mono += 1;
        }
        prev = Some(rec.offset);
    }

    Some(Candidate { table_offset: pos, layout, count, valid, mono })
}
