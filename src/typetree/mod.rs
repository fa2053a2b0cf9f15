//! Per-class serialization schemas ("type trees") stored in a flat arena.
//!
//! # Wire format
//!
//! The metadata blob starts with one endian byte.  Then:
//!
//! ```text
//! typeCount: i32
//! repeat typeCount:
//!     classId: i32
//!     [hash: 16 B] [hash: 16 B]     only when classId < 0, each optional
//!     node                          depth-first
//!
//! node:
//!     type: cstring   name: cstring
//!     size: i32  index: i32  isArray: i32  version: i32  flags: i32
//!     childCount: i32
//!     node × childCount
//! ```
//!
//! The hash blocks are not declared anywhere.  After a negative class id the
//! parser peeks ahead: if the next bytes read like a type name it assumes no
//! hash follows, otherwise it skips 16 bytes.  The probe runs twice.
//!
//! Nodes are parsed with an explicit stack, so a pathologically deep schema
//! cannot exhaust the call stack.

pub mod extract;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::Range;
use thiserror::Error;

use crate::reader::{ByteReader, Endian, ReadError};

pub use extract::{extract_name, find_string_field, NAME_FIELD};

/// Field flag: realign the cursor to 4 bytes after this field.
pub const ALIGN: i32 = 0x4000;

const HASH_LEN: usize = 16;
const PROBE_WINDOW: usize = 128;
const MIN_NAME_RUN: usize = 3;

#[derive(Error, Debug)]
pub enum TypeTreeError {
    #[error("Truncated type tree at offset {offset}: {source}")]
    TruncatedTypeTree { offset: usize, source: ReadError },
    #[error("Implausible type count {count} at offset {offset}")]
    BadTypeCount { offset: usize, count: i32 },
    #[error("Implausible child count {count} at offset {offset}")]
    BadChildCount { offset: usize, count: i32 },
}

impl TypeTreeError {
    fn truncated(source: ReadError) -> Self {
        let offset = match source {
            ReadError::OutOfBounds { offset, .. } | ReadError::Unterminated { offset } => offset,
        };
        TypeTreeError::TruncatedTypeTree { offset, source }
    }
}

impl From<ReadError> for TypeTreeError {
    fn from(e: ReadError) -> Self {
        TypeTreeError::truncated(e)
    }
}

// ── Nodes ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize { self.0 as usize }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeNode {
    pub type_name: String,
    pub name:      String,
    pub size:      i32,
    pub index:     i32,
    pub is_array:  bool,
    pub version:   i32,
    pub flags:     i32,
    /// Range into [`TypeTree`]'s child list.
    children:      Range<u32>,
}

impl TypeNode {
    pub fn aligned(&self) -> bool {
        self.flags & ALIGN != 0
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// One class's root plus the hash blocks that preceded it, if any.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub class_id: i32,
    pub root:     NodeId,
    pub hashes:   Vec<[u8; HASH_LEN]>,
}

// ── TypeTree ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TypeTree {
    pub endian: Endian,
    nodes:      Vec<TypeNode>,
    child_ids:  Vec<NodeId>,
    entries:    Vec<TypeEntry>,
    by_class:   BTreeMap<i32, usize>,
}

struct Frame {
    id:        NodeId,
    remaining: usize,
    children:  Vec<NodeId>,
}

impl TypeTree {
    /// Parse every type tree in `meta`.  Returns the tree and the offset just
    /// past the last one, where the object table search should begin.
    pub fn parse(meta: &[u8]) -> Result<(Self, usize), TypeTreeError> {
        let mut r = ByteReader::new(meta, Endian::Little);
        r.endian = Endian::from_tag(r.u8()?);

        let mut tree = Self {
            endian:    r.endian,
            nodes:     Vec::new(),
            child_ids: Vec::new(),
            entries:   Vec::new(),
            by_class:  BTreeMap::new(),
        };

        let count_at = r.position();
        let count = r.i32()?;
        // Each type needs at least a class id and one minimal node.
        if count < 0 || count as usize > r.remaining() / 30 + 1 {
            return Err(TypeTreeError::BadTypeCount { offset: count_at, count });
        }

        for _ in 0..count {
            let class_id = r.i32()?;
            let mut hashes = Vec::new();
            if class_id < 0 {
                for _ in 0..2 {
                    if looks_like_name(&r) {
                        break;
                    }
                    let mut h = [0u8; HASH_LEN];
                    h.copy_from_slice(r.bytes(HASH_LEN)?);
                    hashes.push(h);
                }
            }
            let root = tree.parse_nodes(&mut r)?;
            tree.by_class.insert(class_id, tree.entries.len());
            tree.entries.push(TypeEntry { class_id, root, hashes });
        }

        tracing::debug!(
            types = tree.entries.len(),
            nodes = tree.nodes.len(),
            end = r.position(),
            endian = ?tree.endian,
            "parsed type trees"
        );
        Ok((tree, r.position()))
    }

    fn read_node(&mut self, r: &mut ByteReader<'_>) -> Result<(NodeId, usize), TypeTreeError> {
        let type_name = r.cstring()?;
        let name      = r.cstring()?;
        let size      = r.i32()?;
        let index     = r.i32()?;
        let is_array  = r.i32()? != 0;
        let version   = r.i32()?;
        let flags     = r.i32()?;
        let count_at  = r.position();
        let count     = r.i32()?;
        // A child takes at least 26 bytes: two empty strings and six i32s.
        if count < 0 || count as usize > r.remaining() / 26 {
            return Err(TypeTreeError::BadChildCount { offset: count_at, count });
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(TypeNode {
            type_name, name, size, index, is_array, version, flags,
            children: 0..0,
        });
        Ok((id, count as usize))
    }

    fn parse_nodes(&mut self, r: &mut ByteReader<'_>) -> Result<NodeId, TypeTreeError> {
        let (root, n) = self.read_node(r)?;
        let mut stack = vec![Frame { id: root, remaining: n, children: Vec::new() }];

        while let Some(top) = stack.last_mut() {
            if top.remaining > 0 {
                top.remaining -= 1;
                let (id, n) = self.read_node(r)?;
                stack.push(Frame { id, remaining: n, children: Vec::new() });
                continue;
            }
            let Some(done) = stack.pop() else { break };
            let start = self.child_ids.len() as u32;
            self.child_ids.extend_from_slice(&done.children);
            self.nodes[done.id.index()].children = start..self.child_ids.len() as u32;
            if let Some(parent) = stack.last_mut() {
                parent.children.push(done.id);
            }
        }
        Ok(root)
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn root(&self, class_id: i32) -> Option<NodeId> {
        self.by_class.get(&class_id).map(|&i| self.entries[i].root)
    }

    pub fn node(&self, id: NodeId) -> &TypeNode {
        &self.nodes[id.index()]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        let r = &self.nodes[id.index()].children;
        &self.child_ids[r.start as usize..r.end as usize]
    }

    /// Entries in file order.
    pub fn entries(&self) -> &[TypeEntry] {
        &self.entries
    }

    pub fn classes(&self) -> impl Iterator<Item = i32> + '_ {
        self.entries.iter().map(|e| e.class_id)
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn node_count(&self) -> usize { self.nodes.len() }

    /// Indented text rendering of one class's schema.
    pub fn dump(&self, class_id: i32) -> Option<String> {
        let root = self.root(class_id)?;
        let mut out = String::new();
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let n = self.node(id);
            let _ = writeln!(
                out,
                "{:indent$}{} {} // size={} index={} array={} version={} flags={:#x}",
                "", n.type_name, n.name, n.size, n.index, n.is_array, n.version, n.flags,
                indent = depth * 2,
            );
            for &c in self.children(id).iter().rev() {
                stack.push((c, depth + 1));
            }
        }
        Some(out)
    }
}

/// True when the bytes at the cursor read as a printable, NUL-terminated
/// ASCII run of at least [`MIN_NAME_RUN`] characters inside the probe window.
fn looks_like_name(r: &ByteReader<'_>) -> bool {
    let window = r.peek(PROBE_WINDOW.min(r.remaining())).unwrap_or(&[]);
    match window.iter().position(|&b| b == 0) {
        Some(n) if n >= MIN_NAME_RUN => window[..n].iter().all(|b| b.is_ascii_graphic() || *b == b' '),
        _ => false,
    }
}
