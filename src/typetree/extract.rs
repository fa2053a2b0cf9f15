//! Schema-driven lookup of one named string field inside an object payload.
//!
//! The walk mirrors how the engine serialized the object: fields in declared
//! order, strings and arrays length-prefixed, and a realignment to four bytes
//! (relative to the object start) wherever the schema asks for one.  It stops
//! at the first match and never reads the rest of the object.
//!
//! Running off the end of the payload is not an error.  The field is simply
//! reported absent, which is the normal outcome for many classes.

use crate::reader::{align4, Endian};
use super::{NodeId, TypeNode, TypeTree};

/// Display-name field carried by most named engine objects.
pub const NAME_FIELD: &str = "m_Name";

const MAX_DEPTH: usize = 64;

enum Walk {
    Continue,
    Found(String),
    Stop,
}

/// Fixed on-disk width of a primitive leaf type.
pub fn primitive_width(type_name: &str) -> Option<usize> {
    Some(match type_name {
        "SInt8" | "UInt8" | "char" | "bool" => 1,
        "SInt16" | "UInt16" | "short" | "unsigned short" => 2,
        "SInt32" | "UInt32" | "int" | "unsigned int" | "float" => 4,
        "SInt64" | "UInt64" | "long long" | "unsigned long long" | "double" => 8,
        _ => return None,
    })
}

/// Extract `m_Name` from `object` using the schema rooted at `root`.
pub fn extract_name(tree: &TypeTree, root: NodeId, object: &[u8], endian: Endian) -> Option<String> {
    find_string_field(tree, root, object, endian, NAME_FIELD)
}

/// Extract the first `string` field literally named `field`.
pub fn find_string_field(
    tree:   &TypeTree,
    root:   NodeId,
    object: &[u8],
    endian: Endian,
    field:  &str,
) -> Option<String> {
    let mut w = Walker { tree, data: object, pos: 0, endian, field };
    match w.walk(root, 0) {
        Walk::Found(s) => Some(s),
        Walk::Continue | Walk::Stop => None,
    }
}

struct Walker<'a> {
    tree:   &'a TypeTree,
    data:   &'a [u8],
    pos:    usize,
    endian: Endian,
    field:  &'a str,
}

impl Walker<'_> {
    fn walk(&mut self, id: NodeId, depth: usize) -> Walk {
        if depth > MAX_DEPTH {
            return Walk::Stop;
        }
        let tree = self.tree;
        let node = tree.node(id);

        if node.type_name == "string" {
            let Some(s) = self.read_string() else { return Walk::Stop };
            return if node.name == self.field { Walk::Found(s) } else { Walk::Continue };
        }

        if let Some(elem) = self.array_element(id, node) {
            return self.walk_array(node, elem, depth);
        }

        let children = tree.children(id);
        if children.is_empty() {
            let width = match primitive_width(&node.type_name) {
                Some(w) => w,
                None if node.size > 0 => node.size as usize,
                None => return Walk::Stop,
            };
            self.advance(width);
        } else {
            for &child in children {
                match self.walk(child, depth + 1) {
                    Walk::Continue => {}
                    done => return done,
                }
            }
        }
        if node.aligned() {
            self.align();
        }
        Walk::Continue
    }

    fn walk_array(&mut self, node: &TypeNode, elem: NodeId, depth: usize) -> Walk {
        let Some(count) = self.read_i32() else { return Walk::Stop };
        if count < 0 || count as usize > self.remaining() {
            return Walk::Stop;
        }
        let count = count as usize;

        let tree = self.tree;
        let elem_node = tree.node(elem);
        let fixed = primitive_width(&elem_node.type_name)
            .filter(|_| tree.children(elem).is_empty());
        match fixed {
            Some(w) => {
                if count * w > self.remaining() {
                    return Walk::Stop;
                }
                self.pos += count * w;
            }
            None => {
                for _ in 0..count {
                    match self.walk(elem, depth + 1) {
                        Walk::Continue => {}
                        done => return done,
                    }
                }
            }
        }
        if node.aligned() {
            self.align();
        }
        Walk::Continue
    }

    /// Element schema of an array node: flagged `is_array`, or shaped like
    /// `Array { size, data }`.
    fn array_element(&self, id: NodeId, node: &TypeNode) -> Option<NodeId> {
        let children = self.tree.children(id);
        if node.is_array {
            return children.last().copied();
        }
        match children {
            [size, data]
                if self.tree.node(*size).name == "size" && self.tree.node(*data).name == "data" =>
            {
                Some(*data)
            }
            _ => None,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn advance(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n).min(self.data.len());
    }

    fn align(&mut self) {
        self.pos = align4(self.pos).min(self.data.len());
    }

    fn read_i32(&mut self) -> Option<i32> {
        let b = self.data.get(self.pos..self.pos.checked_add(4)?)?;
        self.pos += 4;
        Some(self.endian.read_i32(b))
    }

    /// Length-prefixed UTF-8, clamped to the payload, then aligned.
    fn read_string(&mut self) -> Option<String> {
        let len = self.read_i32()?;
        let len = usize::try_from(len).ok()?.min(self.remaining());
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        self.align();
        Some(s)
    }
}
