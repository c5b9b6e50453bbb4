//! Schema-driven binary layout engine.
//!
//! A descriptor is parsed once into an arena of tagged nodes. Fields are
//! addressed by dotted paths (`FvHeader.Checksum`, `Variables.2.Data`) where
//! mapping segments are names and sequence segments are indices. Offsets and
//! sizes are never cached: they are summed from the leaves on every query, so
//! a leaf that grows or shrinks moves everything after it without bookkeeping.

pub mod format;
pub mod functions;
pub mod tag;

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::descriptor::Descriptor;
use functions::{EvalContext, FunctionTable};
use tag::{LeafTag, Sizing};

/// Largest single leaf a descriptor may declare, padding included.
pub const MAX_FIELD_SIZE: usize = 1 << 24;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("unrecognized leaf format `{0}`")]
    UnknownTag(String),
    #[error("literal of `{spec}` carries {found} values, format expects {expected}")]
    LiteralMismatch {
        spec: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
    #[error("unsupported descriptor node at `{0}`")]
    UnsupportedNode(String),
    #[error("unknown computed function `{0}`")]
    UnknownFunction(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no field at `{0}`")]
    NotFound(String),
    #[error("`{0}` is not a leaf field")]
    NotLeaf(String),
    #[error("`{0}` is determined internally and cannot be changed")]
    Computed(String),
    #[error("shortcut `{0}` is read-only")]
    ReadOnlyShortcut(String),
    #[error("`{0}` exceeds the {limit} byte field limit", limit = MAX_FIELD_SIZE)]
    FieldTooLarge(String),
    #[error("value {value:#x} does not fit in {width} bytes")]
    ValueOutOfRange { value: i128, width: usize },
}

/// Index of a node inside its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub struct Leaf {
    tag: LeafTag,
    spec: String,
    buf: Vec<u8>,
}

impl Leaf {
    pub fn tag(&self) -> &LeafTag {
        &self.tag
    }

    /// The spec string exactly as the descriptor spelled it.
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Mapping(Vec<(String, NodeId)>),
    Sequence(Vec<NodeId>),
    Leaf(Leaf),
}

/// A value written through [`LayoutTree::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Packed little-endian into the natural word for the field's width.
    Integer(u64),
    Bytes(Vec<u8>),
    /// A leaf spec, encoded with the same tag rules as descriptor leaves.
    Spec(String),
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

impl From<&[u8]> for FieldValue {
    fn from(value: &[u8]) -> Self {
        FieldValue::Bytes(value.to_vec())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Spec(value.to_string())
    }
}

/// Addressable, resizable byte tree built from a [`Descriptor`].
#[derive(Debug, Clone)]
pub struct LayoutTree {
    nodes: Vec<Node>,
    root: NodeId,
    filler: u8,
    shortcuts: BTreeMap<String, String>,
    functions: FunctionTable,
}

impl LayoutTree {
    /// Builds a tree with the builtin computed functions.
    pub fn build(descriptor: &Descriptor, filler: u8) -> Result<Self, LayoutError> {
        Self::build_with(descriptor, filler, FunctionTable::with_builtins())
    }

    pub fn build_with(
        descriptor: &Descriptor,
        filler: u8,
        functions: FunctionTable,
    ) -> Result<Self, LayoutError> {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            filler,
            shortcuts: descriptor.shortcuts.clone(),
            functions,
        };
        let (root, size) = tree.parse_node(&descriptor.layout, "", 0)?;
        tree.root = root;
        debug!(nodes = tree.nodes.len(), size, "layout built");
        Ok(tree)
    }

    pub fn filler(&self) -> u8 {
        self.filler
    }

    /// Current bytes at `path`, or `None` when the path does not resolve.
    ///
    /// Shortcut names are looked up first: a shortcut holding a leaf spec is
    /// encoded on the fly, any other shortcut is followed as a tree path.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        if let Some(target) = self.shortcuts.get(path) {
            if target.contains(':') {
                let ctx = EvalContext {
                    offset: 0,
                    filler: self.filler,
                };
                return match tag::resolve(target, &ctx, &self.functions) {
                    Ok((_, buf)) => Some(buf),
                    Err(err) => {
                        debug!(shortcut = path, %err, "shortcut spec does not resolve");
                        None
                    }
                };
            }
            return self.get_node(target);
        }
        self.get_node(path)
    }

    pub fn offset(&self, path: &str) -> Option<usize> {
        self.locate(path).map(|(_, offset)| offset)
    }

    pub fn size_of(&self, path: &str) -> Option<usize> {
        self.locate(path).map(|(id, _)| self.node_size(id))
    }

    pub fn len(&self) -> usize {
        self.node_size(self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The leaf at `path`, if `path` names one.
    pub fn leaf(&self, path: &str) -> Option<&Leaf> {
        match self.locate(path).map(|(id, _)| &self.nodes[id.0]) {
            Some(Node::Leaf(leaf)) => Some(leaf),
            _ => None,
        }
    }

    /// Human-readable rendering of the leaf at `path`.
    pub fn render(&self, path: &str) -> Option<String> {
        self.leaf(path).map(|leaf| leaf.tag.render(&leaf.buf))
    }

    /// Writes a leaf.
    ///
    /// Fixed-size leaves keep their size: long values are truncated, short
    /// ones padded with the filler byte. Free-size leaves take the value as is
    /// and every computed field is re-evaluated at its new offset. A rejected
    /// write leaves the tree untouched.
    pub fn set(&mut self, path: &str, value: impl Into<FieldValue>) -> Result<(), LayoutError> {
        if self.shortcuts.contains_key(path) {
            return Err(LayoutError::ReadOnlyShortcut(path.to_string()));
        }
        let (id, offset) = self
            .locate(path)
            .ok_or_else(|| LayoutError::NotFound(path.to_string()))?;
        let (sizing, width) = match &self.nodes[id.0] {
            Node::Leaf(leaf) => (leaf.tag.sizing(), leaf.buf.len()),
            _ => return Err(LayoutError::NotLeaf(path.to_string())),
        };
        if sizing == Sizing::Computed {
            return Err(LayoutError::Computed(path.to_string()));
        }

        let bytes = match value.into() {
            FieldValue::Integer(value) => pack_word(value, width, self.filler)?,
            FieldValue::Bytes(bytes) => bytes,
            FieldValue::Spec(spec) => {
                let ctx = EvalContext {
                    offset,
                    filler: self.filler,
                };
                tag::resolve(&spec, &ctx, &self.functions)?.1
            }
        };

        match sizing {
            Sizing::Fixed => {
                let fitted = fit(bytes, width, self.filler);
                self.leaf_mut(id).buf = fitted;
            }
            Sizing::Free => {
                let previous = std::mem::replace(&mut self.leaf_mut(id).buf, bytes);
                if let Err(err) = self.fixup() {
                    self.leaf_mut(id).buf = previous;
                    self.fixup()?;
                    return Err(err);
                }
                debug!(path, old = width, new = self.node_size(id), "free-size field resized");
            }
            Sizing::Computed => unreachable!("computed fields rejected above"),
        }
        Ok(())
    }

    /// The whole image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.flatten(self.root, &mut out);
        out
    }

    fn parse_node(
        &mut self,
        desc: &Value,
        path: &str,
        offset: usize,
    ) -> Result<(NodeId, usize), LayoutError> {
        let node = match desc {
            Value::Null => Node::Mapping(Vec::new()),
            Value::Object(fields) => {
                let mut children = Vec::with_capacity(fields.len());
                let mut size = 0;
                for (name, sub) in fields {
                    let (child, child_size) =
                        self.parse_node(sub, &join(path, name), offset + size)?;
                    size += child_size;
                    children.push((name.clone(), child));
                }
                return Ok((self.push(Node::Mapping(children)), size));
            }
            Value::Array(items) => {
                let mut children = Vec::with_capacity(items.len());
                let mut size = 0;
                for (index, sub) in items.iter().enumerate() {
                    let (child, child_size) =
                        self.parse_node(sub, &join(path, &index.to_string()), offset + size)?;
                    size += child_size;
                    children.push(child);
                }
                return Ok((self.push(Node::Sequence(children)), size));
            }
            Value::String(spec) => {
                let ctx = EvalContext {
                    offset,
                    filler: self.filler,
                };
                let (tag, buf) = tag::resolve(spec, &ctx, &self.functions)?;
                let size = buf.len();
                let leaf = Leaf {
                    tag,
                    spec: spec.clone(),
                    buf,
                };
                return Ok((self.push(Node::Leaf(leaf)), size));
            }
            Value::Bool(_) | Value::Number(_) => {
                return Err(LayoutError::UnsupportedNode(path.to_string()));
            }
        };
        Ok((self.push(node), 0))
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn leaf_mut(&mut self, id: NodeId) -> &mut Leaf {
        match &mut self.nodes[id.0] {
            Node::Leaf(leaf) => leaf,
            _ => unreachable!("node {id:?} is not a leaf"),
        }
    }

    fn get_node(&self, path: &str) -> Option<Vec<u8>> {
        let (id, _) = self.locate(path)?;
        let mut out = Vec::new();
        self.flatten(id, &mut out);
        Some(out)
    }

    /// Walks `path` from the root, summing preceding sibling sizes on the way.
    fn locate(&self, path: &str) -> Option<(NodeId, usize)> {
        let mut id = self.root;
        let mut offset = 0;
        if path.is_empty() {
            return Some((id, offset));
        }
        for segment in path.split('.') {
            let next = match &self.nodes[id.0] {
                Node::Mapping(children) => {
                    let position = children.iter().position(|(name, _)| name == segment)?;
                    offset += children[..position]
                        .iter()
                        .map(|(_, child)| self.node_size(*child))
                        .sum::<usize>();
                    children[position].1
                }
                Node::Sequence(children) => {
                    let index: usize = segment.parse().ok()?;
                    let child = *children.get(index)?;
                    offset += children[..index]
                        .iter()
                        .map(|child| self.node_size(*child))
                        .sum::<usize>();
                    child
                }
                Node::Leaf(_) => return None,
            };
            id = next;
        }
        Some((id, offset))
    }

    fn node_size(&self, id: NodeId) -> usize {
        match &self.nodes[id.0] {
            Node::Mapping(children) => children.iter().map(|(_, c)| self.node_size(*c)).sum(),
            Node::Sequence(children) => children.iter().map(|c| self.node_size(*c)).sum(),
            Node::Leaf(leaf) => leaf.buf.len(),
        }
    }

    fn flatten(&self, id: NodeId, out: &mut Vec<u8>) {
        match &self.nodes[id.0] {
            Node::Mapping(children) => {
                for (_, child) in children {
                    self.flatten(*child, out);
                }
            }
            Node::Sequence(children) => {
                for child in children {
                    self.flatten(*child, out);
                }
            }
            Node::Leaf(leaf) => out.extend_from_slice(&leaf.buf),
        }
    }

    fn children(&self, id: NodeId) -> Vec<NodeId> {
        match &self.nodes[id.0] {
            Node::Mapping(children) => children.iter().map(|(_, c)| *c).collect(),
            Node::Sequence(children) => children.clone(),
            Node::Leaf(_) => Vec::new(),
        }
    }

    /// Re-evaluates every computed leaf in byte order, so a later field sees
    /// the sizes produced by earlier ones.
    fn fixup(&mut self) -> Result<(), LayoutError> {
        self.fixup_node(self.root, 0).map(|_| ())
    }

    fn fixup_node(&mut self, id: NodeId, offset: usize) -> Result<usize, LayoutError> {
        if let Node::Leaf(leaf) = &self.nodes[id.0] {
            if let LeafTag::Computed(call) = &leaf.tag {
                let ctx = EvalContext {
                    offset,
                    filler: self.filler,
                };
                let buf = call.eval(&ctx)?;
                self.leaf_mut(id).buf = buf;
            }
            return Ok(self.node_size(id));
        }

        let mut size = 0;
        for child in self.children(id) {
            size += self.fixup_node(child, offset + size)?;
        }
        Ok(size)
    }
}

/// Sum of little-endian 16-bit words, truncated to 16 bits. A trailing odd
/// byte counts as a word of its own.
pub fn checksum(data: &[u8]) -> u16 {
    data.chunks(2).fold(0u16, |sum, word| {
        let word = match word {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            [lo] => u16::from(*lo),
            _ => 0,
        };
        sum.wrapping_add(word)
    })
}

/// Filler run that rounds `current_len` up to a multiple of `alignment`.
pub fn alignment_padding(
    alignment: u64,
    current_len: usize,
    filler: u8,
) -> Result<Vec<u8>, LayoutError> {
    if !alignment.is_power_of_two() {
        return Err(LayoutError::InvalidArgument(format!(
            "alignment {alignment} is not a power of two"
        )));
    }
    if alignment > MAX_FIELD_SIZE as u64 {
        return Err(LayoutError::FieldTooLarge(format!("alignment {alignment:#x}")));
    }
    let pad = (current_len as u64).wrapping_neg() & (alignment - 1);
    Ok(vec![filler; pad as usize])
}

fn pack_word(value: u64, width: usize, filler: u8) -> Result<Vec<u8>, LayoutError> {
    let natural = match width {
        1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 8,
    };
    if natural < 8 && value >> (natural * 8) != 0 {
        return Err(LayoutError::ValueOutOfRange {
            value: value.into(),
            width: natural,
        });
    }
    let mut bytes = value.to_le_bytes()[..natural].to_vec();
    if width > natural {
        bytes.resize(width, filler);
    }
    Ok(bytes)
}

fn fit(mut bytes: Vec<u8>, width: usize, filler: u8) -> Vec<u8> {
    bytes.resize(width, filler);
    bytes
}

fn join(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}
