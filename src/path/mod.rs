pub mod parse;
pub mod pattern;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single tree node identifier: a structured atom-like name or a byte
/// string. The derived ordering (atoms before byte strings, lexicographic
/// within each kind) is the deterministic sibling order used by the walker
/// and the keep-while cascade.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeId {
    Atom(CompactString),
    Bytes(Vec<u8>),
}

impl NodeId {
    pub fn atom(name: impl Into<CompactString>) -> Self {
        NodeId::Atom(name.into())
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, NodeId::Atom(_))
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for NodeId {
    fn from(bytes: Vec<u8>) -> Self {
        NodeId::Bytes(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Atom(name) => write!(f, ":{name}"),
            NodeId::Bytes(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
        }
    }
}

/// Ordered sequence of node identifiers. The empty path denotes the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(Vec<NodeId>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn new(ids: Vec<NodeId>) -> Self {
        Path(ids)
    }

    /// Builds a path of byte-string identifiers, the common caller shape.
    pub fn from_strs(parts: &[&str]) -> Self {
        Path(parts.iter().map(|p| NodeId::from(*p)).collect())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.0.is_empty() {
            return None;
        }
        Some(Path(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child(&self, id: NodeId) -> Path {
        let mut ids = self.0.clone();
        ids.push(id);
        Path(ids)
    }

    pub fn push(&mut self, id: NodeId) {
        self.0.push(id);
    }

    /// True if `self` is `other` or a descendant of `other`.
    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.len() >= other.0.len() && self.0[..other.0.len()] == other.0[..]
    }
}

impl From<Vec<NodeId>> for Path {
    fn from(ids: Vec<NodeId>) -> Self {
        Path(ids)
    }
}

impl FromIterator<NodeId> for Path {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Path(iter.into_iter().collect())
    }
}

impl IntoIterator for Path {
    type Item = NodeId;
    type IntoIter = std::vec::IntoIter<NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Path {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for id in &self.0 {
            write!(f, "/{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeId, Path};

    #[test]
    fn atoms_order_before_byte_strings() {
        let atom = NodeId::atom("zzz");
        let bytes = NodeId::from("aaa");
        assert!(atom < bytes);
    }

    #[test]
    fn parent_of_root_is_none() {
        assert_eq!(Path::root().parent(), None);
        let p = Path::from_strs(&["stock", "wood"]);
        assert_eq!(p.parent(), Some(Path::from_strs(&["stock"])));
    }

    #[test]
    fn starts_with_includes_self_and_descendants() {
        let base = Path::from_strs(&["stock"]);
        let deep = Path::from_strs(&["stock", "wood", "oak"]);
        assert!(deep.starts_with(&base));
        assert!(base.starts_with(&base));
        assert!(!base.starts_with(&deep));
        assert!(deep.starts_with(&Path::root()));
    }

    #[test]
    fn display_renders_unix_form() {
        assert_eq!(Path::root().to_string(), "/");
        let p = Path::new(vec![NodeId::atom("stock"), NodeId::from("oak")]);
        assert_eq!(p.to_string(), "/:stock/oak");
    }
}
