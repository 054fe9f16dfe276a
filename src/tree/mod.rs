pub mod props;

use crate::error::ArborError;
use crate::path::pattern::NodeFacts;
use crate::path::{NodeId, Path};
use crate::sproc::StandaloneFun;
use crate::term::Term;
use crate::tree::props::{NodeProps, PropFilter, PropName};
use im::OrdMap;
use serde::{Deserialize, Serialize};

/// Per-node content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    None,
    Data(Term),
    Sproc(StandaloneFun),
}

impl Payload {
    pub fn is_none(&self) -> bool {
        matches!(self, Payload::None)
    }

    pub fn has_data(&self) -> bool {
        matches!(self, Payload::Data(_))
    }

    pub fn is_sproc(&self) -> bool {
        matches!(self, Payload::Sproc(_))
    }

    pub fn has_payload(&self) -> bool {
        !self.is_none()
    }

    pub fn data(&self) -> Option<&Term> {
        match self {
            Payload::Data(term) => Some(term),
            _ => None,
        }
    }

    pub fn sproc(&self) -> Option<&StandaloneFun> {
        match self {
            Payload::Sproc(fun) => Some(fun),
            _ => None,
        }
    }
}

impl From<Term> for Payload {
    fn from(term: Term) -> Self {
        Payload::Data(term)
    }
}

impl From<StandaloneFun> for Payload {
    fn from(fun: StandaloneFun) -> Self {
        Payload::Sproc(fun)
    }
}

/// One tree node. Children are kept in an ordered, structurally-shared map
/// so sibling iteration is deterministic and snapshots are cheap clones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    payload: Payload,
    payload_version: u64,
    child_list_version: u64,
    children: OrdMap<NodeId, Node>,
}

impl Default for Node {
    fn default() -> Self {
        Node::new(Payload::None)
    }
}

impl Node {
    fn new(payload: Payload) -> Self {
        Node {
            payload,
            payload_version: 1,
            child_list_version: 1,
            children: OrdMap::new(),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_version(&self) -> u64 {
        self.payload_version
    }

    pub fn child_list_version(&self) -> u64 {
        self.child_list_version
    }

    pub fn child_count(&self) -> u64 {
        self.children.len() as u64
    }

    pub fn child(&self, id: &NodeId) -> Option<&Node> {
        self.children.get(id)
    }

    /// Children in identifier order.
    pub fn children(&self) -> impl Iterator<Item = (&NodeId, &Node)> {
        self.children.iter()
    }

    pub fn facts(&self) -> NodeFacts<'_> {
        NodeFacts {
            data: self.payload.data(),
            is_sproc: self.payload.is_sproc(),
            payload_version: self.payload_version,
            child_list_version: self.child_list_version,
            child_count: self.child_count(),
        }
    }

    /// Projects this node's properties through a filter.
    pub fn props(&self, filter: &PropFilter) -> NodeProps {
        let mut props = NodeProps::default();
        if filter.wants_payload() {
            props.data = self.payload.data().cloned();
            props.sproc = self.payload.sproc().cloned();
            props.has_payload = Some(self.payload.has_payload());
            props.has_data = Some(self.payload.has_data());
            props.is_sproc = Some(self.payload.is_sproc());
        }
        if filter.contains(PropName::HasData) {
            props.has_data = Some(self.payload.has_data());
        }
        if filter.contains(PropName::IsSproc) {
            props.is_sproc = Some(self.payload.is_sproc());
        }
        if filter.contains(PropName::PayloadVersion) {
            props.payload_version = Some(self.payload_version);
        }
        if filter.contains(PropName::ChildListVersion) {
            props.child_list_version = Some(self.child_list_version);
        }
        if filter.contains(PropName::ChildListLength) {
            props.child_list_length = Some(self.child_count());
        }
        if filter.contains(PropName::ChildNames) {
            props.child_names = Some(self.children.keys().cloned().collect());
        }
        props
    }

    pub fn full_props(&self) -> NodeProps {
        self.props(&PropFilter::all())
    }
}

/// Outcome of a payload write, with the before/after properties the state
/// machine turns into a change event.
#[derive(Debug, Clone)]
pub struct AppliedWrite {
    pub path: Path,
    pub created: bool,
    pub old: Option<NodeProps>,
    pub new: NodeProps,
    /// Paths of intermediate nodes created along the way, shallow first.
    pub created_parents: Vec<Path>,
}

/// The in-memory hierarchical node store. All mutation goes through the
/// state machine; the tree itself only enforces the version-bump rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    root: Node,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn get(&self, path: &Path) -> Option<&Node> {
        let mut node = &self.root;
        for id in path {
            node = node.child(id)?;
        }
        Some(node)
    }

    /// Writes `payload` at `path`, creating the node and any missing
    /// intermediates (with `Payload::None`) when `create_missing_parents`
    /// is set. The payload version bumps on every write, including writes
    /// of an identical payload; parent child-list versions bump only when
    /// a direct child appears.
    pub fn insert(
        &mut self,
        path: &Path,
        payload: Payload,
        create_missing_parents: bool,
    ) -> Result<AppliedWrite, ArborError> {
        if path.is_root() {
            return Err(ArborError::DeniedUpdate { path: Path::root() });
        }

        let mut created_parents = Vec::new();
        let mut node = &mut self.root;
        let ids = path.ids();
        for (depth, id) in ids[..ids.len() - 1].iter().enumerate() {
            if !node.children.contains_key(id) {
                if !create_missing_parents {
                    return Err(ArborError::NodeNotFound {
                        path: Path::new(ids[..=depth].to_vec()),
                    });
                }
                node.children.insert(id.clone(), Node::new(Payload::None));
                node.child_list_version += 1;
                created_parents.push(Path::new(ids[..=depth].to_vec()));
            }
            node = node.children.get_mut(id).expect("child just ensured");
        }

        let last = ids.last().expect("non-root path has a last id");
        let (created, old) = if node.children.contains_key(last) {
            let child = node.children.get_mut(last).expect("presence just checked");
            let old = child.full_props();
            child.payload = payload;
            child.payload_version += 1;
            (false, Some(old))
        } else {
            node.children.insert(last.clone(), Node::new(payload));
            node.child_list_version += 1;
            (true, None)
        };
        let new = node
            .children
            .get(last)
            .expect("target just written")
            .full_props();
        Ok(AppliedWrite {
            path: path.clone(),
            created,
            old,
            new,
            created_parents,
        })
    }

    /// Clears the payload at `path` without touching children. The payload
    /// version still bumps.
    pub fn clear_payload(&mut self, path: &Path) -> Result<AppliedWrite, ArborError> {
        if path.is_root() {
            return Err(ArborError::DeniedUpdate { path: Path::root() });
        }
        let Some(node) = self.get_mut(path) else {
            return Err(ArborError::NodeNotFound { path: path.clone() });
        };
        let old = node.full_props();
        node.payload = Payload::None;
        node.payload_version += 1;
        let new = node.full_props();
        Ok(AppliedWrite {
            path: path.clone(),
            created: false,
            old: Some(old),
            new,
            created_parents: Vec::new(),
        })
    }

    /// Removes the node at `path` and its whole subtree. Returns the
    /// removed nodes deepest-first (each node after its descendants,
    /// siblings in identifier order), or an empty list when the node was
    /// already absent. Removing the root is denied.
    pub fn remove(&mut self, path: &Path) -> Result<Vec<(Path, NodeProps)>, ArborError> {
        let Some(last) = path.last() else {
            return Err(ArborError::DeniedUpdate { path: Path::root() });
        };
        let parent_path = path.parent().expect("non-root path has a parent");
        let Some(parent) = self.get_mut(&parent_path) else {
            return Ok(Vec::new());
        };
        let Some(removed) = parent.children.remove(last) else {
            return Ok(Vec::new());
        };
        parent.child_list_version += 1;

        let mut out = Vec::new();
        collect_removed(path.clone(), &removed, &mut out);
        Ok(out)
    }

    fn get_mut(&mut self, path: &Path) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for id in path {
            node = node.children.get_mut(id)?;
        }
        Some(node)
    }
}

fn collect_removed(path: Path, node: &Node, out: &mut Vec<(Path, NodeProps)>) {
    for (id, child) in node.children() {
        collect_removed(path.child(id.clone()), child, out);
    }
    out.push((path, node.full_props()));
}

#[cfg(test)]
mod tests {
    use super::{Payload, Tree};
    use crate::error::ArborError;
    use crate::path::Path;
    use crate::term::Term;

    #[test]
    fn insert_creates_missing_intermediates_with_empty_payload() {
        let mut tree = Tree::new();
        let path = Path::from_strs(&["stock", "wood", "oak"]);
        let write = tree
            .insert(&path, Payload::Data(Term::from(80)), true)
            .expect("insert");
        assert!(write.created);
        assert_eq!(
            write.created_parents,
            vec![Path::from_strs(&["stock"]), Path::from_strs(&["stock", "wood"])]
        );

        let wood = tree.get(&Path::from_strs(&["stock", "wood"])).expect("wood");
        assert!(wood.payload().is_none());
        assert_eq!(wood.payload_version(), 1);
        assert_eq!(wood.child_list_version(), 1);

        let oak = tree.get(&path).expect("oak");
        assert_eq!(oak.payload().data(), Some(&Term::from(80)));
    }

    #[test]
    fn insert_without_create_missing_reports_first_absent_parent() {
        let mut tree = Tree::new();
        let err = tree
            .insert(
                &Path::from_strs(&["stock", "wood", "oak"]),
                Payload::Data(Term::from(1)),
                false,
            )
            .expect_err("missing parents");
        assert_eq!(
            err,
            ArborError::NodeNotFound {
                path: Path::from_strs(&["stock"])
            }
        );
    }

    #[test]
    fn payload_writes_always_bump_the_version() {
        let mut tree = Tree::new();
        let path = Path::from_strs(&["stock"]);
        tree.insert(&path, Payload::Data(Term::from(1)), true)
            .expect("first");
        tree.insert(&path, Payload::Data(Term::from(1)), true)
            .expect("identical rewrite");
        let node = tree.get(&path).expect("node");
        assert_eq!(node.payload_version(), 2);
    }

    #[test]
    fn child_list_version_bumps_only_on_direct_child_changes() {
        let mut tree = Tree::new();
        tree.insert(&Path::from_strs(&["a", "b"]), Payload::Data(Term::from(1)), true)
            .expect("insert");
        let root_v = tree.root().child_list_version();

        // Payload update of an existing grandchild: no child-list bumps.
        tree.insert(&Path::from_strs(&["a", "b"]), Payload::Data(Term::from(2)), true)
            .expect("update");
        assert_eq!(tree.root().child_list_version(), root_v);
        let a = tree.get(&Path::from_strs(&["a"])).expect("a");
        assert_eq!(a.child_list_version(), 2);

        // New grandchild bumps only its direct parent.
        tree.insert(&Path::from_strs(&["a", "c"]), Payload::Data(Term::from(3)), true)
            .expect("sibling");
        assert_eq!(tree.root().child_list_version(), root_v);
        let a = tree.get(&Path::from_strs(&["a"])).expect("a");
        assert_eq!(a.child_list_version(), 3);
    }

    #[test]
    fn remove_reports_descendants_before_the_node() {
        let mut tree = Tree::new();
        for leaf in ["oak", "pine"] {
            tree.insert(
                &Path::from_strs(&["stock", "wood", leaf]),
                Payload::Data(Term::from(1)),
                true,
            )
            .expect("insert");
        }
        let removed = tree
            .remove(&Path::from_strs(&["stock", "wood"]))
            .expect("remove");
        let paths: Vec<String> = removed.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec!["/stock/wood/oak", "/stock/wood/pine", "/stock/wood"]
        );

        // Second removal is a no-op.
        assert!(tree
            .remove(&Path::from_strs(&["stock", "wood"]))
            .expect("noop")
            .is_empty());
    }

    #[test]
    fn recreated_node_restarts_at_version_one() {
        let mut tree = Tree::new();
        let path = Path::from_strs(&["stock"]);
        tree.insert(&path, Payload::Data(Term::from(1)), true)
            .expect("insert");
        tree.insert(&path, Payload::Data(Term::from(2)), true)
            .expect("update");
        tree.remove(&path).expect("remove");
        tree.insert(&path, Payload::Data(Term::from(3)), true)
            .expect("recreate");
        assert_eq!(tree.get(&path).expect("node").payload_version(), 1);
    }

    #[test]
    fn root_mutations_are_denied() {
        let mut tree = Tree::new();
        assert!(matches!(
            tree.insert(&Path::root(), Payload::Data(Term::from(1)), true),
            Err(ArborError::DeniedUpdate { .. })
        ));
        assert!(matches!(
            tree.remove(&Path::root()),
            Err(ArborError::DeniedUpdate { .. })
        ));
    }
}
