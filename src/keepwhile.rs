//! Keep-while lifetime dependencies.
//!
//! A watcher path stays alive only while every watched path satisfies its
//! associated condition. The graph stores both directions so the state
//! machine can find the watchers affected by a set of changed paths in one
//! lookup per path. Cascade evaluation itself lives in the state machine,
//! which owns the tree; this module only maintains the edges.

use crate::path::pattern::Condition;
use crate::path::Path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Watched path → condition, installed atomically with a mutation.
pub type KeepWhile = BTreeMap<Path, Condition>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeepWhileGraph {
    watchers: BTreeMap<Path, KeepWhile>,
    watched: BTreeMap<Path, BTreeSet<Path>>,
}

impl KeepWhileGraph {
    pub fn new() -> Self {
        KeepWhileGraph::default()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    /// Installs (or replaces) the conditions keeping `watcher` alive.
    /// Passing an empty map clears the entry.
    pub fn set(&mut self, watcher: Path, conds: KeepWhile) {
        self.remove(&watcher);
        if conds.is_empty() {
            return;
        }
        for watched in conds.keys() {
            self.watched
                .entry(watched.clone())
                .or_default()
                .insert(watcher.clone());
        }
        self.watchers.insert(watcher, conds);
    }

    /// Drops `path` as a watcher, removing its edges in both directions.
    pub fn remove(&mut self, path: &Path) {
        let Some(conds) = self.watchers.remove(path) else {
            return;
        };
        for watched in conds.keys() {
            if let Some(watchers) = self.watched.get_mut(watched) {
                watchers.remove(path);
                if watchers.is_empty() {
                    self.watched.remove(watched);
                }
            }
        }
    }

    /// Drops every watcher at or below `root`, returning the removed
    /// watcher paths. Used when a subtree is deleted.
    pub fn remove_subtree(&mut self, root: &Path) -> Vec<Path> {
        let removed: Vec<Path> = self
            .watchers
            .range(root.clone()..)
            .take_while(|(path, _)| path.starts_with(root))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &removed {
            self.remove(path);
        }
        removed
    }

    /// Watchers holding an edge on exactly `changed`.
    pub fn watchers_of(&self, changed: &Path) -> BTreeSet<Path> {
        self.watched.get(changed).cloned().unwrap_or_default()
    }

    pub fn conditions(&self, watcher: &Path) -> Option<&KeepWhile> {
        self.watchers.get(watcher)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &KeepWhile)> {
        self.watchers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{KeepWhile, KeepWhileGraph};
    use crate::path::pattern::Condition;
    use crate::path::Path;

    fn edge(watched: &[&str], cond: Condition) -> KeepWhile {
        [(Path::from_strs(watched), cond)].into()
    }

    #[test]
    fn set_maintains_both_directions() {
        let mut graph = KeepWhileGraph::new();
        let watcher = Path::from_strs(&["copies", "oak"]);
        graph.set(watcher.clone(), edge(&["stock", "oak"], Condition::Exists(true)));

        let watchers = graph.watchers_of(&Path::from_strs(&["stock", "oak"]));
        assert!(watchers.contains(&watcher));
        assert!(graph.conditions(&watcher).is_some());
    }

    #[test]
    fn replacing_conditions_drops_stale_reverse_edges() {
        let mut graph = KeepWhileGraph::new();
        let watcher = Path::from_strs(&["w"]);
        graph.set(watcher.clone(), edge(&["a"], Condition::Exists(true)));
        graph.set(watcher.clone(), edge(&["b"], Condition::Exists(true)));

        assert!(graph.watchers_of(&Path::from_strs(&["a"])).is_empty());
        assert!(graph
            .watchers_of(&Path::from_strs(&["b"]))
            .contains(&watcher));

        graph.set(watcher.clone(), KeepWhile::new());
        assert!(graph.is_empty());
        assert!(graph.watchers_of(&Path::from_strs(&["b"])).is_empty());
    }

    #[test]
    fn remove_subtree_takes_descendant_watchers() {
        let mut graph = KeepWhileGraph::new();
        for parts in [&["sub", "a"][..], &["sub", "a", "b"], &["subx"]] {
            graph.set(
                Path::from_strs(parts),
                edge(&["stock"], Condition::Exists(true)),
            );
        }
        let removed = graph.remove_subtree(&Path::from_strs(&["sub", "a"]));
        assert_eq!(
            removed,
            vec![
                Path::from_strs(&["sub", "a"]),
                Path::from_strs(&["sub", "a", "b"])
            ]
        );
        // The sibling with a shared prefix string stays.
        assert!(graph.conditions(&Path::from_strs(&["subx"])).is_some());
    }
}
