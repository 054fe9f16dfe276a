//! Transaction evaluation.
//!
//! A transaction function runs against one coherent view of the tree.
//! Read-only transactions evaluate outside consensus on a snapshot clone;
//! read-write transactions evaluate inside command application, where
//! every replica recomputes them identically. The `Tx` context exposes the
//! tree primitives; in read-only mode every mutating primitive fails with
//! `StoreUpdateDenied` before touching anything.

use crate::error::ArborError;
use crate::machine::event::ChangeEvent;
use crate::machine::{delete_tree, write_tree};
use crate::path::pattern::{Condition, IntoPattern, PathPattern};
use crate::path::Path;
use crate::term::{Term, TermPattern};
use crate::tree::props::{NodeProps, PropFilter};
use crate::tree::{Payload, Tree};
use crate::walker::{walk, WalkOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Requested evaluation mode for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
    /// Resolve through the registered function's declared access class;
    /// fails with `UnanalyzableTxFun` when nothing is declared.
    Auto,
}

/// Builds the abort error a transaction function returns to roll back
/// with an application-chosen reason.
pub fn abort(reason: impl Into<Term>) -> ArborError {
    ArborError::Abort {
        reason: reason.into(),
    }
}

/// The transaction's view of the tree.
pub struct Tx<'a> {
    tree: &'a mut Tree,
    read_only: bool,
    events: Vec<ChangeEvent>,
}

impl<'a> Tx<'a> {
    pub(crate) fn read_write(tree: &'a mut Tree) -> Self {
        Tx {
            tree,
            read_only: false,
            events: Vec::new(),
        }
    }

    pub(crate) fn read_only(tree: &'a mut Tree) -> Self {
        Tx {
            tree,
            read_only: true,
            events: Vec::new(),
        }
    }

    pub(crate) fn take_events(self) -> Vec<ChangeEvent> {
        self.events
    }

    fn ensure_writable(&self, operation: &str) -> Result<(), ArborError> {
        if self.read_only {
            return Err(ArborError::StoreUpdateDenied {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn write(
        &mut self,
        operation: &str,
        pattern: impl IntoPattern,
        payload: Payload,
        extra: Vec<Condition>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.ensure_writable(operation)?;
        let combined = pattern.into_pattern()?.combine(extra);
        combined.validate_depth()?;
        if combined.is_empty() {
            return Err(ArborError::DeniedUpdate { path: Path::root() });
        }
        let (write, events) = write_tree(self.tree, &combined, payload)?;
        self.events.extend(events);
        Ok((write.path, write.new))
    }

    pub fn put(
        &mut self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.write("put", pattern, Payload::Data(data.into()), Vec::new())
    }

    pub fn put_payload(
        &mut self,
        pattern: impl IntoPattern,
        payload: Payload,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.write("put", pattern, payload, Vec::new())
    }

    pub fn create(
        &mut self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.write(
            "create",
            pattern,
            Payload::Data(data.into()),
            vec![Condition::Exists(false)],
        )
    }

    pub fn update(
        &mut self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.write(
            "update",
            pattern,
            Payload::Data(data.into()),
            vec![Condition::Exists(true)],
        )
    }

    pub fn compare_and_swap(
        &mut self,
        pattern: impl IntoPattern,
        expected: TermPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.write(
            "compare_and_swap",
            pattern,
            Payload::Data(data.into()),
            vec![Condition::DataMatches(expected)],
        )
    }

    pub fn delete(
        &mut self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        self.ensure_writable("delete")?;
        let pattern = pattern.into_pattern()?;
        pattern.validate_depth()?;
        let (deleted, events) = delete_tree(self.tree, &pattern)?;
        self.events.extend(events);
        Ok(deleted.into_iter().collect())
    }

    pub fn delete_payload(
        &mut self,
        pattern: impl IntoPattern,
    ) -> Result<(), ArborError> {
        self.ensure_writable("delete_payload")?;
        let pattern = pattern.into_pattern()?;
        let matches = self.matches(&pattern, PropFilter::none())?;
        let Some((path, _)) = matches.into_iter().next() else {
            return Ok(());
        };
        let write = self.tree.clear_payload(&path)?;
        self.events.push(ChangeEvent::updated(
            write.path.clone(),
            write.old.clone().unwrap_or_default(),
            write.new.clone(),
        ));
        Ok(())
    }

    pub fn get(&self, pattern: impl IntoPattern) -> Result<(Path, NodeProps), ArborError> {
        let pattern = pattern.into_pattern()?;
        let options = WalkOptions {
            props: PropFilter::all(),
            ..WalkOptions::default()
        };
        let mut matches = walk(self.tree, &pattern, &options)?;
        match matches.len() {
            0 => Err(ArborError::NodeNotFound {
                path: pattern.target_path().unwrap_or_default(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(ArborError::NotSpecific {
                pattern: Box::new(pattern),
            }),
        }
    }

    pub fn get_many(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        let pattern = pattern.into_pattern()?;
        Ok(self.matches(&pattern, PropFilter::all())?.into_iter().collect())
    }

    pub fn exists(&self, pattern: impl IntoPattern) -> Result<bool, ArborError> {
        let pattern = pattern.into_pattern()?;
        Ok(!self.matches(&pattern, PropFilter::none())?.is_empty())
    }

    pub fn has_data(&self, pattern: impl IntoPattern) -> Result<bool, ArborError> {
        let pattern = pattern.into_pattern()?;
        let matches = self.matches(&pattern, PropFilter::all())?;
        Ok(matches.first().map(|(_, props)| props.has_data()).unwrap_or(false))
    }

    pub fn count(&self, pattern: impl IntoPattern) -> Result<u64, ArborError> {
        let pattern = pattern.into_pattern()?;
        Ok(self.matches(&pattern, PropFilter::none())?.len() as u64)
    }

    fn matches(
        &self,
        pattern: &PathPattern,
        props: PropFilter,
    ) -> Result<Vec<(Path, NodeProps)>, ArborError> {
        let options = WalkOptions {
            strict_missing: false,
            props,
            ..WalkOptions::default()
        };
        walk(self.tree, pattern, &options)
    }
}

#[cfg(test)]
mod tests {
    use super::{abort, Tx};
    use crate::error::ArborError;
    use crate::term::Term;
    use crate::tree::{Payload, Tree};

    fn seeded_tree() -> Tree {
        let mut tree = Tree::new();
        tree.insert(
            &crate::path::Path::from_strs(&["stock", "oak"]),
            Payload::Data(Term::from(80)),
            true,
        )
        .expect("seed");
        tree
    }

    #[test]
    fn read_only_denies_every_mutating_primitive() {
        let mut tree = seeded_tree();
        let mut tx = Tx::read_only(&mut tree);
        assert!(matches!(
            tx.put("/stock/oak", 60),
            Err(ArborError::StoreUpdateDenied { ref operation }) if operation == "put"
        ));
        assert!(matches!(
            tx.delete("/stock/oak"),
            Err(ArborError::StoreUpdateDenied { .. })
        ));
        // Reads still work, and nothing changed.
        assert_eq!(
            tx.get("/stock/oak").expect("get").1.data,
            Some(Term::from(80))
        );
        assert_eq!(tx.count("/stock/*").expect("count"), 1);
    }

    #[test]
    fn read_write_accumulates_events() {
        let mut tree = seeded_tree();
        let mut tx = Tx::read_write(&mut tree);
        tx.put("/stock/pine", 30).expect("put");
        tx.delete("/stock/oak").expect("delete");
        let events = tx.take_events();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn abort_carries_the_reason_term() {
        let err = abort("insufficient stock");
        assert!(matches!(
            err,
            ArborError::Abort { ref reason } if reason == &Term::from("insufficient stock")
        ));
    }

    #[test]
    fn get_on_missing_node_reports_not_found() {
        let mut tree = seeded_tree();
        let tx = Tx::read_write(&mut tree);
        assert!(matches!(
            tx.get("/stock/ash"),
            Err(ArborError::NodeNotFound { .. })
        ));
        assert!(!tx.exists("/stock/ash").expect("exists"));
    }
}
