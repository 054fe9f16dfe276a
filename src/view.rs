//! Process-local view tables backing projections.
//!
//! View tables are node-local caches: they are created at projection
//! registration, written only by the dispatcher, and dropped at
//! unregistration or store shutdown. They are never part of replicated
//! state.

use crate::machine::command::ViewType;
use crate::term::Term;
use compact_str::CompactString;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// One projection's materialized rows. A `set` table holds one value per
/// key; a `bag` table holds a set of rows per key.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewTable {
    Set(BTreeMap<Term, Term>),
    Bag(BTreeMap<Term, BTreeSet<Term>>),
}

impl ViewTable {
    pub fn new(view_type: ViewType) -> Self {
        match view_type {
            ViewType::Set => ViewTable::Set(BTreeMap::new()),
            ViewType::Bag => ViewTable::Bag(BTreeMap::new()),
        }
    }

    pub fn view_type(&self) -> ViewType {
        match self {
            ViewTable::Set(_) => ViewType::Set,
            ViewTable::Bag(_) => ViewType::Bag,
        }
    }

    pub fn insert(&mut self, key: Term, value: Term) {
        match self {
            ViewTable::Set(map) => {
                map.insert(key, value);
            }
            ViewTable::Bag(map) => {
                map.entry(key).or_default().insert(value);
            }
        }
    }

    /// Removes every row under `key`.
    pub fn delete_key(&mut self, key: &Term) {
        match self {
            ViewTable::Set(map) => {
                map.remove(key);
            }
            ViewTable::Bag(map) => {
                map.remove(key);
            }
        }
    }

    /// Removes one `(key, value)` row from a bag; for a set, removes the
    /// key only when the stored value matches.
    pub fn delete_row(&mut self, key: &Term, value: &Term) {
        match self {
            ViewTable::Set(map) => {
                if map.get(key) == Some(value) {
                    map.remove(key);
                }
            }
            ViewTable::Bag(map) => {
                if let Some(rows) = map.get_mut(key) {
                    rows.remove(value);
                    if rows.is_empty() {
                        map.remove(key);
                    }
                }
            }
        }
    }

    /// The single value under `key` in a set table; for bags, the first
    /// row in term order.
    pub fn get(&self, key: &Term) -> Option<&Term> {
        match self {
            ViewTable::Set(map) => map.get(key),
            ViewTable::Bag(map) => map.get(key).and_then(|rows| rows.iter().next()),
        }
    }

    pub fn get_rows(&self, key: &Term) -> Vec<Term> {
        match self {
            ViewTable::Set(map) => map.get(key).cloned().into_iter().collect(),
            ViewTable::Bag(map) => map
                .get(key)
                .map(|rows| rows.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// All rows in key order.
    pub fn rows(&self) -> Vec<(Term, Term)> {
        match self {
            ViewTable::Set(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ViewTable::Bag(map) => map
                .iter()
                .flat_map(|(k, rows)| rows.iter().map(move |v| (k.clone(), v.clone())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ViewTable::Set(map) => map.len(),
            ViewTable::Bag(map) => map.values().map(|rows| rows.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Named view tables for the whole store process.
#[derive(Debug, Default, Clone)]
pub struct ViewStore {
    inner: Arc<RwLock<HashMap<CompactString, ViewTable>>>,
}

impl ViewStore {
    pub fn new() -> Self {
        ViewStore::default()
    }

    /// Creates (or resets) the table for a projection.
    pub fn create(&self, name: &str, view_type: ViewType) {
        self.inner
            .write()
            .insert(name.into(), ViewTable::new(view_type));
    }

    pub fn drop_table(&self, name: &str) {
        self.inner.write().remove(name);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Runs `f` over the named table, if registered.
    pub fn with_table<R>(&self, name: &str, f: impl FnOnce(&mut ViewTable) -> R) -> Option<R> {
        self.inner.write().get_mut(name).map(f)
    }

    pub fn get(&self, name: &str, key: &Term) -> Option<Term> {
        self.inner.read().get(name)?.get(key).cloned()
    }

    pub fn get_rows(&self, name: &str, key: &Term) -> Vec<Term> {
        self.inner
            .read()
            .get(name)
            .map(|table| table.get_rows(key))
            .unwrap_or_default()
    }

    pub fn rows(&self, name: &str) -> Option<Vec<(Term, Term)>> {
        self.inner.read().get(name).map(|table| table.rows())
    }

    pub fn len(&self, name: &str) -> usize {
        self.inner
            .read()
            .get(name)
            .map(|table| table.len())
            .unwrap_or(0)
    }

    /// Drops every table; called at store shutdown.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{ViewStore, ViewTable};
    use crate::machine::command::ViewType;
    use crate::term::Term;

    #[test]
    fn set_tables_keep_one_value_per_key() {
        let mut table = ViewTable::new(ViewType::Set);
        table.insert(Term::from("oak"), Term::from(80));
        table.insert(Term::from("oak"), Term::from(60));
        assert_eq!(table.get(&Term::from("oak")), Some(&Term::from(60)));
        assert_eq!(table.len(), 1);
        table.delete_key(&Term::from("oak"));
        assert!(table.is_empty());
    }

    #[test]
    fn bag_tables_accumulate_rows_per_key() {
        let mut table = ViewTable::new(ViewType::Bag);
        for value in ["a", "b", "c"] {
            table.insert(Term::from("p"), Term::from(value));
        }
        assert_eq!(table.len(), 3);
        table.delete_row(&Term::from("p"), &Term::from("b"));
        assert_eq!(
            table.get_rows(&Term::from("p")),
            vec![Term::from("a"), Term::from("c")]
        );
        table.delete_key(&Term::from("p"));
        assert!(table.is_empty());
    }

    #[test]
    fn store_drops_tables_on_clear() {
        let store = ViewStore::new();
        store.create("by_species", ViewType::Set);
        store.with_table("by_species", |table| {
            table.insert(Term::from("oak"), Term::from(80));
        });
        assert_eq!(store.len("by_species"), 1);
        store.clear();
        assert!(!store.exists("by_species"));
    }
}
