//! Standalone functions: relocatable handles to native handlers.
//!
//! Replicated state only carries `{name, arity}`; the bodies live in the
//! process-local [`FunRegistry`] and must be registered identically on
//! every node before the store starts applying commands. Handlers invoked
//! during command application (read-write transactions) must be
//! deterministic.

use crate::error::ArborError;
use crate::path::Path;
use crate::term::Term;
use crate::tree::props::NodeProps;
use crate::tx::Tx;
use crate::view::ViewTable;
use compact_str::CompactString;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A relocatable function handle stored as a node payload or referenced by
/// triggers, projections and transactions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StandaloneFun {
    name: CompactString,
    arity: u8,
}

impl StandaloneFun {
    pub fn new(name: impl Into<CompactString>, arity: u8) -> Self {
        StandaloneFun {
            name: name.into(),
            arity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> u8 {
        self.arity
    }
}

impl fmt::Display for StandaloneFun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.arity)
    }
}

/// Declared access class of a registered transaction function. `Auto`
/// transaction classification resolves through this declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxAccess {
    ReadOnly,
    ReadWrite,
}

pub type SprocHandler = Arc<dyn Fn(Term) -> Result<Term, ArborError> + Send + Sync>;
pub type SimpleProjectionHandler =
    Arc<dyn Fn(&Path, &Term) -> Result<(Term, Term), ArborError> + Send + Sync>;
pub type ExtendedProjectionHandler = Arc<
    dyn Fn(&mut ViewTable, &Path, Option<&NodeProps>, Option<&NodeProps>) -> Result<(), ArborError>
        + Send
        + Sync,
>;
pub type TxHandler = Arc<dyn Fn(&mut Tx<'_>) -> Result<Term, ArborError> + Send + Sync>;

#[derive(Clone)]
pub enum FunEntry {
    /// Stored procedure taking the single argument map. Arity 1.
    Sproc(SprocHandler),
    /// Simple projection `(path, new_payload) -> (key, value)`. Arity 2.
    ProjectSimple(SimpleProjectionHandler),
    /// Extended projection `(view, path, old, new)`. Arity 4.
    ProjectExtended(ExtendedProjectionHandler),
    /// Transaction function over a tx context. Arity 0.
    Tx {
        access: TxAccess,
        handler: TxHandler,
    },
}

impl FunEntry {
    pub fn arity(&self) -> u8 {
        match self {
            FunEntry::Tx { .. } => 0,
            FunEntry::Sproc(_) => 1,
            FunEntry::ProjectSimple(_) => 2,
            FunEntry::ProjectExtended(_) => 4,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FunEntry::Sproc(_) => "sproc",
            FunEntry::ProjectSimple(_) => "simple projection",
            FunEntry::ProjectExtended(_) => "extended projection",
            FunEntry::Tx { .. } => "transaction",
        }
    }
}

impl fmt::Debug for FunEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunEntry({}/{})", self.kind(), self.arity())
    }
}

/// Process-local registry of native function bodies.
#[derive(Default, Clone)]
pub struct FunRegistry {
    inner: Arc<RwLock<HashMap<CompactString, FunEntry>>>,
}

impl FunRegistry {
    pub fn new() -> Self {
        FunRegistry::default()
    }

    pub fn register_sproc(
        &self,
        name: impl Into<CompactString>,
        handler: impl Fn(Term) -> Result<Term, ArborError> + Send + Sync + 'static,
    ) -> StandaloneFun {
        let name = name.into();
        self.inner
            .write()
            .insert(name.clone(), FunEntry::Sproc(Arc::new(handler)));
        StandaloneFun::new(name, 1)
    }

    pub fn register_simple_projection(
        &self,
        name: impl Into<CompactString>,
        handler: impl Fn(&Path, &Term) -> Result<(Term, Term), ArborError> + Send + Sync + 'static,
    ) -> StandaloneFun {
        let name = name.into();
        self.inner
            .write()
            .insert(name.clone(), FunEntry::ProjectSimple(Arc::new(handler)));
        StandaloneFun::new(name, 2)
    }

    pub fn register_extended_projection(
        &self,
        name: impl Into<CompactString>,
        handler: impl Fn(&mut ViewTable, &Path, Option<&NodeProps>, Option<&NodeProps>) -> Result<(), ArborError>
            + Send
            + Sync
            + 'static,
    ) -> StandaloneFun {
        let name = name.into();
        self.inner
            .write()
            .insert(name.clone(), FunEntry::ProjectExtended(Arc::new(handler)));
        StandaloneFun::new(name, 4)
    }

    pub fn register_tx(
        &self,
        name: impl Into<CompactString>,
        access: TxAccess,
        handler: impl Fn(&mut Tx<'_>) -> Result<Term, ArborError> + Send + Sync + 'static,
    ) -> StandaloneFun {
        let name = name.into();
        self.inner.write().insert(
            name.clone(),
            FunEntry::Tx {
                access,
                handler: Arc::new(handler),
            },
        );
        StandaloneFun::new(name, 0)
    }

    pub fn get(&self, name: &str) -> Option<FunEntry> {
        self.inner.read().get(name).cloned()
    }

    /// Looks up the entry for a handle, checking the arity recorded in the
    /// handle against the registered body.
    pub fn resolve(&self, fun: &StandaloneFun) -> Result<FunEntry, ArborError> {
        match self.get(fun.name()) {
            Some(entry) if entry.arity() == fun.arity() => Ok(entry),
            _ => Err(ArborError::FunctionClause {
                name: fun.name().to_string(),
                arity: fun.arity(),
            }),
        }
    }
}

impl fmt::Debug for FunRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<CompactString> = self.inner.read().keys().cloned().collect();
        f.debug_struct("FunRegistry").field("names", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{FunEntry, FunRegistry, StandaloneFun};
    use crate::error::ArborError;
    use crate::term::Term;

    #[test]
    fn resolve_checks_name_and_arity() {
        let registry = FunRegistry::new();
        let handle = registry.register_sproc("echo", Ok);
        assert_eq!(handle, StandaloneFun::new("echo", 1));
        assert!(matches!(
            registry.resolve(&handle),
            Ok(FunEntry::Sproc(_))
        ));

        let wrong_arity = StandaloneFun::new("echo", 2);
        assert!(matches!(
            registry.resolve(&wrong_arity),
            Err(ArborError::FunctionClause { arity: 2, .. })
        ));
        let missing = StandaloneFun::new("nope", 1);
        assert!(registry.resolve(&missing).is_err());
    }

    #[test]
    fn sproc_handlers_receive_the_args_map() {
        let registry = FunRegistry::new();
        let handle = registry.register_sproc("pick", |args| {
            args.as_int()
                .map(Term::from)
                .ok_or_else(|| ArborError::Validation("expected int".into()))
        });
        let FunEntry::Sproc(handler) = registry.resolve(&handle).expect("entry") else {
            panic!("expected sproc entry");
        };
        assert_eq!(handler(Term::from(7)), Ok(Term::from(7)));
    }
}
