//! arbordb: a deterministic, path-addressed replicated tree store core.
//!
//! The store keeps a hierarchical key/value tree addressed by paths and
//! path patterns, applies conditional mutations through a serialized
//! command log, cascades deletions along keep-while lifetime
//! dependencies, feeds change events to triggers and materialized-view
//! projections, and evaluates transaction functions atomically.
//!
//! [`ArborInstance`] is the public handle; it must be opened from within a
//! tokio runtime.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod keepwhile;
pub mod log;
pub mod machine;
pub mod path;
pub mod sproc;
pub mod sync_bridge;
pub mod term;
pub mod tree;
pub mod tx;
pub mod view;
pub mod walker;

pub use crate::config::ArborConfig;
pub use crate::error::{ArborError, ArborErrorCode};

use crate::keepwhile::KeepWhile;
use crate::log::{AsyncMode, Favor, LocalLog, LogMetrics};
use crate::machine::command::{
    Command, EventFilter, ProjectionOptions, ProjectionSpec, Reply, ViewType, WriteOptions,
};
use crate::path::pattern::{IntoPattern, PathPattern};
use crate::path::Path;
use crate::sproc::{FunEntry, FunRegistry, StandaloneFun};
use crate::term::{Term, TermPattern};
use crate::tree::props::{NodeProps, PropFilter, PropName};
use crate::tree::{Payload, Tree};
use crate::tx::{Tx, TxMode};
use crate::view::ViewStore;
use crate::walker::{walk, WalkOptions};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::info;

/// Options for the put-family of mutations.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Lifetime dependencies installed atomically with the write.
    pub keep_while: KeepWhile,
    /// Reply property selection; defaults to the configured filter.
    pub props_to_return: Option<PropFilter>,
    pub timeout: Option<Duration>,
}

/// Options for deletes.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub props_to_return: Option<PropFilter>,
    pub timeout: Option<Duration>,
}

/// Options for queries.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub favor: Favor,
    pub props_to_return: Option<PropFilter>,
    pub include_root_props: bool,
    pub expect_specific_node: bool,
    pub timeout: Option<Duration>,
}

/// One store instance: the public operation layer over the command log.
/// The handle itself is the routing key; clone-free sharing goes through
/// `Arc<ArborInstance>`.
pub struct ArborInstance {
    config: ArborConfig,
    registry: FunRegistry,
    views: ViewStore,
    log: LocalLog,
}

impl ArborInstance {
    /// Opens an in-process store and starts its apply loop. Must be
    /// called from within a tokio runtime.
    pub fn open(config: ArborConfig) -> ArborInstance {
        let registry = FunRegistry::new();
        let views = ViewStore::new();
        let log = LocalLog::spawn(&config, registry.clone(), views.clone());
        info!("arbordb store opened");
        ArborInstance {
            config,
            registry,
            views,
            log,
        }
    }

    /// The process-local registry of native function bodies. Register
    /// every stored procedure, projection and transaction function here
    /// before submitting commands that reference it.
    pub fn registry(&self) -> &FunRegistry {
        &self.registry
    }

    /// The process-local projection view tables.
    pub fn views(&self) -> &ViewStore {
        &self.views
    }

    /// The underlying command log, exposed for leadership control and
    /// snapshot plumbing.
    pub fn log(&self) -> &LocalLog {
        &self.log
    }

    pub fn metrics(&self) -> LogMetrics {
        self.log.metrics()
    }

    /// Closes the ingress, drains the apply loop and drops every view
    /// table.
    pub async fn shutdown(&self) {
        self.log.shutdown().await;
        self.views.clear();
        info!("arbordb store shut down");
    }

    fn command_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.config.command_timeout())
    }

    fn query_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.config.query_timeout())
    }

    fn write_options(&self, options: &PutOptions) -> WriteOptions {
        WriteOptions {
            keep_while: options.keep_while.clone(),
            props: options
                .props_to_return
                .clone()
                .unwrap_or_else(|| self.config.default_props.clone()),
        }
    }

    fn delete_options(&self, options: &DeleteOptions) -> WriteOptions {
        WriteOptions {
            keep_while: KeepWhile::new(),
            props: options
                .props_to_return
                .clone()
                .unwrap_or_else(|| self.config.default_props.clone()),
        }
    }

    fn require_specific(pattern: &PathPattern) -> Result<(), ArborError> {
        if !pattern.is_specific() {
            return Err(ArborError::NotSpecific {
                pattern: Box::new(pattern.clone()),
            });
        }
        Ok(())
    }

    async fn submit_single(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<(Path, NodeProps), ArborError> {
        match self.log.submit_sync(command, timeout).await? {
            Reply::Node { path, props } => Ok((path, props)),
            other => Err(ArborError::Validation(format!(
                "unexpected reply shape: {other:?}"
            ))),
        }
    }

    async fn submit_many(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        Ok(self.log.submit_sync(command, timeout).await?.nodes())
    }

    // ------------------------------------------------------------------
    // Mutations

    pub async fn put(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.put_with(pattern, data, PutOptions::default()).await
    }

    pub async fn put_with(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        options: PutOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.put_payload_with(pattern, Payload::Data(data.into()), options)
            .await
    }

    /// Writes an arbitrary payload, including stored procedures.
    pub async fn put_payload(
        &self,
        pattern: impl IntoPattern,
        payload: impl Into<Payload>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.put_payload_with(pattern, payload, PutOptions::default())
            .await
    }

    pub async fn put_payload_with(
        &self,
        pattern: impl IntoPattern,
        payload: impl Into<Payload>,
        options: PutOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::Put {
            pattern,
            payload: payload.into(),
            options: self.write_options(&options),
        };
        self.submit_single(command, self.command_timeout(options.timeout))
            .await
    }

    /// Writes the payload to every node the pattern currently matches.
    pub async fn put_many(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        self.put_many_with(pattern, data, PutOptions::default()).await
    }

    pub async fn put_many_with(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        options: PutOptions,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        let command = Command::PutMany {
            pattern: pattern.into_pattern()?,
            payload: Payload::Data(data.into()),
            options: self.write_options(&options),
        };
        self.submit_many(command, self.command_timeout(options.timeout))
            .await
    }

    /// Like `put`, but fails with `MismatchingNode` when the node already
    /// exists.
    pub async fn create(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.create_with(pattern, data, PutOptions::default()).await
    }

    pub async fn create_with(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        options: PutOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::Create {
            pattern,
            payload: Payload::Data(data.into()),
            options: self.write_options(&options),
        };
        self.submit_single(command, self.command_timeout(options.timeout))
            .await
    }

    /// Like `put`, but fails with `NodeNotFound` when the node is absent.
    pub async fn update(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.update_with(pattern, data, PutOptions::default()).await
    }

    pub async fn update_with(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        options: PutOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::Update {
            pattern,
            payload: Payload::Data(data.into()),
            options: self.write_options(&options),
        };
        self.submit_single(command, self.command_timeout(options.timeout))
            .await
    }

    /// Writes only when the current data payload matches `expected`.
    pub async fn compare_and_swap(
        &self,
        pattern: impl IntoPattern,
        expected: TermPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.compare_and_swap_with(pattern, expected, data, PutOptions::default())
            .await
    }

    pub async fn compare_and_swap_with(
        &self,
        pattern: impl IntoPattern,
        expected: TermPattern,
        data: impl Into<Term>,
        options: PutOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::CompareAndSwap {
            pattern,
            expected,
            payload: Payload::Data(data.into()),
            options: self.write_options(&options),
        };
        self.submit_single(command, self.command_timeout(options.timeout))
            .await
    }

    /// Deletes the target node and its subtree. Deleting an absent node
    /// is a no-op returning an empty map.
    pub async fn delete(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        self.delete_with(pattern, DeleteOptions::default()).await
    }

    pub async fn delete_with(
        &self,
        pattern: impl IntoPattern,
        options: DeleteOptions,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::Delete {
            pattern,
            options: self.delete_options(&options),
        };
        self.submit_many(command, self.command_timeout(options.timeout))
            .await
    }

    /// Deletes every node the pattern matches.
    pub async fn delete_many(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        self.delete_many_with(pattern, DeleteOptions::default()).await
    }

    pub async fn delete_many_with(
        &self,
        pattern: impl IntoPattern,
        options: DeleteOptions,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        let command = Command::DeleteMany {
            pattern: pattern.into_pattern()?,
            options: self.delete_options(&options),
        };
        self.submit_many(command, self.command_timeout(options.timeout))
            .await
    }

    /// Clears the payload without removing the node or its children.
    pub async fn delete_payload(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<(), ArborError> {
        self.delete_payload_with(pattern, DeleteOptions::default())
            .await
    }

    pub async fn delete_payload_with(
        &self,
        pattern: impl IntoPattern,
        options: DeleteOptions,
    ) -> Result<(), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::DeletePayload {
            pattern,
            options: self.delete_options(&options),
        };
        self.log
            .submit_sync(command, self.command_timeout(options.timeout))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Asynchronous submission

    /// Submits a put without waiting. With a correlation, the reply is
    /// later available through [`ArborInstance::wait_for_async_reply`].
    pub async fn put_async(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        mode: AsyncMode,
    ) -> Result<(), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::Put {
            pattern,
            payload: Payload::Data(data.into()),
            options: self.write_options(&PutOptions::default()),
        };
        self.log.submit_async(command, mode).await
    }

    pub async fn delete_async(
        &self,
        pattern: impl IntoPattern,
        mode: AsyncMode,
    ) -> Result<(), ArborError> {
        let pattern = pattern.into_pattern()?;
        Self::require_specific(&pattern)?;
        let command = Command::Delete {
            pattern,
            options: self.delete_options(&DeleteOptions::default()),
        };
        self.log.submit_async(command, mode).await
    }

    /// Awaits a correlated asynchronous reply, unwrapping error replies
    /// into the synchronous error taxonomy.
    pub async fn wait_for_async_reply(
        &self,
        correlation: u64,
        timeout: Duration,
    ) -> Result<Reply, ArborError> {
        self.log.wait_for_async_reply(correlation, timeout).await
    }

    // ------------------------------------------------------------------
    // Queries

    async fn query_tree(&self, favor: Favor, timeout: Option<Duration>) -> Result<Tree, ArborError> {
        self.log.read_allowed(favor)?;
        if favor == Favor::Consistency {
            self.log.barrier(self.query_timeout(timeout)).await?;
        }
        Ok(self.log.latest().0)
    }

    pub async fn get(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<(Path, NodeProps), ArborError> {
        self.get_with(pattern, GetOptions::default()).await
    }

    pub async fn get_with(
        &self,
        pattern: impl IntoPattern,
        options: GetOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        let pattern = pattern.into_pattern()?;
        let tree = self.query_tree(options.favor, options.timeout).await?;
        let walk_options = WalkOptions {
            expect_specific_node: options.expect_specific_node,
            include_root_props: options.include_root_props,
            props: options
                .props_to_return
                .clone()
                .unwrap_or_else(|| self.config.default_props.clone()),
            strict_missing: true,
        };
        let mut matches = walk(&tree, &pattern, &walk_options)?;
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

    pub async fn get_many(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        self.get_many_with(pattern, GetOptions::default()).await
    }

    pub async fn get_many_with(
        &self,
        pattern: impl IntoPattern,
        options: GetOptions,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        let pattern = pattern.into_pattern()?;
        let tree = self.query_tree(options.favor, options.timeout).await?;
        let walk_options = WalkOptions {
            expect_specific_node: options.expect_specific_node,
            include_root_props: options.include_root_props,
            props: options
                .props_to_return
                .clone()
                .unwrap_or_else(|| self.config.default_props.clone()),
            strict_missing: false,
        };
        Ok(walk(&tree, &pattern, &walk_options)?.into_iter().collect())
    }

    pub async fn exists(&self, pattern: impl IntoPattern) -> Result<bool, ArborError> {
        let matches = self
            .get_many_with(
                pattern,
                GetOptions {
                    props_to_return: Some(PropFilter::none()),
                    ..GetOptions::default()
                },
            )
            .await?;
        Ok(!matches.is_empty())
    }

    pub async fn has_data(&self, pattern: impl IntoPattern) -> Result<bool, ArborError> {
        let matches = self
            .get_many_with(
                pattern,
                GetOptions {
                    props_to_return: Some(PropFilter::new([PropName::HasPayload])),
                    ..GetOptions::default()
                },
            )
            .await?;
        Ok(matches.values().next().map(NodeProps::has_data).unwrap_or(false))
    }

    pub async fn is_sproc(&self, pattern: impl IntoPattern) -> Result<bool, ArborError> {
        let matches = self
            .get_many_with(
                pattern,
                GetOptions {
                    props_to_return: Some(PropFilter::new([PropName::HasPayload])),
                    ..GetOptions::default()
                },
            )
            .await?;
        Ok(matches.values().next().map(NodeProps::is_sproc).unwrap_or(false))
    }

    /// Cardinality of the pattern's match set.
    pub async fn count(&self, pattern: impl IntoPattern) -> Result<u64, ArborError> {
        let matches = self
            .get_many_with(
                pattern,
                GetOptions {
                    props_to_return: Some(PropFilter::none()),
                    ..GetOptions::default()
                },
            )
            .await?;
        Ok(matches.len() as u64)
    }

    /// The data payload at the path, or `default` when the node is absent
    /// or carries no data.
    pub async fn get_or(
        &self,
        pattern: impl IntoPattern,
        default: impl Into<Term>,
    ) -> Result<Term, ArborError> {
        let default = default.into();
        match self.get(pattern).await {
            Ok((_, props)) => Ok(props.data.unwrap_or(default)),
            Err(ArborError::NodeNotFound { .. }) => Ok(default),
            Err(err) => Err(err),
        }
    }

    /// Invokes the stored procedure at the path with a single argument
    /// term, outside consensus.
    pub async fn run_sproc(
        &self,
        pattern: impl IntoPattern,
        args: Term,
    ) -> Result<Term, ArborError> {
        let (path, props) = self
            .get_with(
                pattern,
                GetOptions {
                    props_to_return: Some(PropFilter::all()),
                    ..GetOptions::default()
                },
            )
            .await?;
        let Some(fun) = props.sproc else {
            return Err(ArborError::Validation(format!(
                "node {path} does not hold a stored procedure"
            )));
        };
        let FunEntry::Sproc(handler) = self.registry.resolve(&fun)? else {
            return Err(ArborError::FunctionClause {
                name: fun.name().to_string(),
                arity: fun.arity(),
            });
        };
        match catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(result) => result,
            Err(panic) => Err(panic_exception(panic)),
        }
    }

    // ------------------------------------------------------------------
    // Triggers & projections

    pub async fn register_trigger(
        &self,
        id: &str,
        filter: EventFilter,
        sproc_path: impl IntoPattern,
    ) -> Result<(), ArborError> {
        let sproc_path = sproc_path.into_pattern()?.target_path()?;
        let command = Command::RegisterTrigger {
            id: id.into(),
            filter,
            sproc_path,
        };
        self.log
            .submit_sync(command, self.config.command_timeout())
            .await?;
        Ok(())
    }

    /// Registers a projection. The view table is created and retroactively
    /// populated from the currently matching subtree before this returns.
    pub async fn register_projection(
        &self,
        name: &str,
        pattern: impl IntoPattern,
        fun: &StandaloneFun,
        options: ProjectionOptions,
    ) -> Result<(), ArborError> {
        match self.registry.resolve(fun)? {
            FunEntry::ProjectSimple(_) => {
                // A bag view only makes sense when the projection function
                // itself writes rows.
                if options.view_type == ViewType::Bag {
                    return Err(ArborError::UnexpectedOption {
                        option: "type".to_string(),
                        value: "bag".to_string(),
                    });
                }
            }
            FunEntry::ProjectExtended(_) => {}
            _ => {
                return Err(ArborError::FunctionClause {
                    name: fun.name().to_string(),
                    arity: fun.arity(),
                });
            }
        }
        let command = Command::RegisterProjection {
            name: name.into(),
            pattern: pattern.into_pattern()?,
            spec: ProjectionSpec {
                fun: fun.clone(),
                options,
            },
        };
        self.log
            .submit_sync(command, self.config.command_timeout())
            .await?;
        Ok(())
    }

    pub async fn unregister_projection(&self, name: &str) -> Result<(), ArborError> {
        let command = Command::UnregisterProjection { name: name.into() };
        self.log
            .submit_sync(command, self.config.command_timeout())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions

    /// Runs a registered transaction function. `Auto` resolves the mode
    /// through the function's declared access class and fails with
    /// `UnanalyzableTxFun` when nothing is declared.
    pub async fn transaction(
        &self,
        fun: &StandaloneFun,
        mode: TxMode,
    ) -> Result<Term, ArborError> {
        let access = match mode {
            TxMode::ReadOnly => sproc::TxAccess::ReadOnly,
            TxMode::ReadWrite => sproc::TxAccess::ReadWrite,
            TxMode::Auto => match self.registry.get(fun.name()) {
                Some(FunEntry::Tx { access, .. }) if fun.arity() == 0 => access,
                _ => {
                    return Err(ArborError::UnanalyzableTxFun {
                        name: fun.name().to_string(),
                    });
                }
            },
        };
        match access {
            sproc::TxAccess::ReadOnly => self.run_readonly_fun(fun).await,
            sproc::TxAccess::ReadWrite => {
                let command = Command::RunTransaction {
                    fun: fun.clone(),
                    mode: sproc::TxAccess::ReadWrite,
                };
                let reply = self
                    .log
                    .submit_sync(command, self.config.command_timeout())
                    .await?;
                reply.value().ok_or_else(|| {
                    ArborError::Validation("transaction reply carried no value".to_string())
                })
            }
        }
    }

    async fn run_readonly_fun(&self, fun: &StandaloneFun) -> Result<Term, ArborError> {
        let FunEntry::Tx { handler, .. } = self.registry.resolve(fun)? else {
            return Err(ArborError::FunctionClause {
                name: fun.name().to_string(),
                arity: fun.arity(),
            });
        };
        let (mut tree, _) = self.log.latest();
        let mut tx = Tx::read_only(&mut tree);
        match catch_unwind(AssertUnwindSafe(|| handler(&mut tx))) {
            Ok(result) => result,
            Err(panic) => Err(panic_exception(panic)),
        }
    }

    /// Runs a read-only transaction closure against a consistent snapshot.
    /// Mutating primitives abort with `StoreUpdateDenied`.
    pub async fn transaction_ro<F>(&self, f: F) -> Result<Term, ArborError>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<Term, ArborError>,
    {
        let (mut tree, _) = self.log.latest();
        let mut tx = Tx::read_only(&mut tree);
        match catch_unwind(AssertUnwindSafe(move || f(&mut tx))) {
            Ok(result) => result,
            Err(panic) => Err(panic_exception(panic)),
        }
    }

    // ------------------------------------------------------------------
    // Snapshot plumbing (the Log contract's snapshot/restore path)

    pub async fn snapshot(&self) -> Result<Vec<u8>, ArborError> {
        self.log.snapshot().await
    }

    pub async fn restore(&self, bytes: Vec<u8>) -> Result<(), ArborError> {
        self.log.restore(bytes).await
    }
}

fn panic_exception(panic: Box<dyn std::any::Any + Send>) -> ArborError {
    let value = if let Some(message) = panic.downcast_ref::<&str>() {
        Term::from(*message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        Term::from(message.clone())
    } else {
        Term::from("function panicked")
    };
    ArborError::Exception {
        kind: "panic".to_string(),
        value,
        trace: Vec::new(),
    }
}
