//! Trigger and projection dispatch.
//!
//! The dispatcher runs after every applied command, outside the replicated
//! state: it fans each change event out to the projections whose pattern
//! matches, and on the leader it drains the emitted-triggers queue through
//! the referenced stored procedures. A failing projection or trigger
//! function is logged with its identifying context and never aborts the
//! mutation that produced the event.

use crate::machine::event::{ChangeEvent, EventAction};
use crate::machine::{ApplyOutcome, MachineState, ProjectionDef, TriggeredEvent};
use crate::path::Path;
use crate::sproc::{FunEntry, FunRegistry};
use crate::term::Term;
use crate::view::ViewStore;
use compact_str::CompactString;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub(crate) struct DispatcherTelemetry {
    pub events_dispatched: AtomicU64,
    pub projection_failures: AtomicU64,
    pub triggers_fired: AtomicU64,
    pub trigger_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherMetrics {
    pub events_dispatched: u64,
    pub projection_failures: u64,
    pub triggers_fired: u64,
    pub trigger_failures: u64,
}

pub struct Dispatcher {
    registry: FunRegistry,
    views: ViewStore,
    /// Last view key written per path, per simple projection, so deletes
    /// and key changes can retract the right entry.
    simple_keys: HashMap<CompactString, BTreeMap<Path, Term>>,
    telemetry: Arc<DispatcherTelemetry>,
}

impl Dispatcher {
    pub fn new(registry: FunRegistry, views: ViewStore) -> Self {
        Dispatcher {
            registry,
            views,
            simple_keys: HashMap::new(),
            telemetry: Arc::new(DispatcherTelemetry::default()),
        }
    }

    pub(crate) fn telemetry(&self) -> Arc<DispatcherTelemetry> {
        Arc::clone(&self.telemetry)
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        DispatcherMetrics {
            events_dispatched: self.telemetry.events_dispatched.load(Ordering::Relaxed),
            projection_failures: self.telemetry.projection_failures.load(Ordering::Relaxed),
            triggers_fired: self.telemetry.triggers_fired.load(Ordering::Relaxed),
            trigger_failures: self.telemetry.trigger_failures.load(Ordering::Relaxed),
        }
    }

    /// Processes one command's outcome. Returns the ids of emitted-trigger
    /// entries that were handed to their stored procedures and should be
    /// acknowledged through the log.
    pub fn dispatch(
        &mut self,
        state: &MachineState,
        outcome: &ApplyOutcome,
        leader: bool,
    ) -> Vec<u64> {
        if let Some(name) = &outcome.unregistered {
            self.views.drop_table(name);
            self.simple_keys.remove(name);
        }

        if let Some((name, replay)) = &outcome.replay {
            if let Some(def) = state.projections().get(name) {
                self.views.create(name, def.spec.options.view_type);
                self.simple_keys.insert(name.clone(), BTreeMap::new());
                for event in replay {
                    self.apply_projection(def, event);
                }
            }
        }

        for event in &outcome.events {
            self.telemetry
                .events_dispatched
                .fetch_add(1, Ordering::Relaxed);
            for def in state.projections().values() {
                if def.pattern.matches_path(&event.path) {
                    self.apply_projection(def, event);
                }
            }
        }

        if leader {
            self.fire_pending(state)
        } else {
            Vec::new()
        }
    }

    /// Hands every queued emitted trigger to its stored procedure.
    /// Delivery is at-least-once: entries are only removed once the ack
    /// command commits, so a crash or leader change re-fires them.
    pub fn fire_pending(&self, state: &MachineState) -> Vec<u64> {
        let mut acked = Vec::new();
        for entry in state.emitted_triggers() {
            self.fire_trigger(state, entry);
            acked.push(entry.id);
        }
        acked
    }

    fn fire_trigger(&self, state: &MachineState, entry: &TriggeredEvent) {
        self.telemetry.triggers_fired.fetch_add(1, Ordering::Relaxed);
        let Some(node) = state.tree().get(&entry.sproc_path) else {
            self.telemetry
                .trigger_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                trigger = %entry.trigger_id,
                sproc_path = %entry.sproc_path,
                "trigger stored procedure node is missing"
            );
            return;
        };
        let Some(fun) = node.payload().sproc() else {
            self.telemetry
                .trigger_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                trigger = %entry.trigger_id,
                sproc_path = %entry.sproc_path,
                "trigger target is not a stored procedure"
            );
            return;
        };
        let handler = match self.registry.resolve(fun) {
            Ok(FunEntry::Sproc(handler)) => handler,
            other => {
                self.telemetry
                    .trigger_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    trigger = %entry.trigger_id,
                    sproc = %fun,
                    "trigger stored procedure cannot be resolved: {other:?}"
                );
                return;
            }
        };
        let args = entry.event.to_args_map(&entry.trigger_id);
        match catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(Ok(result)) => {
                debug!(trigger = %entry.trigger_id, ?result, "trigger fired");
            }
            Ok(Err(err)) => {
                self.telemetry
                    .trigger_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    trigger = %entry.trigger_id,
                    event = ?entry.event,
                    reason = %err,
                    "trigger stored procedure failed"
                );
            }
            Err(_) => {
                self.telemetry
                    .trigger_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    trigger = %entry.trigger_id,
                    event = ?entry.event,
                    "trigger stored procedure panicked"
                );
            }
        }
    }

    fn apply_projection(&mut self, def: &ProjectionDef, event: &ChangeEvent) {
        // Stored-procedure payloads are skipped entirely: projections only
        // react to data payloads.
        let touches_sproc = event
            .new_props
            .as_ref()
            .map(|props| props.is_sproc())
            .or_else(|| event.old_props.as_ref().map(|props| props.is_sproc()))
            .unwrap_or(false);
        if touches_sproc {
            return;
        }

        let result = match self.registry.resolve(&def.spec.fun) {
            Ok(FunEntry::ProjectSimple(handler)) => self.apply_simple(def, event, &handler),
            Ok(FunEntry::ProjectExtended(handler)) => self.apply_extended(def, event, &handler),
            Ok(_) | Err(_) => Err(crate::error::ArborError::FunctionClause {
                name: def.spec.fun.name().to_string(),
                arity: def.spec.fun.arity(),
            }),
        };
        if let Err(err) = result {
            self.telemetry
                .projection_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(
                projection = %def.name,
                event = ?event,
                reason = %err,
                "projection function failed; the mutation is still applied"
            );
        }
    }

    fn apply_simple(
        &mut self,
        def: &ProjectionDef,
        event: &ChangeEvent,
        handler: &crate::sproc::SimpleProjectionHandler,
    ) -> Result<(), crate::error::ArborError> {
        let keys = self.simple_keys.entry(def.name.clone()).or_default();
        match event.action {
            EventAction::Create | EventAction::Update => {
                let Some(data) = event.new_props.as_ref().and_then(|props| props.data()) else {
                    // Payload-less nodes leave no view entry; retract any
                    // row from a previous data payload.
                    if let Some(old_key) = keys.remove(&event.path) {
                        self.views
                            .with_table(&def.name, |table| table.delete_key(&old_key));
                    }
                    return Ok(());
                };
                let (key, value) =
                    match catch_unwind(AssertUnwindSafe(|| handler(&event.path, data))) {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(crate::error::ArborError::Exception {
                                kind: "panic".to_string(),
                                value: Term::from("projection function panicked"),
                                trace: Vec::new(),
                            });
                        }
                    };
                if let Some(old_key) = keys.insert(event.path.clone(), key.clone()) {
                    if old_key != key {
                        self.views
                            .with_table(&def.name, |table| table.delete_key(&old_key));
                    }
                }
                self.views
                    .with_table(&def.name, |table| table.insert(key, value));
                Ok(())
            }
            EventAction::Delete => {
                if let Some(key) = keys.remove(&event.path) {
                    self.views
                        .with_table(&def.name, |table| table.delete_key(&key));
                }
                Ok(())
            }
        }
    }

    fn apply_extended(
        &mut self,
        def: &ProjectionDef,
        event: &ChangeEvent,
        handler: &crate::sproc::ExtendedProjectionHandler,
    ) -> Result<(), crate::error::ArborError> {
        let outcome = self.views.with_table(&def.name, |table| {
            catch_unwind(AssertUnwindSafe(|| {
                handler(
                    table,
                    &event.path,
                    event.old_props.as_ref(),
                    event.new_props.as_ref(),
                )
            }))
        });
        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(crate::error::ArborError::Exception {
                kind: "panic".to_string(),
                value: Term::from("projection function panicked"),
                trace: Vec::new(),
            }),
            None => Err(crate::error::ArborError::Validation(format!(
                "view table '{}' is not registered",
                def.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use crate::machine::command::{Command, ProjectionOptions, ProjectionSpec, WriteOptions};
    use crate::machine::StateMachine;
    use crate::path::pattern::{Condition, PathPattern};
    use crate::path::Path;
    use crate::sproc::FunRegistry;
    use crate::term::Term;
    use crate::tree::Payload;
    use crate::view::ViewStore;

    fn wildcard(parts: &[&str]) -> PathPattern {
        let mut pattern = PathPattern::from_path(&Path::from_strs(parts));
        pattern.push(Condition::AnyName);
        pattern
    }

    #[test]
    fn simple_projection_follows_create_update_delete() {
        let registry = FunRegistry::new();
        let views = ViewStore::new();
        let fun = registry.register_simple_projection("mirror", |path, value| {
            Ok((Term::from(path.to_string()), value.clone()))
        });
        let mut machine = StateMachine::new(registry.clone());
        let mut dispatcher = Dispatcher::new(registry, views.clone());

        let outcome = machine.apply(
            1,
            Command::RegisterProjection {
                name: "mirror".into(),
                pattern: wildcard(&["stock", "wood"]),
                spec: ProjectionSpec {
                    fun,
                    options: ProjectionOptions::default(),
                },
            },
        );
        dispatcher.dispatch(machine.state(), &outcome, true);
        assert!(views.exists("mirror"));

        let put = |machine: &mut StateMachine, value: i64| {
            machine.apply(
                machine.state().applied_index() + 1,
                Command::Put {
                    pattern: PathPattern::from_path(&Path::from_strs(&["stock", "wood", "oak"])),
                    payload: Payload::Data(Term::from(value)),
                    options: WriteOptions::default(),
                },
            )
        };

        let outcome = put(&mut machine, 80);
        dispatcher.dispatch(machine.state(), &outcome, true);
        assert_eq!(
            views.get("mirror", &Term::from("/stock/wood/oak")),
            Some(Term::from(80))
        );

        let outcome = put(&mut machine, 60);
        dispatcher.dispatch(machine.state(), &outcome, true);
        assert_eq!(
            views.get("mirror", &Term::from("/stock/wood/oak")),
            Some(Term::from(60))
        );

        let outcome = machine.apply(
            machine.state().applied_index() + 1,
            Command::Delete {
                pattern: PathPattern::from_path(&Path::from_strs(&["stock", "wood", "oak"])),
                options: WriteOptions::default(),
            },
        );
        dispatcher.dispatch(machine.state(), &outcome, true);
        assert_eq!(views.get("mirror", &Term::from("/stock/wood/oak")), None);
        assert_eq!(views.len("mirror"), 0);
    }

    #[test]
    fn projection_failures_do_not_block_later_events() {
        let registry = FunRegistry::new();
        let views = ViewStore::new();
        let fun = registry.register_simple_projection("picky", |path, value| {
            if value.as_int().is_none() {
                return Err(crate::error::ArborError::FunctionClause {
                    name: "picky".to_string(),
                    arity: 2,
                });
            }
            Ok((Term::from(path.to_string()), value.clone()))
        });
        let mut machine = StateMachine::new(registry.clone());
        let mut dispatcher = Dispatcher::new(registry, views.clone());

        let outcome = machine.apply(
            1,
            Command::RegisterProjection {
                name: "picky".into(),
                pattern: wildcard(&["stock"]),
                spec: ProjectionSpec {
                    fun,
                    options: ProjectionOptions::default(),
                },
            },
        );
        dispatcher.dispatch(machine.state(), &outcome, true);

        let outcome = machine.apply(
            2,
            Command::Put {
                pattern: PathPattern::from_path(&Path::from_strs(&["stock", "bad"])),
                payload: Payload::Data(Term::from("not a number")),
                options: WriteOptions::default(),
            },
        );
        dispatcher.dispatch(machine.state(), &outcome, true);
        assert_eq!(views.len("picky"), 0);
        assert_eq!(dispatcher.metrics().projection_failures, 1);

        let outcome = machine.apply(
            3,
            Command::Put {
                pattern: PathPattern::from_path(&Path::from_strs(&["stock", "good"])),
                payload: Payload::Data(Term::from(5)),
                options: WriteOptions::default(),
            },
        );
        dispatcher.dispatch(machine.state(), &outcome, true);
        assert_eq!(views.len("picky"), 1);
    }

    #[test]
    fn triggers_fire_on_the_leader_only() {
        let registry = FunRegistry::new();
        let views = ViewStore::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let fired_in_sproc = std::sync::Arc::clone(&fired);
        let sproc = registry.register_sproc("counter", move |_| {
            fired_in_sproc.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Term::Unit)
        });
        let mut machine = StateMachine::new(registry.clone());
        let mut dispatcher = Dispatcher::new(registry, views);

        machine.apply(
            1,
            Command::Put {
                pattern: PathPattern::from_path(&Path::from_strs(&["procs", "counter"])),
                payload: Payload::Sproc(sproc),
                options: WriteOptions::default(),
            },
        );
        machine.apply(
            2,
            Command::RegisterTrigger {
                id: "count_stock".into(),
                filter: crate::machine::command::EventFilter::new(wildcard(&["stock"])),
                sproc_path: Path::from_strs(&["procs", "counter"]),
            },
        );

        let outcome = machine.apply(
            3,
            Command::Put {
                pattern: PathPattern::from_path(&Path::from_strs(&["stock", "oak"])),
                payload: Payload::Data(Term::from(80)),
                options: WriteOptions::default(),
            },
        );

        // A follower dispatches projections but never fires triggers.
        let acked = dispatcher.dispatch(machine.state(), &outcome, false);
        assert!(acked.is_empty());
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);

        // The leader drains the queue and acks.
        let acked = dispatcher.fire_pending(machine.state());
        assert_eq!(acked.len(), 1);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        machine.apply(4, Command::AckTriggered { ids: acked });
        assert!(machine.state().emitted_triggers().is_empty());
    }
}
