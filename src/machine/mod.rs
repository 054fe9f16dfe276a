//! The deterministic state machine.
//!
//! `apply` is a pure function of `(state, command)`: it resolves patterns
//! through the walker, mutates the tree, keeps the keep-while graph in
//! lock-step, selects triggers into the emitted queue, and returns the
//! reply plus the ordered change events. Mutations run against
//! structurally-shared clones of the tree and graph, so a failing command
//! leaves no partial state behind and observers always see commands whole.

pub mod command;
pub mod event;

use crate::error::ArborError;
use crate::keepwhile::KeepWhileGraph;
use crate::machine::command::{Command, EventFilter, ProjectionSpec, Reply, WriteOptions};
use crate::machine::event::ChangeEvent;
use crate::path::pattern::{Condition, PathPattern};
use crate::path::{NodeId, Path};
use crate::sproc::{FunEntry, FunRegistry, StandaloneFun, TxAccess};
use crate::term::Term;
use crate::tree::props::{NodeProps, PropFilter};
use crate::tree::{AppliedWrite, Payload, Tree};
use crate::tx::Tx;
use crate::walker::{check_target, walk, WalkOptions};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub id: CompactString,
    pub filter: EventFilter,
    pub sproc_path: Path,
    /// Registration order, the tiebreak after priority.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionDef {
    pub name: CompactString,
    pub pattern: PathPattern,
    pub spec: ProjectionSpec,
    pub seq: u64,
}

/// An entry in the emitted-triggers queue, waiting for the leader to run
/// the stored procedure and acknowledge. Delivery is at-least-once: on
/// leader change an unacknowledged entry fires again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredEvent {
    pub id: u64,
    pub trigger_id: CompactString,
    pub sproc_path: Path,
    pub priority: i8,
    pub event: ChangeEvent,
}

/// The replicated machine state. Everything here is serde-serializable and
/// structurally comparable, so snapshots and determinism checks fall out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    tree: Tree,
    keep_while: KeepWhileGraph,
    triggers: BTreeMap<CompactString, TriggerDef>,
    projections: BTreeMap<CompactString, ProjectionDef>,
    emitted_triggers: Vec<TriggeredEvent>,
    applied_index: u64,
    next_triggered_id: u64,
    next_registration_seq: u64,
}

impl MachineState {
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn keep_while(&self) -> &KeepWhileGraph {
        &self.keep_while
    }

    pub fn projections(&self) -> &BTreeMap<CompactString, ProjectionDef> {
        &self.projections
    }

    pub fn triggers(&self) -> &BTreeMap<CompactString, TriggerDef> {
        &self.triggers
    }

    pub fn emitted_triggers(&self) -> &[TriggeredEvent] {
        &self.emitted_triggers
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }
}

/// What one command application produced, beyond the new state.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub reply: Result<Reply, ArborError>,
    /// Ordered change events for the dispatcher (projections).
    pub events: Vec<ChangeEvent>,
    /// Synthetic create events replaying the current matching subtree into
    /// a freshly registered projection.
    pub replay: Option<(CompactString, Vec<ChangeEvent>)>,
    /// A projection whose view table should be dropped.
    pub unregistered: Option<CompactString>,
    /// Entries newly appended to the emitted-triggers queue.
    pub triggered: Vec<TriggeredEvent>,
}

impl ApplyOutcome {
    fn reply(reply: Result<Reply, ArborError>) -> Self {
        ApplyOutcome {
            reply,
            events: Vec::new(),
            replay: None,
            unregistered: None,
            triggered: Vec::new(),
        }
    }
}

pub struct StateMachine {
    state: MachineState,
    registry: FunRegistry,
}

impl StateMachine {
    pub fn new(registry: FunRegistry) -> Self {
        StateMachine {
            state: MachineState::default(),
            registry,
        }
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn registry(&self) -> &FunRegistry {
        &self.registry
    }

    /// Serializes the full replicated state for the Log's snapshot path.
    pub fn snapshot(&self) -> Result<Vec<u8>, ArborError> {
        rmp_serde::to_vec(&self.state).map_err(|e| ArborError::Encode(e.to_string()))
    }

    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), ArborError> {
        self.state = rmp_serde::from_slice(bytes).map_err(|e| ArborError::Decode(e.to_string()))?;
        Ok(())
    }

    /// Applies one committed command at `index`.
    pub fn apply(&mut self, index: u64, command: Command) -> ApplyOutcome {
        self.state.applied_index = index;
        let mut outcome = match command {
            Command::Put {
                pattern,
                payload,
                options,
            } => self.apply_write(pattern, payload, &options, Vec::new()),
            Command::Create {
                pattern,
                payload,
                options,
            } => self.apply_write(pattern, payload, &options, vec![Condition::Exists(false)]),
            Command::Update {
                pattern,
                payload,
                options,
            } => self.apply_write(pattern, payload, &options, vec![Condition::Exists(true)]),
            Command::CompareAndSwap {
                pattern,
                expected,
                payload,
                options,
            } => self.apply_write(
                pattern,
                payload,
                &options,
                vec![Condition::DataMatches(expected)],
            ),
            Command::PutMany {
                pattern,
                payload,
                options,
            } => self.apply_put_many(pattern, payload, &options),
            Command::Delete { pattern, options }
            | Command::DeleteMany { pattern, options } => self.apply_delete(pattern, &options),
            Command::DeletePayload { pattern, options } => {
                self.apply_delete_payload(pattern, &options)
            }
            Command::RegisterTrigger {
                id,
                filter,
                sproc_path,
            } => self.apply_register_trigger(id, filter, sproc_path),
            Command::RegisterProjection {
                name,
                pattern,
                spec,
            } => self.apply_register_projection(name, pattern, spec),
            Command::UnregisterProjection { name } => {
                let unregistered = self.state.projections.remove(&name).map(|def| def.name);
                let mut outcome = ApplyOutcome::reply(Ok(Reply::Ok));
                outcome.unregistered = unregistered;
                outcome
            }
            Command::RunTransaction { fun, mode } => self.apply_transaction(fun, mode),
            Command::AckTriggered { ids } => {
                self.state
                    .emitted_triggers
                    .retain(|entry| !ids.contains(&entry.id));
                ApplyOutcome::reply(Ok(Reply::Ok))
            }
        };
        if !outcome.events.is_empty() {
            outcome.triggered = self.enqueue_triggers(&outcome.events);
        }
        outcome
    }

    fn apply_write(
        &mut self,
        pattern: PathPattern,
        payload: Payload,
        options: &WriteOptions,
        extra: Vec<Condition>,
    ) -> ApplyOutcome {
        match self.try_write(pattern, payload, options, extra) {
            Ok((reply, events)) => {
                let mut outcome = ApplyOutcome::reply(Ok(reply));
                outcome.events = events;
                outcome
            }
            Err(err) => ApplyOutcome::reply(Err(err)),
        }
    }

    fn try_write(
        &mut self,
        pattern: PathPattern,
        payload: Payload,
        options: &WriteOptions,
        extra: Vec<Condition>,
    ) -> Result<(Reply, Vec<ChangeEvent>), ArborError> {
        let combined = pattern.combine(extra);
        combined.validate_depth()?;
        if combined.is_empty() {
            return Err(ArborError::DeniedUpdate { path: Path::root() });
        }
        for condition in options.keep_while.values() {
            condition.validate_depth()?;
        }

        let mut tree = self.state.tree.clone();
        let mut graph = self.state.keep_while.clone();
        let (write, mut events) = write_tree(&mut tree, &combined, payload)?;

        let mut recheck = BTreeSet::new();
        if !options.keep_while.is_empty() {
            graph.set(write.path.clone(), options.keep_while.clone());
            recheck.insert(write.path.clone());
        }

        let mut changed: BTreeSet<Path> = BTreeSet::new();
        changed.insert(write.path.clone());
        for parent in &write.created_parents {
            changed.insert(parent.clone());
        }
        for path in changed.clone() {
            if let Some(parent) = path.parent() {
                changed.insert(parent);
            }
        }
        cascade(&mut tree, &mut graph, changed, recheck, &mut events);

        let props = tree
            .get(&write.path)
            .map(|node| node.props(&options.props))
            .unwrap_or_default();
        self.state.tree = tree;
        self.state.keep_while = graph;
        Ok((
            Reply::Node {
                path: write.path,
                props,
            },
            events,
        ))
    }

    fn apply_put_many(
        &mut self,
        pattern: PathPattern,
        payload: Payload,
        options: &WriteOptions,
    ) -> ApplyOutcome {
        let result = (|| {
            pattern.validate_depth()?;
            let walk_options = WalkOptions {
                strict_missing: false,
                props: PropFilter::none(),
                ..WalkOptions::default()
            };
            let matches = walk(&self.state.tree, &pattern, &walk_options)?;

            let mut tree = self.state.tree.clone();
            let mut graph = self.state.keep_while.clone();
            let mut events = Vec::new();
            let mut changed: BTreeSet<Path> = BTreeSet::new();
            let mut recheck = BTreeSet::new();
            let mut replies = BTreeMap::new();
            for (path, _) in matches {
                let write = tree.insert(&path, payload.clone(), true)?;
                events.extend(events_for_write(&tree, &write));
                changed.insert(path.clone());
                if let Some(parent) = path.parent() {
                    changed.insert(parent);
                }
                if !options.keep_while.is_empty() {
                    graph.set(path.clone(), options.keep_while.clone());
                    recheck.insert(path.clone());
                }
                replies.insert(path, write.new);
            }
            cascade(&mut tree, &mut graph, changed, recheck, &mut events);
            self.state.tree = tree;
            self.state.keep_while = graph;
            let replies = replies
                .into_iter()
                .map(|(path, _)| {
                    let props = self
                        .state
                        .tree
                        .get(&path)
                        .map(|node| node.props(&options.props))
                        .unwrap_or_default();
                    (path, props)
                })
                .collect();
            Ok((Reply::Nodes(replies), events))
        })();
        match result {
            Ok((reply, events)) => {
                let mut outcome = ApplyOutcome::reply(Ok(reply));
                outcome.events = events;
                outcome
            }
            Err(err) => ApplyOutcome::reply(Err(err)),
        }
    }

    fn apply_delete(&mut self, pattern: PathPattern, options: &WriteOptions) -> ApplyOutcome {
        let result = (|| {
            pattern.validate_depth()?;
            let mut tree = self.state.tree.clone();
            let mut graph = self.state.keep_while.clone();
            let (deleted, mut events) = delete_tree(&mut tree, &pattern)?;

            let mut changed: BTreeSet<Path> = BTreeSet::new();
            for (path, _) in &deleted {
                graph.remove(path);
                changed.insert(path.clone());
                if let Some(parent) = path.parent() {
                    changed.insert(parent);
                }
            }
            cascade(&mut tree, &mut graph, changed, BTreeSet::new(), &mut events);
            self.state.tree = tree;
            self.state.keep_while = graph;

            let replies = deleted
                .into_iter()
                .map(|(path, props)| (path, filter_props(&props, &options.props)))
                .collect();
            Ok((Reply::Nodes(replies), events))
        })();
        match result {
            Ok((reply, events)) => {
                let mut outcome = ApplyOutcome::reply(Ok(reply));
                outcome.events = events;
                outcome
            }
            Err(err) => ApplyOutcome::reply(Err(err)),
        }
    }

    fn apply_delete_payload(
        &mut self,
        pattern: PathPattern,
        options: &WriteOptions,
    ) -> ApplyOutcome {
        let result = (|| {
            pattern.validate_depth()?;
            let walk_options = WalkOptions {
                strict_missing: false,
                props: PropFilter::none(),
                ..WalkOptions::default()
            };
            let matches = walk(&self.state.tree, &pattern, &walk_options)?;
            let Some((path, _)) = matches.into_iter().next() else {
                return Ok((Reply::Nodes(BTreeMap::new()), Vec::new()));
            };

            let mut tree = self.state.tree.clone();
            let mut graph = self.state.keep_while.clone();
            let write = tree.clear_payload(&path)?;
            let mut events = events_for_write(&tree, &write);

            let mut changed = BTreeSet::new();
            changed.insert(path.clone());
            cascade(&mut tree, &mut graph, changed, BTreeSet::new(), &mut events);

            let props = tree
                .get(&path)
                .map(|node| node.props(&options.props))
                .unwrap_or_default();
            self.state.tree = tree;
            self.state.keep_while = graph;
            Ok((Reply::Node { path, props }, events))
        })();
        match result {
            Ok((reply, events)) => {
                let mut outcome = ApplyOutcome::reply(Ok(reply));
                outcome.events = events;
                outcome
            }
            Err(err) => ApplyOutcome::reply(Err(err)),
        }
    }

    fn apply_register_trigger(
        &mut self,
        id: CompactString,
        filter: EventFilter,
        sproc_path: Path,
    ) -> ApplyOutcome {
        if self.state.triggers.contains_key(&id) {
            return ApplyOutcome::reply(Err(ArborError::Exists {
                name: id.to_string(),
            }));
        }
        if let Err(err) = filter.pattern.validate_depth() {
            return ApplyOutcome::reply(Err(err));
        }
        let seq = self.state.next_registration_seq;
        self.state.next_registration_seq += 1;
        self.state.triggers.insert(
            id.clone(),
            TriggerDef {
                id,
                filter,
                sproc_path,
                seq,
            },
        );
        ApplyOutcome::reply(Ok(Reply::Ok))
    }

    fn apply_register_projection(
        &mut self,
        name: CompactString,
        pattern: PathPattern,
        spec: ProjectionSpec,
    ) -> ApplyOutcome {
        if self.state.projections.contains_key(&name) {
            return ApplyOutcome::reply(Err(ArborError::Exists {
                name: name.to_string(),
            }));
        }
        if let Err(err) = pattern.validate_depth() {
            return ApplyOutcome::reply(Err(err));
        }
        let walk_options = WalkOptions {
            strict_missing: false,
            props: PropFilter::all(),
            ..WalkOptions::default()
        };
        let replay = match walk(&self.state.tree, &pattern, &walk_options) {
            Ok(matches) => matches
                .into_iter()
                .map(|(path, props)| ChangeEvent::created(path, props))
                .collect(),
            Err(err) => return ApplyOutcome::reply(Err(err)),
        };
        let seq = self.state.next_registration_seq;
        self.state.next_registration_seq += 1;
        self.state.projections.insert(
            name.clone(),
            ProjectionDef {
                name: name.clone(),
                pattern,
                spec,
                seq,
            },
        );
        let mut outcome = ApplyOutcome::reply(Ok(Reply::Ok));
        outcome.replay = Some((name, replay));
        outcome
    }

    fn apply_transaction(&mut self, fun: StandaloneFun, mode: TxAccess) -> ApplyOutcome {
        if mode == TxAccess::ReadOnly {
            return ApplyOutcome::reply(Err(ArborError::Validation(
                "read-only transactions never enter the log".into(),
            )));
        }
        let handler = match self.registry.resolve(&fun) {
            Ok(FunEntry::Tx { handler, .. }) => handler,
            Ok(_) => {
                return ApplyOutcome::reply(Err(ArborError::FunctionClause {
                    name: fun.name().to_string(),
                    arity: fun.arity(),
                }));
            }
            Err(err) => return ApplyOutcome::reply(Err(err)),
        };

        let mut tree = self.state.tree.clone();
        let mut tx = Tx::read_write(&mut tree);
        let result = catch_unwind(AssertUnwindSafe(|| handler(&mut tx)));
        let events = tx.take_events();
        match result {
            Ok(Ok(value)) => {
                let mut graph = self.state.keep_while.clone();
                let mut events = events;
                let mut changed: BTreeSet<Path> = BTreeSet::new();
                for event in &events {
                    if event.action == crate::machine::event::EventAction::Delete {
                        graph.remove(&event.path);
                    }
                    changed.insert(event.path.clone());
                    if let Some(parent) = event.path.parent() {
                        changed.insert(parent);
                    }
                }
                cascade(&mut tree, &mut graph, changed, BTreeSet::new(), &mut events);
                self.state.tree = tree;
                self.state.keep_while = graph;
                let mut outcome = ApplyOutcome::reply(Ok(Reply::Value(value)));
                outcome.events = events;
                outcome
            }
            Ok(Err(err)) => ApplyOutcome::reply(Err(err)),
            Err(panic) => ApplyOutcome::reply(Err(panic_to_exception(panic))),
        }
    }

    /// Selects the triggers matching this command's events and appends
    /// them to the emitted queue: priority descending, then registration
    /// order, then event order.
    fn enqueue_triggers(&mut self, events: &[ChangeEvent]) -> Vec<TriggeredEvent> {
        let mut selections: Vec<(i8, u64, usize, CompactString, Path)> = Vec::new();
        for (event_idx, event) in events.iter().enumerate() {
            for trigger in self.state.triggers.values() {
                if trigger.filter.selects(&event.path, event.action) {
                    selections.push((
                        trigger.filter.priority,
                        trigger.seq,
                        event_idx,
                        trigger.id.clone(),
                        trigger.sproc_path.clone(),
                    ));
                }
            }
        }
        selections.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut appended = Vec::new();
        for (priority, _, event_idx, trigger_id, sproc_path) in selections {
            let id = self.state.next_triggered_id;
            self.state.next_triggered_id += 1;
            let entry = TriggeredEvent {
                id,
                trigger_id,
                sproc_path,
                priority,
                event: events[event_idx].clone(),
            };
            self.state.emitted_triggers.push(entry.clone());
            appended.push(entry);
        }
        appended
    }
}

fn panic_to_exception(panic: Box<dyn std::any::Any + Send>) -> ArborError {
    let value = if let Some(message) = panic.downcast_ref::<&str>() {
        Term::from(*message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        Term::from(message.clone())
    } else {
        Term::from("transaction function panicked")
    };
    ArborError::Exception {
        kind: "panic".to_string(),
        value,
        trace: Vec::new(),
    }
}

fn filter_props(full: &NodeProps, filter: &PropFilter) -> NodeProps {
    use crate::tree::props::PropName;
    let mut props = NodeProps::default();
    if filter.wants_payload() {
        props.data = full.data.clone();
        props.sproc = full.sproc.clone();
        props.has_payload = full.has_payload;
        props.has_data = full.has_data;
        props.is_sproc = full.is_sproc;
    }
    if filter.contains(PropName::HasData) {
        props.has_data = full.has_data;
    }
    if filter.contains(PropName::IsSproc) {
        props.is_sproc = full.is_sproc;
    }
    if filter.contains(PropName::PayloadVersion) {
        props.payload_version = full.payload_version;
    }
    if filter.contains(PropName::ChildListVersion) {
        props.child_list_version = full.child_list_version;
    }
    if filter.contains(PropName::ChildListLength) {
        props.child_list_length = full.child_list_length;
    }
    if filter.contains(PropName::ChildNames) {
        props.child_names = full.child_names.clone();
    }
    props
}

/// Resolves a single-target pattern and writes the payload, returning the
/// applied write plus its change events. Shared by command application and
/// the read-write transaction primitives.
pub(crate) fn write_tree(
    tree: &mut Tree,
    pattern: &PathPattern,
    payload: Payload,
) -> Result<(AppliedWrite, Vec<ChangeEvent>), ArborError> {
    let target = check_target(tree, pattern)?;
    let write = tree.insert(&target.path, payload, true)?;
    let events = events_for_write(tree, &write);
    Ok((write, events))
}

/// Deletes every node matched by `pattern` (deepest matches first) and
/// returns the removed nodes plus delete events. Absent targets are a
/// no-op, which makes repeated deletes idempotent.
pub(crate) fn delete_tree(
    tree: &mut Tree,
    pattern: &PathPattern,
) -> Result<(Vec<(Path, NodeProps)>, Vec<ChangeEvent>), ArborError> {
    let walk_options = WalkOptions {
        strict_missing: false,
        props: PropFilter::none(),
        ..WalkOptions::default()
    };
    let matches = walk(tree, pattern, &walk_options)?;
    let mut targets: Vec<Path> = matches.into_iter().map(|(path, _)| path).collect();
    targets.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));

    let mut deleted = Vec::new();
    let mut events = Vec::new();
    for path in targets {
        if path.is_root() || tree.get(&path).is_none() {
            continue;
        }
        for (removed_path, props) in tree.remove(&path)? {
            events.push(ChangeEvent::deleted(removed_path.clone(), props.clone()));
            deleted.push((removed_path, props));
        }
    }
    Ok((deleted, events))
}

fn events_for_write(tree: &Tree, write: &AppliedWrite) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for parent in &write.created_parents {
        if let Some(node) = tree.get(parent) {
            events.push(ChangeEvent::created(parent.clone(), node.full_props()));
        }
    }
    match (&write.old, write.created) {
        (_, true) => events.push(ChangeEvent::created(write.path.clone(), write.new.clone())),
        (Some(old), false) => events.push(ChangeEvent::updated(
            write.path.clone(),
            old.clone(),
            write.new.clone(),
        )),
        (None, false) => events.push(ChangeEvent::created(write.path.clone(), write.new.clone())),
    }
    events
}

fn watcher_satisfied(tree: &Tree, graph: &KeepWhileGraph, watcher: &Path) -> bool {
    let Some(conds) = graph.conditions(watcher) else {
        return true;
    };
    conds.iter().all(|(watched, condition)| {
        let id = watched
            .last()
            .cloned()
            .unwrap_or_else(|| NodeId::atom(""));
        let node = tree.get(watched);
        let facts = node.map(|n| n.facts());
        condition.is_met(&id, facts.as_ref())
    })
}

/// Re-evaluates watchers affected by the changed paths, deleting the ones
/// whose keep-while conditions no longer hold, until a fixpoint. Watchers
/// are processed in identifier-lexicographic order; each subtree removal
/// reports descendants before the node. The visited set guarantees
/// termination even with keep-while cycles through independent paths.
pub(crate) fn cascade(
    tree: &mut Tree,
    graph: &mut KeepWhileGraph,
    mut changed: BTreeSet<Path>,
    mut recheck: BTreeSet<Path>,
    events: &mut Vec<ChangeEvent>,
) {
    let mut visited: BTreeSet<Path> = BTreeSet::new();
    loop {
        let mut failing: BTreeSet<Path> = BTreeSet::new();
        for path in &changed {
            for watcher in graph.watchers_of(path) {
                if !visited.contains(&watcher) && !watcher_satisfied(tree, graph, &watcher) {
                    failing.insert(watcher);
                }
            }
        }
        for watcher in std::mem::take(&mut recheck) {
            if !visited.contains(&watcher) && !watcher_satisfied(tree, graph, &watcher) {
                failing.insert(watcher);
            }
        }
        changed.clear();
        if failing.is_empty() {
            return;
        }
        for watcher in failing {
            if visited.contains(&watcher) {
                continue;
            }
            visited.insert(watcher.clone());
            let removed = match tree.remove(&watcher) {
                Ok(removed) => removed,
                Err(_) => continue,
            };
            graph.remove_subtree(&watcher);
            for (path, props) in removed {
                visited.insert(path.clone());
                changed.insert(path.clone());
                events.push(ChangeEvent::deleted(path, props));
            }
            if let Some(parent) = watcher.parent() {
                changed.insert(parent);
            }
        }
    }
}
