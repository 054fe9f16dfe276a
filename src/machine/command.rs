use crate::keepwhile::KeepWhile;
use crate::machine::event::EventAction;
use crate::path::pattern::PathPattern;
use crate::path::Path;
use crate::sproc::{StandaloneFun, TxAccess};
use crate::term::{Term, TermPattern};
use crate::tree::props::{NodeProps, PropFilter};
use crate::tree::Payload;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Options replicated with a write command. Log-level options (timeout,
/// async correlation, favor) never enter the command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Lifetime dependencies installed atomically with the mutation, with
    /// the written path as the watcher.
    #[serde(default)]
    pub keep_while: KeepWhile,
    /// Properties projected into the reply.
    pub props: PropFilter,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            keep_while: KeepWhile::new(),
            props: PropFilter::default(),
        }
    }
}

/// Selects the change events a trigger reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    pub pattern: PathPattern,
    pub on_actions: BTreeSet<EventAction>,
    pub priority: i8,
}

impl EventFilter {
    pub fn new(pattern: PathPattern) -> Self {
        EventFilter {
            pattern,
            on_actions: [EventAction::Create, EventAction::Update, EventAction::Delete].into(),
            priority: 0,
        }
    }

    pub fn on_actions<I: IntoIterator<Item = EventAction>>(mut self, actions: I) -> Self {
        self.on_actions = actions.into_iter().collect();
        self
    }

    pub fn priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn selects(&self, path: &Path, action: EventAction) -> bool {
        self.on_actions.contains(&action) && self.pattern.matches_path(path)
    }
}

/// Backing table shape of a projection view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewType {
    Set,
    Bag,
}

/// Recognized projection options. Anything else is rejected with
/// `UnexpectedOption` rather than passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionOptions {
    pub view_type: ViewType,
    pub read_concurrency: bool,
    pub write_concurrency: bool,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        ProjectionOptions {
            view_type: ViewType::Set,
            read_concurrency: false,
            write_concurrency: false,
        }
    }
}

impl ProjectionOptions {
    /// Parses a dynamic option map, rejecting unknown keys and values.
    pub fn from_map(options: &BTreeMap<String, Term>) -> Result<Self, crate::error::ArborError> {
        let mut parsed = ProjectionOptions::default();
        for (key, value) in options {
            let unexpected = || crate::error::ArborError::UnexpectedOption {
                option: key.clone(),
                value: format!("{value:?}"),
            };
            match key.as_str() {
                "type" => {
                    parsed.view_type = match value.as_str() {
                        Some("set") => ViewType::Set,
                        Some("bag") => ViewType::Bag,
                        _ => {
                            return Err(crate::error::ArborError::UnexpectedOption {
                                option: key.clone(),
                                value: value
                                    .as_str()
                                    .map(str::to_string)
                                    .unwrap_or_else(|| format!("{value:?}")),
                            });
                        }
                    };
                }
                "read_concurrency" => match value {
                    Term::Bool(flag) => parsed.read_concurrency = *flag,
                    _ => return Err(unexpected()),
                },
                "write_concurrency" => match value {
                    Term::Bool(flag) => parsed.write_concurrency = *flag,
                    _ => return Err(unexpected()),
                },
                _ => return Err(unexpected()),
            }
        }
        Ok(parsed)
    }
}

/// A projection registration: the function handle plus its view options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSpec {
    pub fun: StandaloneFun,
    pub options: ProjectionOptions,
}

/// The replicated command set. Applying a command is a deterministic
/// function of `(state, command)`; every replica computes the same new
/// state, reply and emitted events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Put {
        pattern: PathPattern,
        payload: Payload,
        options: WriteOptions,
    },
    PutMany {
        pattern: PathPattern,
        payload: Payload,
        options: WriteOptions,
    },
    Create {
        pattern: PathPattern,
        payload: Payload,
        options: WriteOptions,
    },
    Update {
        pattern: PathPattern,
        payload: Payload,
        options: WriteOptions,
    },
    CompareAndSwap {
        pattern: PathPattern,
        expected: TermPattern,
        payload: Payload,
        options: WriteOptions,
    },
    Delete {
        pattern: PathPattern,
        options: WriteOptions,
    },
    DeleteMany {
        pattern: PathPattern,
        options: WriteOptions,
    },
    DeletePayload {
        pattern: PathPattern,
        options: WriteOptions,
    },
    RegisterTrigger {
        id: CompactString,
        filter: EventFilter,
        sproc_path: Path,
    },
    RegisterProjection {
        name: CompactString,
        pattern: PathPattern,
        spec: ProjectionSpec,
    },
    UnregisterProjection {
        name: CompactString,
    },
    RunTransaction {
        fun: StandaloneFun,
        mode: TxAccess,
    },
    /// Consumes entries from the emitted-triggers queue once the leader
    /// has handed them to their stored procedures.
    AckTriggered {
        ids: Vec<u64>,
    },
}

impl Command {
    /// True for commands that demand a single target and therefore a
    /// specific pattern.
    pub fn requires_specific_pattern(&self) -> bool {
        matches!(
            self,
            Command::Put { .. }
                | Command::Create { .. }
                | Command::Update { .. }
                | Command::CompareAndSwap { .. }
                | Command::Delete { .. }
                | Command::DeletePayload { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Put { .. } => "put",
            Command::PutMany { .. } => "put_many",
            Command::Create { .. } => "create",
            Command::Update { .. } => "update",
            Command::CompareAndSwap { .. } => "compare_and_swap",
            Command::Delete { .. } => "delete",
            Command::DeleteMany { .. } => "delete_many",
            Command::DeletePayload { .. } => "delete_payload",
            Command::RegisterTrigger { .. } => "register_trigger",
            Command::RegisterProjection { .. } => "register_projection",
            Command::UnregisterProjection { .. } => "unregister_projection",
            Command::RunTransaction { .. } => "run_transaction",
            Command::AckTriggered { .. } => "ack_triggered",
        }
    }
}

/// Reply shapes: minimal, single-node, many-node, or a transaction value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    Node { path: Path, props: NodeProps },
    Nodes(BTreeMap<Path, NodeProps>),
    Value(Term),
}

impl Reply {
    pub fn node(self) -> Option<(Path, NodeProps)> {
        match self {
            Reply::Node { path, props } => Some((path, props)),
            _ => None,
        }
    }

    pub fn nodes(self) -> BTreeMap<Path, NodeProps> {
        match self {
            Reply::Nodes(nodes) => nodes,
            Reply::Node { path, props } => [(path, props)].into(),
            _ => BTreeMap::new(),
        }
    }

    pub fn value(self) -> Option<Term> {
        match self {
            Reply::Value(term) => Some(term),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, EventFilter, ProjectionOptions, ViewType, WriteOptions};
    use crate::error::ArborError;
    use crate::machine::event::EventAction;
    use crate::path::pattern::PathPattern;
    use crate::path::Path;
    use crate::term::Term;
    use crate::tree::Payload;
    use std::collections::BTreeMap;

    #[test]
    fn commands_roundtrip_through_the_wire_codec() {
        let command = Command::Put {
            pattern: PathPattern::from_path(&Path::from_strs(&["stock", "oak"])),
            payload: Payload::Data(Term::from(80)),
            options: WriteOptions::default(),
        };
        let bytes = rmp_serde::to_vec(&command).expect("encode");
        let decoded: Command = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(command, decoded);
    }

    #[test]
    fn single_target_commands_require_specific_patterns() {
        let pattern = PathPattern::from_path(&Path::from_strs(&["a"]));
        let put = Command::Put {
            pattern: pattern.clone(),
            payload: Payload::None,
            options: WriteOptions::default(),
        };
        let many = Command::DeleteMany {
            pattern,
            options: WriteOptions::default(),
        };
        assert!(put.requires_specific_pattern());
        assert!(!many.requires_specific_pattern());
    }

    #[test]
    fn event_filter_selects_on_pattern_and_action() {
        let filter = EventFilter::new(PathPattern::from_path(&Path::from_strs(&["stock"])))
            .on_actions([EventAction::Create]);
        assert!(filter.selects(&Path::from_strs(&["stock"]), EventAction::Create));
        assert!(!filter.selects(&Path::from_strs(&["stock"]), EventAction::Delete));
        assert!(!filter.selects(&Path::from_strs(&["prices"]), EventAction::Create));
    }

    #[test]
    fn projection_options_reject_unknown_values() {
        let mut options = BTreeMap::new();
        options.insert("type".to_string(), Term::from("ordered_bag"));
        let err = ProjectionOptions::from_map(&options).expect_err("unknown view type");
        assert!(matches!(
            err,
            ArborError::UnexpectedOption { ref option, ref value }
                if option == "type" && value == "ordered_bag"
        ));

        let mut options = BTreeMap::new();
        options.insert("type".to_string(), Term::from("bag"));
        options.insert("read_concurrency".to_string(), Term::Bool(true));
        let parsed = ProjectionOptions::from_map(&options).expect("valid");
        assert_eq!(parsed.view_type, ViewType::Bag);
        assert!(parsed.read_concurrency);

        let mut options = BTreeMap::new();
        options.insert("compressed".to_string(), Term::Bool(true));
        assert!(ProjectionOptions::from_map(&options).is_err());
    }
}
