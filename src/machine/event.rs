use crate::path::parse::render_path;
use crate::path::Path;
use crate::term::Term;
use crate::tree::props::NodeProps;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Create => "create",
            EventAction::Update => "update",
            EventAction::Delete => "delete",
        }
    }
}

/// One tree change, in command order. `old_props` is absent on `create`,
/// `new_props` on `delete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: Path,
    pub action: EventAction,
    pub old_props: Option<NodeProps>,
    pub new_props: Option<NodeProps>,
}

impl ChangeEvent {
    pub fn created(path: Path, new_props: NodeProps) -> Self {
        ChangeEvent {
            path,
            action: EventAction::Create,
            old_props: None,
            new_props: Some(new_props),
        }
    }

    pub fn updated(path: Path, old_props: NodeProps, new_props: NodeProps) -> Self {
        ChangeEvent {
            path,
            action: EventAction::Update,
            old_props: Some(old_props),
            new_props: Some(new_props),
        }
    }

    pub fn deleted(path: Path, old_props: NodeProps) -> Self {
        ChangeEvent {
            path,
            action: EventAction::Delete,
            old_props: Some(old_props),
            new_props: None,
        }
    }

    /// The single argument map handed to trigger stored procedures.
    pub fn to_args_map(&self, trigger_id: &str) -> Term {
        let path = render_path(&self.path).unwrap_or_else(|| self.path.to_string());
        Term::map([
            ("path", Term::from(path)),
            ("on_action", Term::from(self.action.as_str())),
            ("trigger_id", Term::from(trigger_id)),
        ])
    }
}
