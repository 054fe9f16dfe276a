use crate::path::pattern::{Condition, PathPattern};
use crate::path::Path;
use crate::term::Term;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArborErrorCode {
    NodeNotFound,
    MismatchingNode,
    NotSpecific,
    DeniedUpdate,
    StoreUpdateDenied,
    UnanalyzableTxFun,
    FunctionClause,
    Exists,
    Timeout,
    UnexpectedOption,
    NotLeader,
    NoQuorum,
    Abort,
    Exception,
    Encode,
    Decode,
    Validation,
    Unavailable,
}

impl ArborErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ArborErrorCode::NodeNotFound => "node_not_found",
            ArborErrorCode::MismatchingNode => "mismatching_node",
            ArborErrorCode::NotSpecific => "not_specific",
            ArborErrorCode::DeniedUpdate => "denied_update",
            ArborErrorCode::StoreUpdateDenied => "store_update_denied",
            ArborErrorCode::UnanalyzableTxFun => "unanalyzable_tx_fun",
            ArborErrorCode::FunctionClause => "function_clause",
            ArborErrorCode::Exists => "exists",
            ArborErrorCode::Timeout => "timeout",
            ArborErrorCode::UnexpectedOption => "unexpected_option",
            ArborErrorCode::NotLeader => "not_leader",
            ArborErrorCode::NoQuorum => "no_quorum",
            ArborErrorCode::Abort => "abort",
            ArborErrorCode::Exception => "exception",
            ArborErrorCode::Encode => "encode",
            ArborErrorCode::Decode => "decode",
            ArborErrorCode::Validation => "validation",
            ArborErrorCode::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArborError {
    #[error("node not found: {path}")]
    NodeNotFound { path: Path },
    #[error("node {path} does not satisfy condition {condition}")]
    MismatchingNode {
        path: Path,
        condition: Box<Condition>,
    },
    #[error("pattern {pattern} may match more than one node")]
    NotSpecific { pattern: Box<PathPattern> },
    #[error("update denied on {path}")]
    DeniedUpdate { path: Path },
    #[error("read-only transaction attempted {operation}")]
    StoreUpdateDenied { operation: String },
    #[error("cannot classify transaction function '{name}' as read-only or read-write")]
    UnanalyzableTxFun { name: String },
    #[error("no function clause matching {name}/{arity}")]
    FunctionClause { name: String, arity: u8 },
    #[error("'{name}' is already registered")]
    Exists { name: String },
    #[error("timeout")]
    Timeout,
    #[error("unexpected option {option}={value}")]
    UnexpectedOption { option: String, value: String },
    #[error("this node is not the leader")]
    NotLeader,
    #[error("no quorum reachable")]
    NoQuorum,
    #[error("transaction aborted: {reason:?}")]
    Abort { reason: Term },
    #[error("transaction raised {kind}: {value:?}")]
    Exception {
        kind: String,
        value: Term,
        trace: Vec<String>,
    },
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

impl ArborError {
    pub fn code(&self) -> ArborErrorCode {
        match self {
            ArborError::NodeNotFound { .. } => ArborErrorCode::NodeNotFound,
            ArborError::MismatchingNode { .. } => ArborErrorCode::MismatchingNode,
            ArborError::NotSpecific { .. } => ArborErrorCode::NotSpecific,
            ArborError::DeniedUpdate { .. } => ArborErrorCode::DeniedUpdate,
            ArborError::StoreUpdateDenied { .. } => ArborErrorCode::StoreUpdateDenied,
            ArborError::UnanalyzableTxFun { .. } => ArborErrorCode::UnanalyzableTxFun,
            ArborError::FunctionClause { .. } => ArborErrorCode::FunctionClause,
            ArborError::Exists { .. } => ArborErrorCode::Exists,
            ArborError::Timeout => ArborErrorCode::Timeout,
            ArborError::UnexpectedOption { .. } => ArborErrorCode::UnexpectedOption,
            ArborError::NotLeader => ArborErrorCode::NotLeader,
            ArborError::NoQuorum => ArborErrorCode::NoQuorum,
            ArborError::Abort { .. } => ArborErrorCode::Abort,
            ArborError::Exception { .. } => ArborErrorCode::Exception,
            ArborError::Encode(_) => ArborErrorCode::Encode,
            ArborError::Decode(_) => ArborErrorCode::Decode,
            ArborError::Validation(_) => ArborErrorCode::Validation,
            ArborError::Unavailable { .. } => ArborErrorCode::Unavailable,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Structured error context with stable keys, the `Info` side of the
    /// wire taxonomy.
    pub fn info(&self) -> BTreeMap<&'static str, Term> {
        let mut info = BTreeMap::new();
        match self {
            ArborError::NodeNotFound { path } => {
                info.insert("path", Term::from(path.to_string()));
            }
            ArborError::MismatchingNode { path, condition } => {
                info.insert("path", Term::from(path.to_string()));
                info.insert("condition", Term::from(condition.to_string()));
            }
            ArborError::NotSpecific { pattern } => {
                info.insert("pattern", Term::from(pattern.to_string()));
            }
            ArborError::DeniedUpdate { path } => {
                info.insert("path", Term::from(path.to_string()));
            }
            ArborError::StoreUpdateDenied { operation } => {
                info.insert("operation", Term::from(operation.clone()));
            }
            ArborError::UnanalyzableTxFun { name } => {
                info.insert("name", Term::from(name.clone()));
            }
            ArborError::FunctionClause { name, arity } => {
                info.insert("name", Term::from(name.clone()));
                info.insert("arity", Term::from(i64::from(*arity)));
            }
            ArborError::Exists { name } => {
                info.insert("name", Term::from(name.clone()));
            }
            ArborError::UnexpectedOption { option, value } => {
                info.insert("option", Term::from(option.clone()));
                info.insert("value", Term::from(value.clone()));
            }
            ArborError::Abort { reason } => {
                info.insert("reason", reason.clone());
            }
            ArborError::Exception { kind, value, trace } => {
                info.insert("kind", Term::from(kind.clone()));
                info.insert("value", value.clone());
                info.insert(
                    "trace",
                    Term::list(trace.iter().map(|frame| Term::from(frame.clone()))),
                );
            }
            ArborError::Encode(message)
            | ArborError::Decode(message)
            | ArborError::Validation(message) => {
                info.insert("message", Term::from(message.clone()));
            }
            ArborError::Unavailable { message } => {
                info.insert("message", Term::from(message.clone()));
            }
            ArborError::Timeout | ArborError::NotLeader | ArborError::NoQuorum => {}
        }
        info
    }
}
