use crate::error::ArborError;
use crate::path::{NodeId, Path};
use crate::term::{Term, TermPattern};
use compact_str::CompactString;
use regex::Regex;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Maximum nesting depth for conditions to prevent stack overflow
const MAX_CONDITION_DEPTH: usize = 32;

/// A compiled name-matching regex that keeps structural equality by
/// comparing on the source text.
#[derive(Debug, Clone)]
pub struct NameRegex {
    source: CompactString,
    compiled: Arc<Regex>,
}

impl NameRegex {
    pub fn new(source: impl AsRef<str>) -> Result<Self, ArborError> {
        let source = source.as_ref();
        let compiled = Regex::new(source)
            .map_err(|e| ArborError::Validation(format!("invalid name regex {source:?}: {e}")))?;
        Ok(Self {
            source: source.into(),
            compiled: Arc::new(compiled),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.compiled.is_match(name)
    }
}

impl PartialEq for NameRegex {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for NameRegex {}

impl Serialize for NameRegex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for NameRegex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        NameRegex::new(&source).map_err(serde::de::Error::custom)
    }
}

/// Facts about a tree node that conditions are evaluated against. Built by
/// the tree layer so the condition model stays free of tree internals.
#[derive(Debug, Clone, Copy)]
pub struct NodeFacts<'a> {
    pub data: Option<&'a Term>,
    pub is_sproc: bool,
    pub payload_version: u64,
    pub child_list_version: u64,
    pub child_count: u64,
}

impl NodeFacts<'_> {
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn has_payload(&self) -> bool {
        self.data.is_some() || self.is_sproc
    }
}

/// Structural condition on a node, evaluated against a candidate sibling
/// identifier and the node's facts (absent when the node does not exist).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Matches the node whose own identifier equals the given one.
    NameIs(NodeId),
    /// Wildcard-one: matches any single identifier.
    AnyName,
    /// Wildcard-any-depth: matches zero or more levels. Only meaningful as
    /// a pattern component; as a bare condition it behaves like `AnyName`.
    AnySubpath,
    NameMatches(NameRegex),
    DataMatches(TermPattern),
    Exists(bool),
    HasData(bool),
    HasSproc(bool),
    HasPayload(bool),
    PayloadVersion(u64),
    ChildListVersion(u64),
    ChildCount(u64),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

fn id_as_text(id: &NodeId) -> Option<&str> {
    match id {
        NodeId::Atom(name) => Some(name.as_str()),
        NodeId::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
    }
}

impl Condition {
    /// Evaluates the condition. `facts` is `None` when the addressed node
    /// does not exist; only `Exists(false)` and the combinators can be met
    /// on a missing node.
    pub fn is_met(&self, id: &NodeId, facts: Option<&NodeFacts<'_>>) -> bool {
        match self {
            Condition::NameIs(expected) => expected == id,
            Condition::AnyName | Condition::AnySubpath => true,
            Condition::NameMatches(regex) => id_as_text(id).is_some_and(|s| regex.is_match(s)),
            Condition::Exists(expected) => facts.is_some() == *expected,
            Condition::DataMatches(pattern) => facts
                .and_then(|f| f.data)
                .is_some_and(|data| pattern.matches(data)),
            Condition::HasData(expected) => {
                facts.is_some_and(|f| f.has_data() == *expected)
            }
            Condition::HasSproc(expected) => facts.is_some_and(|f| f.is_sproc == *expected),
            Condition::HasPayload(expected) => {
                facts.is_some_and(|f| f.has_payload() == *expected)
            }
            Condition::PayloadVersion(expected) => {
                facts.is_some_and(|f| f.payload_version == *expected)
            }
            Condition::ChildListVersion(expected) => {
                facts.is_some_and(|f| f.child_list_version == *expected)
            }
            Condition::ChildCount(expected) => {
                facts.is_some_and(|f| f.child_count == *expected)
            }
            Condition::All(conditions) => conditions.iter().all(|c| c.is_met(id, facts)),
            Condition::Any(conditions) => conditions.iter().any(|c| c.is_met(id, facts)),
            Condition::Not(inner) => !inner.is_met(id, facts),
        }
    }

    /// True when the condition can match at most one sibling at a given
    /// depth, i.e. it pins a concrete identifier.
    pub fn is_specific(&self) -> bool {
        match self {
            Condition::NameIs(_) => true,
            Condition::All(conditions) => conditions.iter().any(|c| c.is_specific()),
            _ => false,
        }
    }

    /// The concrete identifier a specific condition pins, if any.
    pub fn specific_name(&self) -> Option<&NodeId> {
        match self {
            Condition::NameIs(id) => Some(id),
            Condition::All(conditions) => conditions.iter().find_map(|c| c.specific_name()),
            _ => None,
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Condition {
        Condition::All(conditions)
    }

    pub fn any(conditions: Vec<Condition>) -> Condition {
        Condition::Any(conditions)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Condition {
        Condition::Not(Box::new(self))
    }

    /// Maximum nesting depth of this condition tree.
    pub fn depth(&self) -> usize {
        match self {
            Condition::All(cs) | Condition::Any(cs) => {
                1 + cs.iter().map(|c| c.depth()).max().unwrap_or(0)
            }
            Condition::Not(inner) => 1 + inner.depth(),
            _ => 1,
        }
    }

    pub fn validate_depth(&self) -> Result<(), ArborError> {
        let depth = self.depth();
        if depth > MAX_CONDITION_DEPTH {
            return Err(ArborError::Validation(format!(
                "condition depth {depth} exceeds maximum allowed depth of {MAX_CONDITION_DEPTH}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::NameIs(id) => write!(f, "name={id}"),
            Condition::AnyName => write!(f, "*"),
            Condition::AnySubpath => write!(f, "**"),
            Condition::NameMatches(r) => write!(f, "name~{:?}", r.source()),
            Condition::DataMatches(_) => write!(f, "data-matches"),
            Condition::Exists(e) => write!(f, "exists={e}"),
            Condition::HasData(e) => write!(f, "has-data={e}"),
            Condition::HasSproc(e) => write!(f, "has-sproc={e}"),
            Condition::HasPayload(e) => write!(f, "has-payload={e}"),
            Condition::PayloadVersion(v) => write!(f, "payload-version={v}"),
            Condition::ChildListVersion(v) => write!(f, "child-list-version={v}"),
            Condition::ChildCount(v) => write!(f, "child-count={v}"),
            Condition::All(cs) => {
                write!(f, "all(")?;
                for (i, c) in cs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{c}")?;
                }
                write!(f, ")")
            }
            Condition::Any(cs) => {
                write!(f, "any(")?;
                for (i, c) in cs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{c}")?;
                }
                write!(f, ")")
            }
            Condition::Not(inner) => write!(f, "not({inner})"),
        }
    }
}

/// One pattern component: a literal identifier or a condition over sibling
/// identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternComponent {
    Id(NodeId),
    Cond(Condition),
}

impl PatternComponent {
    pub fn is_specific(&self) -> bool {
        match self {
            PatternComponent::Id(_) => true,
            PatternComponent::Cond(c) => c.is_specific(),
        }
    }

    pub fn specific_name(&self) -> Option<&NodeId> {
        match self {
            PatternComponent::Id(id) => Some(id),
            PatternComponent::Cond(c) => c.specific_name(),
        }
    }

    /// Evaluates the component against a candidate identifier and node.
    pub fn is_met(&self, id: &NodeId, facts: Option<&NodeFacts<'_>>) -> bool {
        match self {
            PatternComponent::Id(expected) => expected == id && facts.is_some(),
            PatternComponent::Cond(c) => c.is_met(id, facts),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            PatternComponent::Id(_) => 1,
            PatternComponent::Cond(c) => c.depth(),
        }
    }
}

impl From<NodeId> for PatternComponent {
    fn from(id: NodeId) -> Self {
        PatternComponent::Id(id)
    }
}

impl From<Condition> for PatternComponent {
    fn from(cond: Condition) -> Self {
        PatternComponent::Cond(cond)
    }
}

impl fmt::Display for PatternComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternComponent::Id(id) => write!(f, "{id}"),
            PatternComponent::Cond(Condition::AnyName) => write!(f, "*"),
            PatternComponent::Cond(Condition::AnySubpath) => write!(f, "**"),
            PatternComponent::Cond(c) => write!(f, "<{c}>"),
        }
    }
}

/// Ordered sequence of pattern components. The empty pattern addresses the
/// root node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPattern(Vec<PatternComponent>);

impl PathPattern {
    pub fn root() -> Self {
        PathPattern(Vec::new())
    }

    pub fn new(components: Vec<PatternComponent>) -> Self {
        PathPattern(components)
    }

    pub fn from_path(path: &Path) -> Self {
        PathPattern(path.iter().cloned().map(PatternComponent::Id).collect())
    }

    pub fn components(&self) -> &[PatternComponent] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, component: impl Into<PatternComponent>) {
        self.0.push(component.into());
    }

    /// Appends extra conditions to the final component, wrapping in `All`
    /// as needed. Combining onto the root pattern is a no-op: the root
    /// always exists and has no sibling set to constrain.
    pub fn combine(mut self, extra: Vec<Condition>) -> Self {
        if extra.is_empty() {
            return self;
        }
        let Some(last) = self.0.pop() else {
            return self;
        };
        let mut conditions = match last {
            PatternComponent::Id(id) => vec![Condition::NameIs(id)],
            PatternComponent::Cond(Condition::All(cs)) => cs,
            PatternComponent::Cond(c) => vec![c],
        };
        conditions.extend(extra);
        self.0.push(PatternComponent::Cond(Condition::All(conditions)));
        self
    }

    /// True iff every component can match at most one sibling, so the
    /// pattern addresses at most one node.
    pub fn is_specific(&self) -> bool {
        self.0.iter().all(|c| c.is_specific())
    }

    /// Resolves the concrete path a specific pattern addresses. Fails with
    /// `NotSpecific` before any tree lookup otherwise.
    pub fn target_path(&self) -> Result<Path, ArborError> {
        let mut ids = Vec::with_capacity(self.0.len());
        for component in &self.0 {
            match component.specific_name() {
                Some(id) => ids.push(id.clone()),
                None => {
                    return Err(ArborError::NotSpecific {
                        pattern: Box::new(self.clone()),
                    });
                }
            }
        }
        Ok(Path::new(ids))
    }

    /// Name-level match of a concrete path against this pattern, used by
    /// trigger event filters where only the path is known. Node-state
    /// conditions (data, versions) are treated as satisfied.
    pub fn matches_path(&self, path: &Path) -> bool {
        fn name_met(component: &PatternComponent, id: &NodeId) -> bool {
            match component {
                PatternComponent::Id(expected) => expected == id,
                PatternComponent::Cond(c) => name_cond_met(c, id),
            }
        }

        fn name_cond_met(cond: &Condition, id: &NodeId) -> bool {
            match cond {
                Condition::NameIs(expected) => expected == id,
                Condition::NameMatches(regex) => {
                    id_as_text(id).is_some_and(|s| regex.is_match(s))
                }
                Condition::All(cs) => cs.iter().all(|c| name_cond_met(c, id)),
                Condition::Any(cs) => cs.iter().any(|c| name_cond_met(c, id)),
                Condition::Not(inner) => !name_cond_met(inner, id),
                _ => true,
            }
        }

        fn walk(components: &[PatternComponent], ids: &[NodeId]) -> bool {
            match components.first() {
                None => ids.is_empty(),
                Some(PatternComponent::Cond(Condition::AnySubpath)) => {
                    // Zero levels, or consume one identifier without advancing.
                    walk(&components[1..], ids)
                        || (!ids.is_empty() && walk(components, &ids[1..]))
                }
                Some(component) => match ids.first() {
                    Some(id) => name_met(component, id) && walk(&components[1..], &ids[1..]),
                    None => false,
                },
            }
        }

        walk(&self.0, path.ids())
    }

    pub fn validate_depth(&self) -> Result<(), ArborError> {
        for component in &self.0 {
            if let PatternComponent::Cond(c) = component {
                c.validate_depth()?;
            }
        }
        Ok(())
    }
}

/// Anything the public operations accept where a pattern is expected:
/// typed patterns, concrete paths, or grammar strings.
pub trait IntoPattern {
    fn into_pattern(self) -> Result<PathPattern, ArborError>;
}

impl IntoPattern for PathPattern {
    fn into_pattern(self) -> Result<PathPattern, ArborError> {
        Ok(self)
    }
}

impl IntoPattern for &PathPattern {
    fn into_pattern(self) -> Result<PathPattern, ArborError> {
        Ok(self.clone())
    }
}

impl IntoPattern for Path {
    fn into_pattern(self) -> Result<PathPattern, ArborError> {
        Ok(PathPattern::from(self))
    }
}

impl IntoPattern for &Path {
    fn into_pattern(self) -> Result<PathPattern, ArborError> {
        Ok(PathPattern::from_path(self))
    }
}

impl IntoPattern for &str {
    fn into_pattern(self) -> Result<PathPattern, ArborError> {
        crate::path::parse::parse(self)
    }
}

impl IntoPattern for String {
    fn into_pattern(self) -> Result<PathPattern, ArborError> {
        crate::path::parse::parse(&self)
    }
}

impl From<Path> for PathPattern {
    fn from(path: Path) -> Self {
        PathPattern(path.into_iter().map(PatternComponent::Id).collect())
    }
}

impl From<&Path> for PathPattern {
    fn from(path: &Path) -> Self {
        PathPattern::from_path(path)
    }
}

impl From<Vec<PatternComponent>> for PathPattern {
    fn from(components: Vec<PatternComponent>) -> Self {
        PathPattern(components)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for component in &self.0 {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}
