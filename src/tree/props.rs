use crate::path::NodeId;
use crate::sproc::StandaloneFun;
use crate::term::Term;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Projectable node properties a caller can ask for. `Payload` and
/// `HasPayload` are synonyms for the payload-variant-dependent fields:
/// either token selects `data`/`sproc` plus the `has_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropName {
    Payload,
    HasPayload,
    PayloadVersion,
    ChildListVersion,
    ChildListLength,
    ChildNames,
    HasData,
    IsSproc,
}

/// The subset of properties an operation returns per matched node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropFilter(BTreeSet<PropName>);

impl Default for PropFilter {
    fn default() -> Self {
        PropFilter([PropName::Payload, PropName::PayloadVersion].into())
    }
}

impl PropFilter {
    pub fn new<I: IntoIterator<Item = PropName>>(props: I) -> Self {
        PropFilter(props.into_iter().collect())
    }

    /// Selects no properties at all; useful for existence probes.
    pub fn none() -> Self {
        PropFilter(BTreeSet::new())
    }

    pub fn all() -> Self {
        PropFilter(
            [
                PropName::Payload,
                PropName::HasPayload,
                PropName::PayloadVersion,
                PropName::ChildListVersion,
                PropName::ChildListLength,
                PropName::ChildNames,
                PropName::HasData,
                PropName::IsSproc,
            ]
            .into(),
        )
    }

    pub fn contains(&self, prop: PropName) -> bool {
        self.0.contains(&prop)
    }

    /// True when the payload-variant-dependent fields were requested
    /// through either synonym.
    pub fn wants_payload(&self) -> bool {
        self.0.contains(&PropName::Payload) || self.0.contains(&PropName::HasPayload)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<PropName> for PropFilter {
    fn from_iter<I: IntoIterator<Item = PropName>>(iter: I) -> Self {
        PropFilter(iter.into_iter().collect())
    }
}

/// Properties of one matched node, filtered through a [`PropFilter`].
/// Fields not selected stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProps {
    pub data: Option<Term>,
    pub sproc: Option<StandaloneFun>,
    pub payload_version: Option<u64>,
    pub child_list_version: Option<u64>,
    pub child_list_length: Option<u64>,
    pub child_names: Option<Vec<NodeId>>,
    pub has_payload: Option<bool>,
    pub has_data: Option<bool>,
    pub is_sproc: Option<bool>,
}

impl NodeProps {
    pub fn data(&self) -> Option<&Term> {
        self.data.as_ref()
    }

    pub fn sproc(&self) -> Option<&StandaloneFun> {
        self.sproc.as_ref()
    }

    pub fn has_data(&self) -> bool {
        self.has_data.unwrap_or(self.data.is_some())
    }

    pub fn is_sproc(&self) -> bool {
        self.is_sproc.unwrap_or(self.sproc.is_some())
    }

    pub fn has_payload(&self) -> bool {
        self.has_payload
            .unwrap_or(self.data.is_some() || self.sproc.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{PropFilter, PropName};

    #[test]
    fn payload_and_has_payload_are_synonyms() {
        let by_payload = PropFilter::new([PropName::Payload]);
        let by_flag = PropFilter::new([PropName::HasPayload]);
        assert!(by_payload.wants_payload());
        assert!(by_flag.wants_payload());
        assert!(!PropFilter::none().wants_payload());
    }

    #[test]
    fn default_filter_returns_payload_and_version() {
        let filter = PropFilter::default();
        assert!(filter.wants_payload());
        assert!(filter.contains(PropName::PayloadVersion));
        assert!(!filter.contains(PropName::ChildNames));
    }
}
