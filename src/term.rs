use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Opaque caller-chosen value stored as node data.
///
/// Terms carry a total order (kind rank first, then value) so they can key
/// deterministic BTree structures such as projection view tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Term {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(CompactString),
    Bytes(Vec<u8>),
    List(Vec<Term>),
    Set(BTreeSet<Term>),
    Map(BTreeMap<Term, Term>),
}

impl Term {
    fn kind_rank(&self) -> u8 {
        match self {
            Term::Unit => 0,
            Term::Bool(_) => 1,
            Term::Int(_) => 2,
            Term::Float(_) => 3,
            Term::Str(_) => 4,
            Term::Bytes(_) => 5,
            Term::List(_) => 6,
            Term::Set(_) => 7,
            Term::Map(_) => 8,
        }
    }

    pub fn set<I: IntoIterator<Item = Term>>(items: I) -> Term {
        Term::Set(items.into_iter().collect())
    }

    pub fn list<I: IntoIterator<Item = Term>>(items: I) -> Term {
        Term::List(items.into_iter().collect())
    }

    pub fn map<K, V, I>(entries: I) -> Term
    where
        K: Into<Term>,
        V: Into<Term>,
        I: IntoIterator<Item = (K, V)>,
    {
        Term::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Term {}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Term::Unit, Term::Unit) => Ordering::Equal,
            (Term::Bool(a), Term::Bool(b)) => a.cmp(b),
            (Term::Int(a), Term::Int(b)) => a.cmp(b),
            (Term::Float(a), Term::Float(b)) => a.total_cmp(b),
            (Term::Str(a), Term::Str(b)) => a.cmp(b),
            (Term::Bytes(a), Term::Bytes(b)) => a.cmp(b),
            (Term::List(a), Term::List(b)) => a.cmp(b),
            (Term::Set(a), Term::Set(b)) => a.cmp(b),
            (Term::Map(a), Term::Map(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<bool> for Term {
    fn from(v: bool) -> Self {
        Term::Bool(v)
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Term::Int(v)
    }
}

impl From<i32> for Term {
    fn from(v: i32) -> Self {
        Term::Int(v as i64)
    }
}

impl From<u64> for Term {
    fn from(v: u64) -> Self {
        Term::Int(v as i64)
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Self {
        Term::Float(v)
    }
}

impl From<&str> for Term {
    fn from(v: &str) -> Self {
        Term::Str(v.into())
    }
}

impl From<String> for Term {
    fn from(v: String) -> Self {
        Term::Str(v.into())
    }
}

impl From<Vec<u8>> for Term {
    fn from(v: Vec<u8>) -> Self {
        Term::Bytes(v)
    }
}

/// Structural pattern over terms, used by data-matches conditions and
/// compare-and-swap commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermPattern {
    /// Matches any term.
    Any,
    /// Matches a term equal to the given one.
    Exact(Term),
    /// Matches a list of the same length whose elements match positionally.
    List(Vec<TermPattern>),
    /// Matches a map containing at least the given keys, with matching values.
    MapSubset(BTreeMap<Term, TermPattern>),
}

impl TermPattern {
    pub fn matches(&self, term: &Term) -> bool {
        match self {
            TermPattern::Any => true,
            TermPattern::Exact(expected) => expected == term,
            TermPattern::List(patterns) => match term {
                Term::List(items) => {
                    items.len() == patterns.len()
                        && patterns.iter().zip(items).all(|(p, t)| p.matches(t))
                }
                _ => false,
            },
            TermPattern::MapSubset(entries) => match term {
                Term::Map(map) => entries
                    .iter()
                    .all(|(k, p)| map.get(k).is_some_and(|v| p.matches(v))),
                _ => false,
            },
        }
    }
}

impl From<Term> for TermPattern {
    fn from(term: Term) -> Self {
        TermPattern::Exact(term)
    }
}

#[cfg(test)]
mod tests {
    use super::{Term, TermPattern};
    use proptest::prelude::*;

    fn arb_term() -> impl Strategy<Value = Term> {
        let leaf = prop_oneof![
            Just(Term::Unit),
            any::<bool>().prop_map(Term::Bool),
            any::<i64>().prop_map(Term::Int),
            any::<f64>()
                .prop_filter("finite float only", |v| v.is_finite())
                .prop_map(Term::Float),
            "\\PC{0,32}".prop_map(|s| Term::Str(s.into())),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Term::Bytes),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Term::List),
                prop::collection::vec(inner.clone(), 0..6)
                    .prop_map(|items| Term::Set(items.into_iter().collect())),
                prop::collection::vec((inner.clone(), inner), 0..6)
                    .prop_map(|entries| Term::Map(entries.into_iter().collect())),
            ]
        })
    }

    fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
        rmp_serde::to_vec(value).expect("encode should succeed")
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> T {
        rmp_serde::from_slice(bytes).expect("decode should succeed")
    }

    proptest! {
        #[test]
        fn roundtrip_term(t in arb_term()) {
            let bytes = encode(&t);
            let decoded: Term = decode(&bytes);
            prop_assert_eq!(t, decoded);
        }

        #[test]
        fn ordering_stable(a in arb_term(), b in arb_term()) {
            let orig = a.cmp(&b);
            let a2: Term = decode(&encode(&a));
            let b2: Term = decode(&encode(&b));
            prop_assert_eq!(orig, a2.cmp(&b2));
        }
    }

    #[test]
    fn exact_pattern_requires_equality() {
        let pattern = TermPattern::Exact(Term::Int(80));
        assert!(pattern.matches(&Term::Int(80)));
        assert!(!pattern.matches(&Term::Int(60)));
        assert!(!pattern.matches(&Term::Str("80".into())));
    }

    #[test]
    fn list_pattern_matches_positionally() {
        let pattern = TermPattern::List(vec![
            TermPattern::Exact(Term::Str("oak".into())),
            TermPattern::Any,
        ]);
        assert!(pattern.matches(&Term::list([Term::from("oak"), Term::from(80)])));
        assert!(!pattern.matches(&Term::list([Term::from("ash"), Term::from(80)])));
        assert!(!pattern.matches(&Term::list([Term::from("oak")])));
    }

    #[test]
    fn map_subset_ignores_extra_keys() {
        let pattern = TermPattern::MapSubset(
            [(Term::from("kind"), TermPattern::Exact(Term::from("wood")))].into(),
        );
        let value = Term::map([("kind", Term::from("wood")), ("count", Term::from(4))]);
        assert!(pattern.matches(&value));
        assert!(!pattern.matches(&Term::map([("kind", Term::from("steel"))])));
    }
}
