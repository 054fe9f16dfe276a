//! Pattern evaluation against the tree.
//!
//! The walker advances through pattern components in lock-step with the
//! tree, depth-first with children visited in identifier order. A
//! wildcard-any-depth component branches the frontier: match zero further
//! levels, or descend one level without advancing the pattern cursor.
//! Matches are deduplicated and emitted in traversal order, which for this
//! strategy is path-lexicographic order, so every replica reports the same
//! sequence.

use crate::error::ArborError;
use crate::path::pattern::{Condition, PathPattern, PatternComponent};
use crate::path::Path;
use crate::tree::props::{NodeProps, PropFilter};
use crate::tree::{Node, Tree};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Fail with `NotSpecific` before walking when the pattern could match
    /// more than one node.
    pub expect_specific_node: bool,
    /// Include the root node itself in the results when it matches.
    pub include_root_props: bool,
    /// Properties projected for each match.
    pub props: PropFilter,
    /// When the pattern is specific, report `NodeNotFound` /
    /// `MismatchingNode` for the missing or failing target instead of an
    /// empty match set. Cleared for delete-style resolution where absence
    /// is a no-op.
    pub strict_missing: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions {
            expect_specific_node: false,
            include_root_props: false,
            props: PropFilter::default(),
            strict_missing: true,
        }
    }
}

struct WalkCtx<'a> {
    options: &'a WalkOptions,
    strict: bool,
    seen: BTreeSet<Path>,
    matches: Vec<(Path, NodeProps)>,
}

/// Evaluates `pattern` against `tree`, yielding matched paths with their
/// projected properties in deterministic order.
pub fn walk(
    tree: &Tree,
    pattern: &PathPattern,
    options: &WalkOptions,
) -> Result<Vec<(Path, NodeProps)>, ArborError> {
    if options.expect_specific_node && !pattern.is_specific() {
        return Err(ArborError::NotSpecific {
            pattern: Box::new(pattern.clone()),
        });
    }
    let mut ctx = WalkCtx {
        options,
        strict: options.strict_missing && pattern.is_specific(),
        seen: BTreeSet::new(),
        matches: Vec::new(),
    };
    walk_step(tree.root(), Path::root(), pattern.components(), &mut ctx)?;
    Ok(ctx.matches)
}

fn walk_step(
    node: &Node,
    path: Path,
    components: &[PatternComponent],
    ctx: &mut WalkCtx<'_>,
) -> Result<(), ArborError> {
    let Some(component) = components.first() else {
        if path.is_root() && !ctx.options.include_root_props {
            return Ok(());
        }
        if ctx.seen.insert(path.clone()) {
            let props = node.props(&ctx.options.props);
            ctx.matches.push((path, props));
        }
        return Ok(());
    };

    if matches!(component, PatternComponent::Cond(Condition::AnySubpath)) {
        // Zero more levels, then one level down without advancing.
        walk_step(node, path.clone(), &components[1..], ctx)?;
        for (id, child) in node.children() {
            walk_step(child, path.child(id.clone()), components, ctx)?;
        }
        return Ok(());
    }

    if let Some(id) = component.specific_name() {
        let child_path = path.child(id.clone());
        return match node.child(id) {
            Some(child) => {
                if component.is_met(id, Some(&child.facts())) {
                    walk_step(child, child_path, &components[1..], ctx)
                } else if ctx.strict {
                    Err(mismatch_error(component, child_path))
                } else {
                    Ok(())
                }
            }
            None => {
                if ctx.strict {
                    Err(ArborError::NodeNotFound { path: child_path })
                } else {
                    Ok(())
                }
            }
        };
    }

    for (id, child) in node.children() {
        if component.is_met(id, Some(&child.facts())) {
            walk_step(child, path.child(id.clone()), &components[1..], ctx)?;
        }
    }
    Ok(())
}

fn mismatch_error(component: &PatternComponent, path: Path) -> ArborError {
    let condition = match component {
        PatternComponent::Id(id) => Condition::NameIs(id.clone()),
        PatternComponent::Cond(c) => c.clone(),
    };
    ArborError::MismatchingNode {
        path,
        condition: Box::new(condition),
    }
}

/// Where a single-target mutation will land.
#[derive(Debug, Clone)]
pub struct TargetCheck {
    pub path: Path,
    pub exists: bool,
}

/// Resolves a specific pattern to its concrete target for a single-target
/// mutation, verifying every component's conditions against the current
/// tree. Conditions failing on an existing node report `MismatchingNode`;
/// conditions that cannot hold on a missing node report `NodeNotFound`.
pub fn check_target(tree: &Tree, pattern: &PathPattern) -> Result<TargetCheck, ArborError> {
    let path = pattern.target_path()?;
    let mut node = Some(tree.root());
    let mut walked = Path::root();
    for component in pattern.components() {
        let id = component
            .specific_name()
            .expect("specific pattern components pin a name");
        walked.push(id.clone());
        let child = node.and_then(|n| n.child(id));
        match child {
            Some(child) => {
                if !component.is_met(id, Some(&child.facts())) {
                    return Err(mismatch_error(component, walked));
                }
            }
            None => {
                // A bare identifier on a missing node is creatable; an
                // explicit condition must be satisfiable on absence
                // (such as Exists(false)).
                if let PatternComponent::Cond(c) = component {
                    if !c.is_met(id, None) {
                        return Err(ArborError::NodeNotFound { path: walked });
                    }
                }
            }
        }
        node = child;
    }
    Ok(TargetCheck {
        path,
        exists: node.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::{check_target, walk, WalkOptions};
    use crate::error::ArborError;
    use crate::path::pattern::{Condition, PathPattern};
    use crate::path::{NodeId, Path};
    use crate::term::{Term, TermPattern};
    use crate::tree::props::PropFilter;
    use crate::tree::{Payload, Tree};

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        for (path, value) in [
            (vec!["stock", "wood", "oak"], 80),
            (vec!["stock", "wood", "pine"], 30),
            (vec!["stock", "metal", "iron"], 5),
            (vec!["prices", "oak"], 12),
        ] {
            tree.insert(
                &Path::from_strs(&path),
                Payload::Data(Term::from(value)),
                true,
            )
            .expect("insert");
        }
        tree
    }

    fn pattern(parts: &[&str]) -> PathPattern {
        let mut pattern = PathPattern::root();
        for part in parts {
            match *part {
                "*" => pattern.push(Condition::AnyName),
                "**" => pattern.push(Condition::AnySubpath),
                literal => pattern.push(NodeId::from(literal)),
            }
        }
        pattern
    }

    #[test]
    fn literal_walk_finds_the_node() {
        let tree = sample_tree();
        let matches = walk(
            &tree,
            &pattern(&["stock", "wood", "oak"]),
            &WalkOptions::default(),
        )
        .expect("walk");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, Path::from_strs(&["stock", "wood", "oak"]));
        assert_eq!(matches[0].1.data, Some(Term::from(80)));
    }

    #[test]
    fn missing_specific_target_is_an_error() {
        let tree = sample_tree();
        let err = walk(
            &tree,
            &pattern(&["stock", "wood", "ash"]),
            &WalkOptions::default(),
        )
        .expect_err("missing");
        assert_eq!(
            err,
            ArborError::NodeNotFound {
                path: Path::from_strs(&["stock", "wood", "ash"])
            }
        );

        // Non-strict resolution treats absence as an empty match set.
        let matches = walk(
            &tree,
            &pattern(&["stock", "wood", "ash"]),
            &WalkOptions {
                strict_missing: false,
                ..WalkOptions::default()
            },
        )
        .expect("non-strict");
        assert!(matches.is_empty());
    }

    #[test]
    fn wildcard_one_matches_siblings_in_identifier_order() {
        let tree = sample_tree();
        let matches = walk(&tree, &pattern(&["stock", "wood", "*"]), &WalkOptions::default())
            .expect("walk");
        let paths: Vec<String> = matches.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["/stock/wood/oak", "/stock/wood/pine"]);
    }

    #[test]
    fn wildcard_any_depth_matches_zero_and_more_levels() {
        let tree = sample_tree();
        let mut p = pattern(&["stock"]);
        p.push(Condition::AnySubpath);
        let matches = walk(&tree, &p, &WalkOptions::default()).expect("walk");
        let paths: Vec<String> = matches.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(
            paths,
            vec![
                "/stock",
                "/stock/metal",
                "/stock/metal/iron",
                "/stock/wood",
                "/stock/wood/oak",
                "/stock/wood/pine",
            ]
        );
    }

    #[test]
    fn root_match_requires_include_root_props() {
        let tree = sample_tree();
        let root_only = PathPattern::root();
        assert!(walk(&tree, &root_only, &WalkOptions::default())
            .expect("walk")
            .is_empty());
        let matches = walk(
            &tree,
            &root_only,
            &WalkOptions {
                include_root_props: true,
                props: PropFilter::all(),
                ..WalkOptions::default()
            },
        )
        .expect("walk");
        assert_eq!(matches.len(), 1);
        assert!(matches[0].0.is_root());
        assert_eq!(matches[0].1.child_list_length, Some(2));
    }

    #[test]
    fn expect_specific_node_rejects_wildcards_before_walking() {
        let tree = sample_tree();
        let err = walk(
            &tree,
            &pattern(&["stock", "*"]),
            &WalkOptions {
                expect_specific_node: true,
                ..WalkOptions::default()
            },
        )
        .expect_err("ambiguous");
        assert!(matches!(err, ArborError::NotSpecific { .. }));
    }

    #[test]
    fn data_condition_filters_matches() {
        let tree = sample_tree();
        let mut p = pattern(&["stock", "wood"]);
        p.push(Condition::All(vec![
            Condition::AnyName,
            Condition::DataMatches(TermPattern::Exact(Term::from(30))),
        ]));
        let matches = walk(&tree, &p, &WalkOptions::default()).expect("walk");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, Path::from_strs(&["stock", "wood", "pine"]));
    }

    #[test]
    fn check_target_distinguishes_missing_from_mismatching() {
        let tree = sample_tree();

        let create_existing = PathPattern::from_path(&Path::from_strs(&["stock", "wood", "oak"]))
            .combine(vec![Condition::Exists(false)]);
        assert!(matches!(
            check_target(&tree, &create_existing),
            Err(ArborError::MismatchingNode { .. })
        ));

        let update_missing = PathPattern::from_path(&Path::from_strs(&["stock", "wood", "ash"]))
            .combine(vec![Condition::Exists(true)]);
        assert!(matches!(
            check_target(&tree, &update_missing),
            Err(ArborError::NodeNotFound { .. })
        ));

        let create_missing = PathPattern::from_path(&Path::from_strs(&["stock", "wood", "ash"]))
            .combine(vec![Condition::Exists(false)]);
        let target = check_target(&tree, &create_missing).expect("target");
        assert!(!target.exists);
        assert_eq!(target.path, Path::from_strs(&["stock", "wood", "ash"]));
    }

    #[test]
    fn check_target_allows_missing_intermediates_for_plain_puts() {
        let tree = Tree::new();
        let target = check_target(
            &tree,
            &PathPattern::from_path(&Path::from_strs(&["a", "b", "c"])),
        )
        .expect("plain path is creatable");
        assert!(!target.exists);
        assert_eq!(target.path, Path::from_strs(&["a", "b", "c"]));

        // An exists-condition on the final component still fails on a
        // missing branch without touching the tree.
        let update = PathPattern::from_path(&Path::from_strs(&["a", "b"]))
            .combine(vec![Condition::Exists(true)]);
        assert_eq!(
            check_target(&tree, &update).expect_err("missing"),
            ArborError::NodeNotFound {
                path: Path::from_strs(&["a", "b"])
            }
        );
    }

    #[test]
    fn duplicate_matches_are_emitted_once() {
        let tree = sample_tree();
        let mut p = PathPattern::root();
        p.push(Condition::AnySubpath);
        p.push(Condition::AnySubpath);
        p.push(NodeId::from("oak"));
        let matches = walk(&tree, &p, &WalkOptions::default()).expect("walk");
        let paths: Vec<String> = matches.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["/prices/oak", "/stock/wood/oak"]);
    }
}
