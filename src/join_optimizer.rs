//! Join-order optimisation.
//!
//! The optimiser orders the children of an n-ary join with a greedy
//! variable-counting heuristic instead of endpoint statistics: the node
//! with the fewest variables left unbound by the already-chosen prefix
//! goes next, exclusive nodes beat multi-source patterns on ties (one
//! endpoint call instead of many), and remaining ties keep the original
//! order. O(n²), which is fine for the BGP sizes seen in practice.

use std::collections::BTreeSet;

use crate::algebra::QueryNode;

/// Order the children of a join. The result is a permutation of the
/// input.
pub fn optimize_join_order(children: Vec<QueryNode>) -> Vec<QueryNode> {
    if children.len() <= 1 {
        return children;
    }

    let mut remaining: Vec<(usize, QueryNode)> = children.into_iter().enumerate().collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut bound: BTreeSet<String> = BTreeSet::new();

    while !remaining.is_empty() {
        let mut best = 0;
        let mut best_key = selection_key(&remaining[0], &bound);
        for (candidate, entry) in remaining.iter().enumerate().skip(1) {
            let key = selection_key(entry, &bound);
            if key < best_key {
                best = candidate;
                best_key = key;
            }
        }
        let (_, node) = remaining.remove(best);
        bound.extend(node.free_variables());
        ordered.push(node);
    }
    ordered
}

/// Sort key of a candidate: unbound variable count (fewer first, which is
/// equivalent to preferring the greatest overlap with the bound prefix),
/// then node kind, then original position.
fn selection_key(entry: &(usize, QueryNode), bound: &BTreeSet<String>) -> (usize, u8, usize) {
    let (index, node) = entry;
    let unbound = node
        .free_variables()
        .iter()
        .filter(|v| !bound.contains(*v))
        .count();
    (unbound, kind_rank(node), *index)
}

fn kind_rank(node: &QueryNode) -> u8 {
    match node {
        QueryNode::Empty { .. } => 0,
        QueryNode::Exclusive { .. } | QueryNode::ExclusiveGroup { .. } => 1,
        QueryNode::SourcePattern { .. } => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{PatternElement, SourceKind, StatementSource, TriplePattern};
    use crate::endpoint::EndpointId;
    use crate::model::Term;

    fn pattern(s: &str, o: &str) -> TriplePattern {
        fn elem(raw: &str) -> PatternElement {
            match raw.strip_prefix('?') {
                Some(var) => PatternElement::variable(var),
                None => PatternElement::Term(Term::iri(raw)),
            }
        }
        TriplePattern::new(elem(s), elem("http://example.org/p"), elem(o))
    }

    fn exclusive(s: &str, o: &str) -> QueryNode {
        QueryNode::Exclusive {
            pattern: pattern(s, o),
            source: StatementSource::new(EndpointId::new("a"), SourceKind::Remote),
            filter: None,
        }
    }

    fn source_pattern(s: &str, o: &str) -> QueryNode {
        QueryNode::SourcePattern {
            pattern: pattern(s, o),
            sources: vec![
                StatementSource::new(EndpointId::new("a"), SourceKind::Remote),
                StatementSource::new(EndpointId::new("b"), SourceKind::Remote),
            ],
        }
    }

    #[test]
    fn output_is_a_permutation() {
        let input = vec![
            source_pattern("?a", "?b"),
            exclusive("?b", "?c"),
            exclusive("?x", "http://example.org/const"),
        ];
        let ordered = optimize_join_order(input.clone());
        assert_eq!(ordered.len(), input.len());
        for node in &input {
            assert!(ordered.contains(node));
        }
    }

    #[test]
    fn fewer_free_variables_go_first() {
        let two_vars = exclusive("?a", "?b");
        let one_var = exclusive("?x", "http://example.org/const");
        let ordered = optimize_join_order(vec![two_vars.clone(), one_var.clone()]);
        assert_eq!(ordered, vec![one_var, two_vars]);
    }

    #[test]
    fn exclusive_beats_source_pattern_on_ties() {
        let multi = source_pattern("?a", "?b");
        let single = exclusive("?a", "?b");
        let ordered = optimize_join_order(vec![multi.clone(), single.clone()]);
        assert_eq!(ordered, vec![single, multi]);
    }

    #[test]
    fn prefix_overlap_drives_selection() {
        // ?a-?b binds first (tie broken by original order); then ?b-?c
        // overlaps the bound prefix more than ?x-?y
        let ab = exclusive("?a", "?b");
        let xy = exclusive("?x", "?y");
        let bc = exclusive("?b", "?c");
        let ordered = optimize_join_order(vec![ab.clone(), xy.clone(), bc.clone()]);
        assert_eq!(ordered, vec![ab, bc, xy]);
    }

    #[test]
    fn reordering_is_idempotent() {
        let input = vec![
            source_pattern("?a", "?b"),
            exclusive("?b", "?c"),
            exclusive("?x", "http://example.org/const"),
            source_pattern("?c", "?d"),
        ];
        let once = optimize_join_order(input);
        let twice = optimize_join_order(once.clone());
        assert_eq!(once, twice);
    }
}
