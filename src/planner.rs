//! Query planning: source selection plus the federation rewrite passes.
//!
//! After source selection annotated every pattern, the tree is rewritten
//! in three passes: same-source exclusive statements inside one
//! conjunctive scope collapse into an [`QueryNode::ExclusiveGroup`];
//! filters whose variables are covered by an exclusive node are attached
//! to it and shipped remotely; join children are ordered by the
//! variable-count heuristic and multi-source right sides are marked as
//! bound joins. The passes are idempotent: planning an already-planned
//! tree changes nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::algebra::{FilterExpr, QueryNode, StatementSource};
use crate::error::Result;
use crate::join_optimizer::optimize_join_order;
use crate::query::QueryInfo;
use crate::source_selection::SourceSelection;
use crate::sparql::ParsedQuery;
use crate::FederationContext;

/// The executable form of a query.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub root: QueryNode,
    /// Variables visible in the final result, in declaration order.
    pub projection: Vec<String>,
    pub distinct: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryPlan projection=[{}]", self.projection.join(", "))?;
        if self.distinct {
            write!(f, " distinct")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit={limit}")?;
        }
        if self.offset > 0 {
            write!(f, " offset={}", self.offset)?;
        }
        writeln!(f)?;
        self.root.fmt(f)
    }
}

/// Builds execution plans for one engine instance.
pub struct QueryPlanner {
    ctx: FederationContext,
}

impl QueryPlanner {
    pub fn new(ctx: FederationContext) -> Self {
        QueryPlanner { ctx }
    }

    /// Run source selection and the rewrite passes. Blocks until all
    /// probes resolved (bounded by the query deadline).
    pub async fn plan(&self, parsed: &ParsedQuery, query: &Arc<QueryInfo>) -> Result<ExecutionPlan> {
        let selection = SourceSelection::new(self.ctx.clone(), query.clone());
        let annotated = selection.annotate(parsed.root.clone()).await?;
        let root = rewrite(annotated);

        let plan = ExecutionPlan {
            root,
            projection: parsed.projection.clone(),
            distinct: parsed.distinct,
            limit: parsed.limit,
            offset: parsed.offset,
        };
        if self.ctx.config().debug_query_plan {
            debug!(query_id = query.query_id(), "query plan:\n{plan}");
        }
        Ok(plan)
    }
}

/// The federation rewrite pipeline applied after source selection.
pub fn rewrite(node: QueryNode) -> QueryNode {
    let node = extract_exclusive_groups(node);
    let node = push_down_filters(node);
    order_joins(node)
}

/// Collapse same-source exclusive statements within one conjunctive scope
/// into an exclusive group. Groups never cross union, optional or filter
/// boundaries because grouping only considers the direct children of a
/// join.
fn extract_exclusive_groups(node: QueryNode) -> QueryNode {
    match node {
        QueryNode::Join { children } => {
            let children: Vec<QueryNode> =
                children.into_iter().map(extract_exclusive_groups).collect();

            // gather the exclusive statements per source
            let mut members: BTreeMap<String, Vec<QueryNode>> = BTreeMap::new();
            for child in &children {
                if let QueryNode::Exclusive { source, .. } = child {
                    members
                        .entry(source_key(source))
                        .or_default()
                        .push(child.clone());
                }
            }
            members.retain(|_, group| group.len() > 1);
            let grouped_sources: std::collections::BTreeSet<String> =
                members.keys().cloned().collect();

            // each group replaces its first member; later members vanish
            let mut result = Vec::with_capacity(children.len());
            for child in children {
                match child {
                    QueryNode::Exclusive { ref source, .. }
                        if grouped_sources.contains(&source_key(source)) =>
                    {
                        // only the first member emits the finished group
                        let Some(group) = members.remove(&source_key(source)) else {
                            continue;
                        };
                        let source = source.clone();
                        let mut patterns = Vec::with_capacity(group.len());
                        let mut group_filter = None;
                        for member in group {
                            if let QueryNode::Exclusive {
                                pattern, filter, ..
                            } = member
                            {
                                patterns.push(pattern);
                                group_filter = merge_filters(group_filter, filter);
                            }
                        }
                        result.push(QueryNode::ExclusiveGroup {
                            patterns,
                            source,
                            filter: group_filter,
                        });
                    }
                    other => result.push(other),
                }
            }

            if result.len() == 1 {
                result.remove(0)
            } else {
                QueryNode::Join { children: result }
            }
        }
        QueryNode::Union { children } => QueryNode::Union {
            children: children.into_iter().map(extract_exclusive_groups).collect(),
        },
        QueryNode::BoundJoin { left, right } => QueryNode::BoundJoin {
            left: Box::new(extract_exclusive_groups(*left)),
            right: Box::new(extract_exclusive_groups(*right)),
        },
        QueryNode::Filter { expr, child } => QueryNode::Filter {
            expr,
            child: Box::new(extract_exclusive_groups(*child)),
        },
        QueryNode::Projection { variables, child } => QueryNode::Projection {
            variables,
            child: Box::new(extract_exclusive_groups(*child)),
        },
        leaf => leaf,
    }
}

fn source_key(source: &StatementSource) -> String {
    source.endpoint.as_str().to_string()
}

fn merge_filters(left: Option<FilterExpr>, right: Option<FilterExpr>) -> Option<FilterExpr> {
    match (left, right) {
        (Some(l), Some(r)) => Some(FilterExpr::and(l, r)),
        (l, None) => l,
        (None, r) => r,
    }
}

/// Attach filter conjuncts to exclusive nodes whose variables cover them;
/// what cannot be pushed stays as a local filter.
fn push_down_filters(node: QueryNode) -> QueryNode {
    match node {
        QueryNode::Filter { expr, child } => {
            let child = push_down_filters(*child);
            let (child, leftover) = push_conjuncts(child, expr.conjuncts());
            match FilterExpr::conjunction(leftover) {
                Some(expr) => QueryNode::Filter {
                    expr,
                    child: Box::new(child),
                },
                None => child,
            }
        }
        QueryNode::Join { children } => QueryNode::Join {
            children: children.into_iter().map(push_down_filters).collect(),
        },
        QueryNode::Union { children } => QueryNode::Union {
            children: children.into_iter().map(push_down_filters).collect(),
        },
        QueryNode::BoundJoin { left, right } => QueryNode::BoundJoin {
            left: Box::new(push_down_filters(*left)),
            right: Box::new(push_down_filters(*right)),
        },
        QueryNode::Projection { variables, child } => QueryNode::Projection {
            variables,
            child: Box::new(push_down_filters(*child)),
        },
        other => other,
    }
}

fn push_conjuncts(node: QueryNode, conjuncts: Vec<FilterExpr>) -> (QueryNode, Vec<FilterExpr>) {
    match node {
        QueryNode::Exclusive {
            pattern,
            source,
            filter,
        } => {
            let vars = pattern.free_variables();
            let (covered, leftover): (Vec<_>, Vec<_>) = conjuncts
                .into_iter()
                .partition(|c| c.free_variables().is_subset(&vars));
            let filter = merge_filters(filter, FilterExpr::conjunction(covered));
            (
                QueryNode::Exclusive {
                    pattern,
                    source,
                    filter,
                },
                leftover,
            )
        }
        QueryNode::ExclusiveGroup {
            patterns,
            source,
            filter,
        } => {
            let vars: std::collections::BTreeSet<String> = patterns
                .iter()
                .flat_map(|p| p.free_variables())
                .collect();
            let (covered, leftover): (Vec<_>, Vec<_>) = conjuncts
                .into_iter()
                .partition(|c| c.free_variables().is_subset(&vars));
            let filter = merge_filters(filter, FilterExpr::conjunction(covered));
            (
                QueryNode::ExclusiveGroup {
                    patterns,
                    source,
                    filter,
                },
                leftover,
            )
        }
        QueryNode::Join { children } => {
            let mut children = children;
            let mut leftover = Vec::new();
            'conjunct: for conjunct in conjuncts {
                for child in children.iter_mut() {
                    if matches!(
                        child,
                        QueryNode::Exclusive { .. } | QueryNode::ExclusiveGroup { .. }
                    ) {
                        let vars = child.free_variables();
                        if conjunct.free_variables().is_subset(&vars) {
                            let taken = std::mem::replace(
                                child,
                                QueryNode::Join { children: vec![] },
                            );
                            let (pushed, mut rest) = push_conjuncts(taken, vec![conjunct]);
                            *child = pushed;
                            leftover.append(&mut rest);
                            continue 'conjunct;
                        }
                    }
                }
                leftover.push(conjunct);
            }
            (QueryNode::Join { children }, leftover)
        }
        other => (other, conjuncts),
    }
}

/// Order join children with the variable-count heuristic and mark
/// multi-source right sides as bound joins.
fn order_joins(node: QueryNode) -> QueryNode {
    match node {
        QueryNode::Join { children } => {
            let children: Vec<QueryNode> = children.into_iter().map(order_joins).collect();
            let ordered = optimize_join_order(children);

            // fold left-deep; a statement node on the right side of a
            // join is evaluated as a bound join, pushing batches of left
            // bindings into its sub-query
            let mut pending: Vec<QueryNode> = Vec::new();
            for child in ordered {
                let is_bound_join_right = matches!(
                    child,
                    QueryNode::SourcePattern { .. }
                        | QueryNode::Exclusive { .. }
                        | QueryNode::ExclusiveGroup { .. }
                ) && !pending.is_empty();
                if is_bound_join_right {
                    let left = flatten_children(std::mem::take(&mut pending));
                    pending.push(QueryNode::BoundJoin {
                        left: Box::new(left),
                        right: Box::new(child),
                    });
                } else {
                    pending.push(child);
                }
            }
            flatten_children(pending)
        }
        QueryNode::Union { children } => QueryNode::Union {
            children: children.into_iter().map(order_joins).collect(),
        },
        QueryNode::BoundJoin { left, right } => QueryNode::BoundJoin {
            left: Box::new(order_joins(*left)),
            right: Box::new(order_joins(*right)),
        },
        QueryNode::Filter { expr, child } => QueryNode::Filter {
            expr,
            child: Box::new(order_joins(*child)),
        },
        QueryNode::Projection { variables, child } => QueryNode::Projection {
            variables,
            child: Box::new(order_joins(*child)),
        },
        leaf => leaf,
    }
}

fn flatten_children(mut children: Vec<QueryNode>) -> QueryNode {
    match children.len() {
        1 => children.remove(0),
        _ => QueryNode::Join { children },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{CompareOp, PatternElement, SourceKind, TriplePattern};
    use crate::endpoint::EndpointId;
    use crate::model::Term;

    fn pattern(s: &str, p: &str, o: &str) -> TriplePattern {
        fn elem(raw: &str) -> PatternElement {
            match raw.strip_prefix('?') {
                Some(var) => PatternElement::variable(var),
                None => PatternElement::Term(Term::iri(raw)),
            }
        }
        TriplePattern::new(elem(s), elem(p), elem(o))
    }

    fn exclusive(s: &str, p: &str, o: &str, endpoint: &str) -> QueryNode {
        QueryNode::Exclusive {
            pattern: pattern(s, p, o),
            source: StatementSource::new(EndpointId::new(endpoint), SourceKind::Remote),
            filter: None,
        }
    }

    fn source_pattern(s: &str, p: &str, o: &str) -> QueryNode {
        QueryNode::SourcePattern {
            pattern: pattern(s, p, o),
            sources: vec![
                StatementSource::new(EndpointId::new("a"), SourceKind::Remote),
                StatementSource::new(EndpointId::new("b"), SourceKind::Remote),
            ],
        }
    }

    #[test]
    fn same_source_exclusives_form_a_group() {
        let node = QueryNode::Join {
            children: vec![
                exclusive("?c", "http://example.org/type", "http://example.org/T", "dbpedia"),
                exclusive("?c", "http://example.org/near", "?loc", "dbpedia"),
                source_pattern("?loc", "http://example.org/country", "?country"),
            ],
        };
        let rewritten = extract_exclusive_groups(node);
        match &rewritten {
            QueryNode::Join { children } => {
                assert_eq!(children.len(), 2);
                match &children[0] {
                    QueryNode::ExclusiveGroup { patterns, source, .. } => {
                        assert_eq!(patterns.len(), 2);
                        assert_eq!(source.endpoint, EndpointId::new("dbpedia"));
                    }
                    other => panic!("expected exclusive group, got {other:?}"),
                }
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn groups_do_not_cross_union_boundaries() {
        let node = QueryNode::Union {
            children: vec![
                exclusive("?a", "http://example.org/p", "?b", "dbpedia"),
                exclusive("?a", "http://example.org/q", "?b", "dbpedia"),
            ],
        };
        let rewritten = extract_exclusive_groups(node);
        match &rewritten {
            QueryNode::Union { children } => {
                assert!(children
                    .iter()
                    .all(|c| matches!(c, QueryNode::Exclusive { .. })));
            }
            other => panic!("expected union, got {other:?}"),
        }
    }

    #[test]
    fn covered_filter_is_attached_to_exclusive_node() {
        let filter = FilterExpr::compare(
            CompareOp::Gt,
            FilterExpr::Variable("o".into()),
            FilterExpr::Constant(Term::Literal(crate::model::Literal::integer(5))),
        );
        let node = QueryNode::Filter {
            expr: filter.clone(),
            child: Box::new(exclusive("?s", "http://example.org/p", "?o", "a")),
        };
        let rewritten = push_down_filters(node);
        match rewritten {
            QueryNode::Exclusive { filter: Some(attached), .. } => assert_eq!(attached, filter),
            other => panic!("expected filtered exclusive, got {other:?}"),
        }
    }

    #[test]
    fn uncovered_filter_stays_local() {
        let filter = FilterExpr::compare(
            CompareOp::Eq,
            FilterExpr::Variable("other".into()),
            FilterExpr::Variable("o".into()),
        );
        let node = QueryNode::Filter {
            expr: filter.clone(),
            child: Box::new(exclusive("?s", "http://example.org/p", "?o", "a")),
        };
        let rewritten = push_down_filters(node);
        assert!(matches!(rewritten, QueryNode::Filter { .. }));
    }

    #[test]
    fn multi_source_right_side_becomes_bound_join() {
        let node = QueryNode::Join {
            children: vec![
                exclusive("?c", "http://example.org/type", "http://example.org/T", "a"),
                source_pattern("?c", "http://example.org/country", "?country"),
            ],
        };
        let rewritten = order_joins(node);
        match rewritten {
            QueryNode::BoundJoin { left, right } => {
                assert!(matches!(*left, QueryNode::Exclusive { .. }));
                assert!(matches!(*right, QueryNode::SourcePattern { .. }));
            }
            other => panic!("expected bound join, got {other:?}"),
        }
    }

    #[test]
    fn rewrite_is_idempotent() {
        let node = QueryNode::Filter {
            expr: FilterExpr::compare(
                CompareOp::Gt,
                FilterExpr::Variable("o".into()),
                FilterExpr::Constant(Term::Literal(crate::model::Literal::integer(1))),
            ),
            child: Box::new(QueryNode::Join {
                children: vec![
                    exclusive("?s", "http://example.org/p", "?o", "a"),
                    exclusive("?s", "http://example.org/q", "?o2", "a"),
                    source_pattern("?o", "http://example.org/r", "?x"),
                ],
            }),
        };
        let once = rewrite(node);
        let twice = rewrite(once.clone());
        assert_eq!(once, twice);
    }
}
