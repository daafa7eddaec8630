//! SPARQL boundary: parsing glue and query string generation.
//!
//! Parsing is delegated to `spargebra`; the resulting algebra is converted
//! into the federation algebra of [`crate::algebra`]. The other direction
//! builds the SPARQL text shipped to remote endpoints: plain SELECT
//! sub-queries, ASK probes, `SELECT ... LIMIT 1` probe fallbacks and the
//! `VALUES`-batched sub-queries of the bound join.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use spargebra::algebra::{Expression, GraphPattern};
use spargebra::term::{NamedNodePattern, TermPattern};

use crate::algebra::{CompareOp, FilterExpr, PatternElement, QueryNode, TriplePattern};
use crate::error::{FederationError, Result};
use crate::model::{xsd, BindingSet, Literal, Term};

/// Hidden variable injected into bound-join sub-queries to re-associate
/// result rows with the left-hand binding they belong to.
pub const INDEX_VAR: &str = "__fedra_index";

/// Query form of a parsed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryForm {
    Select,
    Ask,
}

/// Result of parsing a SPARQL query into the federation algebra.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub form: QueryForm,
    /// Root of the converted tree. Triple patterns are still unannotated.
    pub root: QueryNode,
    /// Projected variables, in declaration order.
    pub projection: Vec<String>,
    pub distinct: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Parse SPARQL text. Only SELECT and ASK forms are evaluated by the
/// federation; everything else is rejected up front.
pub fn parse_query(sparql: &str) -> Result<ParsedQuery> {
    let query = spargebra::Query::parse(sparql, None)
        .map_err(|e| FederationError::Parse(e.to_string()))?;
    match query {
        spargebra::Query::Select { pattern, .. } => build_parsed(pattern, QueryForm::Select),
        spargebra::Query::Ask { pattern, .. } => build_parsed(pattern, QueryForm::Ask),
        spargebra::Query::Construct { .. } => Err(unsupported("CONSTRUCT queries")),
        spargebra::Query::Describe { .. } => Err(unsupported("DESCRIBE queries")),
    }
}

fn unsupported(feature: impl std::fmt::Display) -> FederationError {
    FederationError::UnsupportedFeature(feature.to_string())
}

fn build_parsed(pattern: GraphPattern, form: QueryForm) -> Result<ParsedQuery> {
    let mut limit = None;
    let mut offset = 0;
    let mut distinct = false;
    let mut projection: Option<Vec<String>> = None;

    // peel the solution modifiers off the root
    let mut current = pattern;
    let root = loop {
        match current {
            GraphPattern::Slice {
                inner,
                start,
                length,
            } => {
                offset = start;
                limit = length;
                current = *inner;
            }
            GraphPattern::Distinct { inner } | GraphPattern::Reduced { inner } => {
                distinct = true;
                current = *inner;
            }
            GraphPattern::Project { inner, variables } if projection.is_none() => {
                projection = Some(variables.iter().map(|v| v.as_str().to_string()).collect());
                current = *inner;
            }
            other => break convert_pattern(other)?,
        }
    };

    let projection = match form {
        QueryForm::Ask => Vec::new(),
        QueryForm::Select => projection.unwrap_or_else(|| {
            root.free_variables().into_iter().collect()
        }),
    };

    Ok(ParsedQuery {
        form,
        root,
        projection,
        distinct,
        limit,
        offset,
    })
}

fn convert_pattern(pattern: GraphPattern) -> Result<QueryNode> {
    match pattern {
        GraphPattern::Bgp { patterns } => {
            let children: Vec<QueryNode> = patterns
                .into_iter()
                .map(|p| convert_triple_pattern(p).map(|pattern| QueryNode::Pattern { pattern }))
                .collect::<Result<_>>()?;
            Ok(flatten_join(children))
        }
        GraphPattern::Join { left, right } => {
            let mut children = Vec::new();
            collect_join(*left, &mut children)?;
            collect_join(*right, &mut children)?;
            Ok(flatten_join(children))
        }
        GraphPattern::Union { left, right } => {
            let mut children = Vec::new();
            collect_union(*left, &mut children)?;
            collect_union(*right, &mut children)?;
            Ok(QueryNode::Union { children })
        }
        GraphPattern::Filter { expr, inner } => Ok(QueryNode::Filter {
            expr: convert_expression(&expr)?,
            child: Box::new(convert_pattern(*inner)?),
        }),
        GraphPattern::Project { inner, variables } => Ok(QueryNode::Projection {
            variables: variables.iter().map(|v| v.as_str().to_string()).collect(),
            child: Box::new(convert_pattern(*inner)?),
        }),
        GraphPattern::LeftJoin { .. } => Err(unsupported("OPTIONAL")),
        GraphPattern::Minus { .. } => Err(unsupported("MINUS")),
        GraphPattern::Path { .. } => Err(unsupported("property paths")),
        GraphPattern::Group { .. } => Err(unsupported("aggregation")),
        GraphPattern::Service { .. } => Err(unsupported("SERVICE")),
        GraphPattern::Graph { .. } => Err(unsupported("named graphs")),
        GraphPattern::OrderBy { .. } => Err(unsupported("ORDER BY")),
        GraphPattern::Values { .. } => Err(unsupported("VALUES")),
        other => Err(unsupported(format!("graph pattern {other:?}"))),
    }
}

fn collect_join(pattern: GraphPattern, into: &mut Vec<QueryNode>) -> Result<()> {
    match pattern {
        GraphPattern::Join { left, right } => {
            collect_join(*left, into)?;
            collect_join(*right, into)?;
        }
        GraphPattern::Bgp { patterns } => {
            for p in patterns {
                into.push(QueryNode::Pattern {
                    pattern: convert_triple_pattern(p)?,
                });
            }
        }
        other => into.push(convert_pattern(other)?),
    }
    Ok(())
}

fn collect_union(pattern: GraphPattern, into: &mut Vec<QueryNode>) -> Result<()> {
    match pattern {
        GraphPattern::Union { left, right } => {
            collect_union(*left, into)?;
            collect_union(*right, into)?;
        }
        other => into.push(convert_pattern(other)?),
    }
    Ok(())
}

fn flatten_join(mut children: Vec<QueryNode>) -> QueryNode {
    if children.len() == 1 {
        children.remove(0)
    } else {
        QueryNode::Join { children }
    }
}

fn convert_triple_pattern(pattern: spargebra::term::TriplePattern) -> Result<TriplePattern> {
    Ok(TriplePattern::new(
        convert_term_pattern(pattern.subject)?,
        convert_named_node_pattern(pattern.predicate),
        convert_term_pattern(pattern.object)?,
    ))
}

fn convert_term_pattern(pattern: TermPattern) -> Result<PatternElement> {
    match pattern {
        TermPattern::Variable(v) => Ok(PatternElement::variable(v.as_str())),
        TermPattern::NamedNode(n) => Ok(PatternElement::Term(Term::Iri(n.into_string()))),
        TermPattern::Literal(l) => Ok(PatternElement::Term(Term::Literal(convert_literal(&l)))),
        // a blank node in a query acts as an anonymous variable
        TermPattern::BlankNode(b) => Ok(PatternElement::variable(format!("__bnode_{}", b.as_str()))),
        other => Err(unsupported(format!("term pattern {other:?}"))),
    }
}

fn convert_named_node_pattern(pattern: NamedNodePattern) -> PatternElement {
    match pattern {
        NamedNodePattern::Variable(v) => PatternElement::variable(v.as_str()),
        NamedNodePattern::NamedNode(n) => PatternElement::Term(Term::Iri(n.into_string())),
    }
}

fn convert_literal(literal: &spargebra::term::Literal) -> Literal {
    match literal.language() {
        Some(lang) => Literal::language_tagged(literal.value(), lang),
        None => Literal::typed(literal.value(), literal.datatype().as_str()),
    }
}

fn convert_expression(expression: &Expression) -> Result<FilterExpr> {
    match expression {
        Expression::Variable(v) => Ok(FilterExpr::Variable(v.as_str().to_string())),
        Expression::NamedNode(n) => Ok(FilterExpr::Constant(Term::Iri(n.as_str().to_string()))),
        Expression::Literal(l) => Ok(FilterExpr::Constant(Term::Literal(convert_literal(l)))),
        Expression::Bound(v) => Ok(FilterExpr::Bound(v.as_str().to_string())),
        Expression::And(l, r) => Ok(FilterExpr::And(
            Box::new(convert_expression(l)?),
            Box::new(convert_expression(r)?),
        )),
        Expression::Or(l, r) => Ok(FilterExpr::Or(
            Box::new(convert_expression(l)?),
            Box::new(convert_expression(r)?),
        )),
        Expression::Not(inner) => Ok(FilterExpr::Not(Box::new(convert_expression(inner)?))),
        Expression::Equal(l, r) | Expression::SameTerm(l, r) => {
            convert_comparison(CompareOp::Eq, l, r)
        }
        Expression::Greater(l, r) => convert_comparison(CompareOp::Gt, l, r),
        Expression::GreaterOrEqual(l, r) => convert_comparison(CompareOp::Ge, l, r),
        Expression::Less(l, r) => convert_comparison(CompareOp::Lt, l, r),
        Expression::LessOrEqual(l, r) => convert_comparison(CompareOp::Le, l, r),
        Expression::In(needle, haystack) => {
            let needle = convert_expression(needle)?;
            let mut alternatives: Option<FilterExpr> = None;
            for candidate in haystack {
                let eq = FilterExpr::compare(
                    CompareOp::Eq,
                    needle.clone(),
                    convert_expression(candidate)?,
                );
                alternatives = Some(match alternatives {
                    Some(previous) => FilterExpr::Or(Box::new(previous), Box::new(eq)),
                    None => eq,
                });
            }
            Ok(alternatives.unwrap_or(FilterExpr::Constant(Term::Literal(Literal::typed(
                "false",
                xsd::BOOLEAN,
            )))))
        }
        other => Err(unsupported(format!("filter expression {other:?}"))),
    }
}

fn convert_comparison(op: CompareOp, left: &Expression, right: &Expression) -> Result<FilterExpr> {
    Ok(FilterExpr::compare(
        op,
        convert_expression(left)?,
        convert_expression(right)?,
    ))
}

// ---------------------------------------------------------------------------
// query string generation

/// Render the triple patterns of a WHERE block.
fn pattern_block(patterns: &[TriplePattern]) -> String {
    let mut block = String::new();
    for pattern in patterns {
        let _ = writeln!(block, "  {} .", pattern);
    }
    block
}

fn filter_clause(filter: Option<&FilterExpr>) -> String {
    match filter {
        Some(expr) => format!("  FILTER {expr}\n"),
        None => String::new(),
    }
}

/// Projected variables of a sub-query: the free variables of its patterns.
pub fn projected_variables(patterns: &[TriplePattern]) -> BTreeSet<String> {
    patterns.iter().flat_map(|p| p.free_variables()).collect()
}

/// A SELECT sub-query over the given patterns, shipped to one endpoint.
pub fn select_query(patterns: &[TriplePattern], filter: Option<&FilterExpr>) -> String {
    let variables = projected_variables(patterns);
    let projection = if variables.is_empty() {
        "*".to_string()
    } else {
        variables
            .iter()
            .map(|v| format!("?{v}"))
            .collect::<Vec<_>>()
            .join(" ")
    };
    format!(
        "SELECT {projection} WHERE {{\n{}{}}}",
        pattern_block(patterns),
        filter_clause(filter)
    )
}

/// An ASK probe for a single pattern.
pub fn ask_query(pattern: &TriplePattern) -> String {
    format!("ASK {{\n{}}}", pattern_block(std::slice::from_ref(pattern)))
}

/// Probe fallback for endpoints without ASK support.
pub fn select_limit1_query(pattern: &TriplePattern) -> String {
    format!(
        "SELECT * WHERE {{\n{}}} LIMIT 1",
        pattern_block(std::slice::from_ref(pattern))
    )
}

/// Triple pattern lookup with fixed `?s ?p ?o` variables for unbound slots.
pub fn statements_query(s: Option<&Term>, p: Option<&Term>, o: Option<&Term>) -> String {
    fn slot(term: Option<&Term>, var: &str) -> PatternElement {
        match term {
            Some(term) => PatternElement::Term(term.clone()),
            None => PatternElement::variable(var),
        }
    }
    let pattern = TriplePattern::new(slot(s, "s"), slot(p, "p"), slot(o, "o"));
    select_query(std::slice::from_ref(&pattern), None)
}

/// The `VALUES`-batched sub-query of a bound join: each left binding
/// becomes one `VALUES` row tagged with its row index, so that result rows
/// can be re-associated with the left tuple they extend.
pub fn bound_join_query(
    patterns: &[TriplePattern],
    filter: Option<&FilterExpr>,
    batch: &[BindingSet],
) -> String {
    let pattern_vars = projected_variables(patterns);
    // only variables that actually occur in the patterns are pushed down
    let values_vars: Vec<&str> = pattern_vars
        .iter()
        .map(String::as_str)
        .filter(|v| batch.iter().any(|row| row.has_binding(v)))
        .collect();

    let mut values = String::new();
    let _ = write!(values, "  VALUES (");
    for var in &values_vars {
        let _ = write!(values, "?{var} ");
    }
    let _ = writeln!(values, "?{INDEX_VAR}) {{");
    for (index, row) in batch.iter().enumerate() {
        let _ = write!(values, "    (");
        for var in &values_vars {
            match row.get(var) {
                Some(term) => {
                    let _ = write!(values, "{term} ");
                }
                None => {
                    let _ = write!(values, "UNDEF ");
                }
            }
        }
        let _ = writeln!(values, "{index})");
    }
    let _ = writeln!(values, "  }}");

    format!(
        "SELECT * WHERE {{\n{values}{}{}}}",
        pattern_block(patterns),
        filter_clause(filter)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> PatternElement {
        PatternElement::variable(name)
    }

    fn iri(value: &str) -> PatternElement {
        PatternElement::Term(Term::iri(value))
    }

    #[test]
    fn parses_basic_select() {
        let parsed = parse_query(
            "PREFIX rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#>\n\
             SELECT ?c WHERE { ?c rdf:type <http://example.org/Conference> }",
        )
        .unwrap();
        assert_eq!(parsed.form, QueryForm::Select);
        assert_eq!(parsed.projection, vec!["c".to_string()]);
        match &parsed.root {
            QueryNode::Pattern { pattern } => {
                assert_eq!(pattern.subject.as_variable(), Some("c"));
                assert!(pattern.predicate.as_term().is_some());
            }
            other => panic!("unexpected root: {other:?}"),
        }
    }

    #[test]
    fn flattens_bgp_into_join() {
        let parsed = parse_query(
            "SELECT * WHERE { ?a <http://example.org/p> ?b . ?b <http://example.org/q> ?c }",
        )
        .unwrap();
        match &parsed.root {
            QueryNode::Join { children } => assert_eq!(children.len(), 2),
            other => panic!("unexpected root: {other:?}"),
        }
    }

    #[test]
    fn union_branches_are_collected() {
        let parsed = parse_query(
            "SELECT * WHERE { { ?s <http://example.org/a> ?o } UNION { ?s <http://example.org/b> ?o } UNION { ?s <http://example.org/c> ?o } }",
        )
        .unwrap();
        match &parsed.root {
            QueryNode::Union { children } => assert_eq!(children.len(), 3),
            other => panic!("unexpected root: {other:?}"),
        }
    }

    #[test]
    fn rejects_unsupported_features() {
        let err = parse_query(
            "SELECT * WHERE { ?s <http://example.org/p> ?o OPTIONAL { ?s <http://example.org/q> ?x } }",
        )
        .unwrap_err();
        assert!(matches!(err, FederationError::UnsupportedFeature(_)));
    }

    #[test]
    fn filter_conversion() {
        let parsed = parse_query(
            "SELECT * WHERE { ?s <http://example.org/age> ?age FILTER (?age > 18 && BOUND(?s)) }",
        )
        .unwrap();
        match &parsed.root {
            QueryNode::Filter { expr, .. } => {
                assert_eq!(
                    expr.free_variables().into_iter().collect::<Vec<_>>(),
                    vec!["age".to_string(), "s".to_string()]
                );
            }
            other => panic!("unexpected root: {other:?}"),
        }
    }

    #[test]
    fn select_query_projects_free_variables() {
        let pattern = TriplePattern::new(var("s"), iri("http://example.org/p"), var("o"));
        let text = select_query(std::slice::from_ref(&pattern), None);
        assert!(text.starts_with("SELECT ?o ?s WHERE {"));
        assert!(text.contains("?s <http://example.org/p> ?o ."));
    }

    #[test]
    fn ask_query_renders_pattern() {
        let pattern = TriplePattern::new(
            var("s"),
            iri("http://example.org/p"),
            PatternElement::Term(Term::literal("x")),
        );
        assert_eq!(
            ask_query(&pattern),
            "ASK {\n  ?s <http://example.org/p> \"x\" .\n}"
        );
    }

    #[test]
    fn bound_join_query_tags_rows_with_index() {
        let pattern = TriplePattern::new(var("s"), iri("http://example.org/p"), var("o"));
        let batch = vec![
            BindingSet::from_iter([("s", Term::iri("http://example.org/1"))]),
            BindingSet::from_iter([("o", Term::literal("two"))]),
        ];
        let text = bound_join_query(std::slice::from_ref(&pattern), None, &batch);
        assert!(text.contains(&format!("VALUES (?o ?s ?{INDEX_VAR})")));
        assert!(text.contains("(UNDEF <http://example.org/1> 0)"));
        assert!(text.contains("(\"two\" UNDEF 1)"));
    }
}
