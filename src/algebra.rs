//! Federation query algebra.
//!
//! The parsed SPARQL tree is rewritten into the node set defined here:
//! triple patterns annotated with the sources that can answer them,
//! exclusive groups shipped as a single remote sub-query, n-ary joins and
//! unions, bound joins, filters and projections. Nodes are tagged variants
//! of a single enum; rewriting and evaluation traverse it with the
//! [`AlgebraVisitor`] or by direct matching.

use std::collections::BTreeSet;
use std::fmt;

use crate::endpoint::EndpointId;
use crate::error::{FederationError, Result};
use crate::model::{BindingSet, Term};

/// One slot of a triple pattern: a named variable or a bound value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PatternElement {
    Variable(String),
    Term(Term),
}

impl PatternElement {
    pub fn variable(name: impl Into<String>) -> Self {
        PatternElement::Variable(name.into())
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self {
            PatternElement::Variable(name) => Some(name),
            PatternElement::Term(_) => None,
        }
    }

    pub fn as_term(&self) -> Option<&Term> {
        match self {
            PatternElement::Variable(_) => None,
            PatternElement::Term(term) => Some(term),
        }
    }

    /// Resolve this slot under the given bindings: a variable bound in
    /// `bindings` becomes its value.
    pub fn resolve(&self, bindings: &BindingSet) -> PatternElement {
        match self {
            PatternElement::Variable(name) => match bindings.get(name) {
                Some(term) => PatternElement::Term(term.clone()),
                None => self.clone(),
            },
            bound => bound.clone(),
        }
    }
}

impl fmt::Display for PatternElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternElement::Variable(name) => write!(f, "?{name}"),
            PatternElement::Term(term) => term.fmt(f),
        }
    }
}

/// A triple pattern `(subject, predicate, object)`.
///
/// Invariant: a pattern used in a query carries at least one variable;
/// all-constant patterns degenerate to ASK probes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriplePattern {
    pub subject: PatternElement,
    pub predicate: PatternElement,
    pub object: PatternElement,
}

impl TriplePattern {
    pub fn new(subject: PatternElement, predicate: PatternElement, object: PatternElement) -> Self {
        TriplePattern {
            subject,
            predicate,
            object,
        }
    }

    pub fn elements(&self) -> [&PatternElement; 3] {
        [&self.subject, &self.predicate, &self.object]
    }

    /// Free (unbound) variable names of this pattern.
    pub fn free_variables(&self) -> BTreeSet<String> {
        self.elements()
            .into_iter()
            .filter_map(|e| e.as_variable().map(str::to_string))
            .collect()
    }

    /// Substitute variables bound in `bindings` with their values.
    pub fn bind(&self, bindings: &BindingSet) -> TriplePattern {
        if bindings.is_empty() {
            return self.clone();
        }
        TriplePattern {
            subject: self.subject.resolve(bindings),
            predicate: self.predicate.resolve(bindings),
            object: self.object.resolve(bindings),
        }
    }

    /// The normalised cache key of this pattern: bound slots keep their
    /// value, variables collapse to a wildcard. Two patterns differing only
    /// in variable naming map to the same key.
    pub fn subquery_key(&self) -> SubQueryKey {
        SubQueryKey {
            subject: self.subject.as_term().cloned(),
            predicate: self.predicate.as_term().cloned(),
            object: self.object.as_term().cloned(),
        }
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}

/// Normalised triple pattern used as cache key. `None` slots are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubQueryKey {
    pub subject: Option<Term>,
    pub predicate: Option<Term>,
    pub object: Option<Term>,
}

impl fmt::Display for SubQueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn slot(f: &mut fmt::Formatter<'_>, value: &Option<Term>) -> fmt::Result {
            match value {
                Some(term) => write!(f, "{term}"),
                None => write!(f, "*"),
            }
        }
        slot(f, &self.subject)?;
        write!(f, " ")?;
        slot(f, &self.predicate)?;
        write!(f, " ")?;
        slot(f, &self.object)
    }
}

/// Whether statements are served from a co-located store or over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Local,
    Remote,
}

/// A federation member that can contribute answers to a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementSource {
    pub endpoint: EndpointId,
    pub kind: SourceKind,
}

impl StatementSource {
    pub fn new(endpoint: EndpointId, kind: SourceKind) -> Self {
        StatementSource { endpoint, kind }
    }
}

impl fmt::Display for StatementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SourceKind::Local => "local",
            SourceKind::Remote => "remote",
        };
        write!(f, "{}({kind})", self.endpoint)
    }
}

/// Comparison operators of the supported filter subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn sparql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A value expression of the supported filter subset: logical connectives,
/// comparisons and `BOUND`.
///
/// Comparison uses numeric order when both operands carry an xsd numeric
/// datatype and falls back to term equality / lexical order otherwise. A
/// type error makes the enclosing filter drop the row, matching SPARQL's
/// effective-boolean-value treatment of errors.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Variable(String),
    Constant(Term),
    Compare(CompareOp, Box<FilterExpr>, Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Bound(String),
}

impl FilterExpr {
    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::And(Box::new(left), Box::new(right))
    }

    pub fn compare(op: CompareOp, left: FilterExpr, right: FilterExpr) -> Self {
        FilterExpr::Compare(op, Box::new(left), Box::new(right))
    }

    /// Free variable names referenced anywhere in the expression.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, into: &mut BTreeSet<String>) {
        match self {
            FilterExpr::Variable(name) | FilterExpr::Bound(name) => {
                into.insert(name.clone());
            }
            FilterExpr::Constant(_) => {}
            FilterExpr::Compare(_, l, r) | FilterExpr::And(l, r) | FilterExpr::Or(l, r) => {
                l.collect_variables(into);
                r.collect_variables(into);
            }
            FilterExpr::Not(inner) => inner.collect_variables(into),
        }
    }

    /// Split a conjunction into its conjuncts.
    pub fn conjuncts(self) -> Vec<FilterExpr> {
        match self {
            FilterExpr::And(l, r) => {
                let mut out = l.conjuncts();
                out.extend(r.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Rebuild a conjunction from conjuncts. Empty input yields `None`.
    pub fn conjunction(mut conjuncts: Vec<FilterExpr>) -> Option<FilterExpr> {
        let first = match conjuncts.is_empty() {
            true => return None,
            false => conjuncts.remove(0),
        };
        Some(
            conjuncts
                .into_iter()
                .fold(first, |acc, next| FilterExpr::and(acc, next)),
        )
    }

    /// Evaluate the expression against a row. Failing or erroneous rows
    /// evaluate to `false` and are dropped by the enclosing filter.
    pub fn matches(&self, bindings: &BindingSet) -> bool {
        self.truth_value(bindings).unwrap_or(false)
    }

    fn truth_value(&self, bindings: &BindingSet) -> Option<bool> {
        match self {
            FilterExpr::And(l, r) => Some(l.truth_value(bindings)? && r.truth_value(bindings)?),
            FilterExpr::Or(l, r) => Some(l.truth_value(bindings)? || r.truth_value(bindings)?),
            FilterExpr::Not(inner) => Some(!inner.truth_value(bindings)?),
            FilterExpr::Bound(var) => Some(bindings.has_binding(var)),
            FilterExpr::Compare(op, l, r) => {
                let left = l.value(bindings)?;
                let right = r.value(bindings)?;
                Some(compare_terms(*op, &left, &right)?)
            }
            // a bare term expression: effective boolean value
            FilterExpr::Variable(var) => bindings.get(var).map(effective_boolean_value)?,
            FilterExpr::Constant(term) => effective_boolean_value(term),
        }
    }

    fn value(&self, bindings: &BindingSet) -> Option<Term> {
        match self {
            FilterExpr::Variable(var) => bindings.get(var).cloned(),
            FilterExpr::Constant(term) => Some(term.clone()),
            _ => None,
        }
    }
}

fn effective_boolean_value(term: &Term) -> Option<bool> {
    let literal = term.as_literal()?;
    if literal.datatype() == crate::model::xsd::BOOLEAN {
        return match literal.value() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        };
    }
    if let Some(n) = literal.as_f64() {
        return Some(n != 0.0);
    }
    Some(!literal.value().is_empty())
}

fn compare_terms(op: CompareOp, left: &Term, right: &Term) -> Option<bool> {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Some(match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            CompareOp::Lt => l < r,
            CompareOp::Le => l <= r,
            CompareOp::Gt => l > r,
            CompareOp::Ge => l >= r,
        });
    }
    match op {
        CompareOp::Eq => Some(left == right),
        CompareOp::Ne => Some(left != right),
        // lexical order is only defined between literals
        _ => match (left.as_literal(), right.as_literal()) {
            (Some(l), Some(r)) => Some(match op {
                CompareOp::Lt => l.value() < r.value(),
                CompareOp::Le => l.value() <= r.value(),
                CompareOp::Gt => l.value() > r.value(),
                CompareOp::Ge => l.value() >= r.value(),
                _ => unreachable!(),
            }),
            _ => None,
        },
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::Variable(name) => write!(f, "?{name}"),
            FilterExpr::Constant(term) => term.fmt(f),
            FilterExpr::Compare(op, l, r) => write!(f, "({l} {} {r})", op.sparql()),
            FilterExpr::And(l, r) => write!(f, "({l} && {r})"),
            FilterExpr::Or(l, r) => write!(f, "({l} || {r})"),
            FilterExpr::Not(inner) => write!(f, "(!{inner})"),
            FilterExpr::Bound(var) => write!(f, "BOUND(?{var})"),
        }
    }
}

/// A node of the federation algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// A triple pattern before source selection.
    Pattern { pattern: TriplePattern },
    /// No source can answer this pattern; evaluates to zero rows without
    /// remote I/O.
    Empty { pattern: TriplePattern },
    /// Exactly one source can answer the pattern.
    Exclusive {
        pattern: TriplePattern,
        source: StatementSource,
        filter: Option<FilterExpr>,
    },
    /// Several patterns all exclusive to the same source, shipped as one
    /// remote sub-query.
    ExclusiveGroup {
        patterns: Vec<TriplePattern>,
        source: StatementSource,
        filter: Option<FilterExpr>,
    },
    /// Multiple sources can answer the pattern; evaluation unions them.
    SourcePattern {
        pattern: TriplePattern,
        sources: Vec<StatementSource>,
    },
    /// N-ary join, evaluated left-deep.
    Join { children: Vec<QueryNode> },
    /// Join whose right side is parameterised by batches of left bindings.
    BoundJoin {
        left: Box<QueryNode>,
        right: Box<QueryNode>,
    },
    /// Bag union of the children, no order or dedup guarantee.
    Union { children: Vec<QueryNode> },
    Filter {
        expr: FilterExpr,
        child: Box<QueryNode>,
    },
    Projection {
        variables: Vec<String>,
        child: Box<QueryNode>,
    },
}

impl QueryNode {
    /// Free variables produced by this subtree.
    pub fn free_variables(&self) -> BTreeSet<String> {
        match self {
            QueryNode::Pattern { pattern }
            | QueryNode::Empty { pattern }
            | QueryNode::Exclusive { pattern, .. }
            | QueryNode::SourcePattern { pattern, .. } => pattern.free_variables(),
            QueryNode::ExclusiveGroup { patterns, .. } => patterns
                .iter()
                .flat_map(|p| p.free_variables())
                .collect(),
            QueryNode::Join { children } | QueryNode::Union { children } => children
                .iter()
                .flat_map(|c| c.free_variables())
                .collect(),
            QueryNode::BoundJoin { left, right } => {
                let mut vars = left.free_variables();
                vars.extend(right.free_variables());
                vars
            }
            QueryNode::Filter { child, .. } => child.free_variables(),
            QueryNode::Projection { variables, child } => {
                let produced = child.free_variables();
                variables
                    .iter()
                    .filter(|v| produced.contains(*v))
                    .cloned()
                    .collect()
            }
        }
    }

    /// Walk the subtree with a visitor, parents before children.
    pub fn accept<V: AlgebraVisitor>(&self, visitor: &mut V) {
        visitor.visit_node(self);
        match self {
            QueryNode::Pattern { pattern }
            | QueryNode::Empty { pattern }
            | QueryNode::Exclusive { pattern, .. }
            | QueryNode::SourcePattern { pattern, .. } => visitor.visit_pattern(pattern),
            QueryNode::ExclusiveGroup { patterns, .. } => {
                for pattern in patterns {
                    visitor.visit_pattern(pattern);
                }
            }
            QueryNode::Join { children } | QueryNode::Union { children } => {
                for child in children {
                    child.accept(visitor);
                }
            }
            QueryNode::BoundJoin { left, right } => {
                left.accept(visitor);
                right.accept(visitor);
            }
            QueryNode::Filter { child, .. } | QueryNode::Projection { child, .. } => {
                child.accept(visitor)
            }
        }
    }

    /// True if this node is an annotated statement node that can be shipped
    /// to endpoints as a sub-query.
    pub fn is_statement_node(&self) -> bool {
        matches!(
            self,
            QueryNode::Empty { .. }
                | QueryNode::Exclusive { .. }
                | QueryNode::ExclusiveGroup { .. }
                | QueryNode::SourcePattern { .. }
        )
    }

    /// Ensure the subtree contains no unannotated patterns. Source
    /// selection must leave none behind.
    pub fn ensure_annotated(&self) -> Result<()> {
        struct Check(Option<TriplePattern>);
        impl AlgebraVisitor for Check {
            fn visit_node(&mut self, node: &QueryNode) {
                if let QueryNode::Pattern { pattern } = node {
                    if self.0.is_none() {
                        self.0 = Some(pattern.clone());
                    }
                }
            }
        }
        let mut check = Check(None);
        self.accept(&mut check);
        match check.0 {
            Some(pattern) => Err(FederationError::Optimization(format!(
                "pattern '{pattern}' was not annotated during source selection"
            ))),
            None => Ok(()),
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            QueryNode::Pattern { pattern } => writeln!(f, "{pad}Pattern {pattern}"),
            QueryNode::Empty { pattern } => writeln!(f, "{pad}Empty {pattern}"),
            QueryNode::Exclusive {
                pattern,
                source,
                filter,
            } => {
                write!(f, "{pad}Exclusive {pattern} @ {source}")?;
                match filter {
                    Some(expr) => writeln!(f, " FILTER {expr}"),
                    None => writeln!(f),
                }
            }
            QueryNode::ExclusiveGroup {
                patterns,
                source,
                filter,
            } => {
                write!(f, "{pad}ExclusiveGroup[{}] @ {source}", patterns.len())?;
                match filter {
                    Some(expr) => writeln!(f, " FILTER {expr}")?,
                    None => writeln!(f)?,
                }
                for pattern in patterns {
                    writeln!(f, "{pad}  {pattern}")?;
                }
                Ok(())
            }
            QueryNode::SourcePattern { pattern, sources } => {
                write!(f, "{pad}SourcePattern {pattern} @ [")?;
                for (i, source) in sources.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{source}")?;
                }
                writeln!(f, "]")
            }
            QueryNode::Join { children } => {
                writeln!(f, "{pad}NJoin")?;
                for child in children {
                    child.fmt_indented(f, depth + 1)?;
                }
                Ok(())
            }
            QueryNode::BoundJoin { left, right } => {
                writeln!(f, "{pad}BoundJoin")?;
                left.fmt_indented(f, depth + 1)?;
                right.fmt_indented(f, depth + 1)
            }
            QueryNode::Union { children } => {
                writeln!(f, "{pad}NUnion")?;
                for child in children {
                    child.fmt_indented(f, depth + 1)?;
                }
                Ok(())
            }
            QueryNode::Filter { expr, child } => {
                writeln!(f, "{pad}Filter {expr}")?;
                child.fmt_indented(f, depth + 1)
            }
            QueryNode::Projection { variables, child } => {
                writeln!(f, "{pad}Projection ?{}", variables.join(" ?"))?;
                child.fmt_indented(f, depth + 1)
            }
        }
    }
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

/// Read-only traversal of the algebra tree.
pub trait AlgebraVisitor {
    fn visit_node(&mut self, _node: &QueryNode) {}
    fn visit_pattern(&mut self, _pattern: &TriplePattern) {}
}

/// Collect every triple pattern of a subtree, in syntactic order.
pub fn collect_patterns(node: &QueryNode) -> Vec<TriplePattern> {
    struct Collector(Vec<TriplePattern>);
    impl AlgebraVisitor for Collector {
        fn visit_pattern(&mut self, pattern: &TriplePattern) {
            self.0.push(pattern.clone());
        }
    }
    let mut collector = Collector(Vec::new());
    node.accept(&mut collector);
    collector.0
}
