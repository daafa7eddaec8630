//! RDF data model: terms, statements and binding sets.
//!
//! The model is deliberately small. Terms render themselves in SPARQL/
//! N-Triples syntax via [`std::fmt::Display`], which is what the query
//! string generation in [`crate::sparql`] and the result serialization in
//! [`crate::results`] build on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// An RDF literal: lexical value plus optional language tag or datatype.
///
/// A literal with neither language nor datatype is a plain `xsd:string`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Literal {
    value: String,
    language: Option<String>,
    datatype: Option<String>,
}

impl Literal {
    pub fn simple(value: impl Into<String>) -> Self {
        Literal {
            value: value.into(),
            language: None,
            datatype: None,
        }
    }

    pub fn language_tagged(value: impl Into<String>, language: impl Into<String>) -> Self {
        Literal {
            value: value.into(),
            language: Some(language.into()),
            datatype: None,
        }
    }

    pub fn typed(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        let datatype = datatype.into();
        Literal {
            value: value.into(),
            language: None,
            // xsd:string is the implicit datatype of a simple literal
            datatype: if datatype == xsd::STRING {
                None
            } else {
                Some(datatype)
            },
        }
    }

    pub fn integer(value: i64) -> Self {
        Literal::typed(value.to_string(), xsd::INTEGER)
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn datatype(&self) -> &str {
        self.datatype.as_deref().unwrap_or(xsd::STRING)
    }

    /// Numeric interpretation for filter comparison, if the datatype is one
    /// of the xsd numeric types.
    pub fn as_f64(&self) -> Option<f64> {
        if xsd::is_numeric(self.datatype()) {
            self.value.trim().parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", escape_literal(&self.value))?;
        if let Some(lang) = &self.language {
            write!(f, "@{lang}")
        } else if let Some(dt) = &self.datatype {
            write!(f, "^^<{dt}>")
        } else {
            Ok(())
        }
    }
}

/// A bound RDF value: IRI, blank node or literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Iri(String),
    BlankNode(String),
    Literal(Literal),
}

impl Term {
    pub fn iri(iri: impl Into<String>) -> Self {
        Term::Iri(iri.into())
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal(Literal::simple(value))
    }

    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri(_))
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Term::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    /// Numeric value for comparison, literals only.
    pub fn as_f64(&self) -> Option<f64> {
        self.as_literal().and_then(Literal::as_f64)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::BlankNode(id) => write!(f, "_:{id}"),
            Term::Literal(lit) => lit.fmt(f),
        }
    }
}

/// An RDF statement (triple).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl Statement {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Statement {
            subject,
            predicate,
            object,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} .", self.subject, self.predicate, self.object)
    }
}

/// An immutable mapping from variable names to RDF values, representing one
/// solution row.
///
/// Binding sets share their backing map on clone; merging produces a new
/// set. Variable names are stored without the leading `?`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingSet {
    bindings: Arc<BTreeMap<String, Term>>,
}

impl BindingSet {
    pub fn new() -> Self {
        BindingSet::default()
    }

    pub fn from_iter<I, K>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, Term)>,
        K: Into<String>,
    {
        BindingSet {
            bindings: Arc::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub fn get(&self, variable: &str) -> Option<&Term> {
        self.bindings.get(variable)
    }

    pub fn has_binding(&self, variable: &str) -> bool {
        self.bindings.contains_key(variable)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Returns a new set with the additional binding. An existing binding
    /// for the same variable is replaced.
    pub fn with_binding(&self, variable: impl Into<String>, value: Term) -> Self {
        let mut map = (*self.bindings).clone();
        map.insert(variable.into(), value);
        BindingSet {
            bindings: Arc::new(map),
        }
    }

    /// Merge two binding sets. Shared variables must agree on their value,
    /// otherwise the rows are incompatible and `None` is returned.
    pub fn merge_compatible(&self, other: &BindingSet) -> Option<BindingSet> {
        if other.is_empty() {
            return Some(self.clone());
        }
        if self.is_empty() {
            return Some(other.clone());
        }
        for (var, value) in other.iter() {
            if let Some(existing) = self.get(var) {
                if existing != value {
                    return None;
                }
            }
        }
        let mut map = (*self.bindings).clone();
        for (var, value) in other.iter() {
            map.entry(var.to_string()).or_insert_with(|| value.clone());
        }
        Some(BindingSet {
            bindings: Arc::new(map),
        })
    }

    /// Restrict the row to the given variables.
    pub fn project(&self, variables: &[String]) -> BindingSet {
        let map: BTreeMap<String, Term> = variables
            .iter()
            .filter_map(|v| self.get(v).map(|t| (v.clone(), t.clone())))
            .collect();
        BindingSet {
            bindings: Arc::new(map),
        }
    }

    /// Drop a single variable, used to strip internal helper variables.
    pub fn without(&self, variable: &str) -> BindingSet {
        if !self.has_binding(variable) {
            return self.clone();
        }
        let mut map = (*self.bindings).clone();
        map.remove(variable);
        BindingSet {
            bindings: Arc::new(map),
        }
    }
}

impl fmt::Display for BindingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (var, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{var}={value}")?;
        }
        write!(f, "]")
    }
}

fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Common XSD datatype IRIs.
pub mod xsd {
    pub const STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
    pub const INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
    pub const DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
    pub const DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
    pub const FLOAT: &str = "http://www.w3.org/2001/XMLSchema#float";
    pub const BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

    const NUMERIC: &[&str] = &[
        INTEGER,
        DECIMAL,
        DOUBLE,
        FLOAT,
        "http://www.w3.org/2001/XMLSchema#int",
        "http://www.w3.org/2001/XMLSchema#long",
        "http://www.w3.org/2001/XMLSchema#short",
        "http://www.w3.org/2001/XMLSchema#byte",
        "http://www.w3.org/2001/XMLSchema#nonNegativeInteger",
        "http://www.w3.org/2001/XMLSchema#positiveInteger",
        "http://www.w3.org/2001/XMLSchema#unsignedInt",
        "http://www.w3.org/2001/XMLSchema#unsignedLong",
    ];

    pub fn is_numeric(datatype: &str) -> bool {
        NUMERIC.contains(&datatype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_rendering() {
        assert_eq!(
            Term::iri("http://example.org/a").to_string(),
            "<http://example.org/a>"
        );
        assert_eq!(Term::BlankNode("b1".into()).to_string(), "_:b1");
        assert_eq!(Term::literal("hi").to_string(), "\"hi\"");
        assert_eq!(
            Term::Literal(Literal::language_tagged("hallo", "de")).to_string(),
            "\"hallo\"@de"
        );
        assert_eq!(
            Term::Literal(Literal::integer(42)).to_string(),
            "\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>"
        );
    }

    #[test]
    fn literal_escaping() {
        let lit = Literal::simple("a \"quoted\"\nline");
        assert_eq!(lit.to_string(), "\"a \\\"quoted\\\"\\nline\"");
    }

    #[test]
    fn numeric_interpretation() {
        assert_eq!(Literal::integer(7).as_f64(), Some(7.0));
        assert_eq!(
            Literal::typed("1.5", xsd::DECIMAL).as_f64(),
            Some(1.5)
        );
        assert_eq!(Literal::simple("7").as_f64(), None);
    }

    #[test]
    fn merge_compatible_rows() {
        let a = BindingSet::from_iter([
            ("x", Term::iri("http://example.org/1")),
            ("y", Term::literal("left")),
        ]);
        let b = BindingSet::from_iter([
            ("x", Term::iri("http://example.org/1")),
            ("z", Term::literal("right")),
        ]);
        let merged = a.merge_compatible(&b).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get("z"), Some(&Term::literal("right")));
    }

    #[test]
    fn merge_incompatible_rows() {
        let a = BindingSet::from_iter([("x", Term::iri("http://example.org/1"))]);
        let b = BindingSet::from_iter([("x", Term::iri("http://example.org/2"))]);
        assert!(a.merge_compatible(&b).is_none());
    }

    #[test]
    fn projection_keeps_cardinality_of_row() {
        let row = BindingSet::from_iter([
            ("a", Term::literal("1")),
            ("b", Term::literal("2")),
        ]);
        let projected = row.project(&["a".to_string(), "missing".to_string()]);
        assert_eq!(projected.len(), 1);
        assert!(projected.get("b").is_none());
    }
}
