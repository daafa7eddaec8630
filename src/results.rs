//! SPARQL 1.1 JSON results format.
//!
//! Remote endpoints answer SELECT sub-queries with
//! `application/sparql-results+json`; ASK probes answer with the boolean
//! form. Parsing and serialization round-trip: rows written through
//! [`SparqlJsonResults::from_bindings`] and parsed back yield the same
//! binding sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FederationError, Result};
use crate::model::{BindingSet, Literal, Term};

/// Top-level document of the SPARQL JSON results format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparqlJsonResults {
    #[serde(default)]
    pub head: Head,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Rows>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Head {
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rows {
    #[serde(default)]
    pub bindings: Vec<BTreeMap<String, JsonTerm>>,
}

/// One RDF term in JSON encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonTerm {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "xml:lang", skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
}

impl JsonTerm {
    fn to_term(&self) -> Result<Term> {
        match self.kind.as_str() {
            "uri" => Ok(Term::Iri(self.value.clone())),
            "bnode" => Ok(Term::BlankNode(self.value.clone())),
            // "typed-literal" is the legacy D2R-style spelling
            "literal" | "typed-literal" => Ok(Term::Literal(match (&self.language, &self.datatype)
            {
                (Some(lang), _) => Literal::language_tagged(&self.value, lang),
                (None, Some(datatype)) => Literal::typed(&self.value, datatype),
                (None, None) => Literal::simple(&self.value),
            })),
            other => Err(FederationError::Parse(format!(
                "unknown term type '{other}' in SPARQL JSON results"
            ))),
        }
    }

    fn from_term(term: &Term) -> JsonTerm {
        match term {
            Term::Iri(iri) => JsonTerm {
                kind: "uri".into(),
                value: iri.clone(),
                language: None,
                datatype: None,
            },
            Term::BlankNode(id) => JsonTerm {
                kind: "bnode".into(),
                value: id.clone(),
                language: None,
                datatype: None,
            },
            Term::Literal(literal) => JsonTerm {
                kind: "literal".into(),
                value: literal.value().to_string(),
                language: literal.language().map(str::to_string),
                datatype: match literal.language() {
                    Some(_) => None,
                    None if literal.datatype() == crate::model::xsd::STRING => None,
                    None => Some(literal.datatype().to_string()),
                },
            },
        }
    }
}

impl SparqlJsonResults {
    /// Parse a results document from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| FederationError::Parse(format!("invalid SPARQL JSON results: {e}")))
    }

    /// The rows of a SELECT result as binding sets.
    pub fn to_binding_sets(&self) -> Result<Vec<BindingSet>> {
        let rows = match &self.results {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        rows.bindings
            .iter()
            .map(|row| {
                let mut bindings = Vec::with_capacity(row.len());
                for (var, term) in row {
                    bindings.push((var.clone(), term.to_term()?));
                }
                Ok(BindingSet::from_iter(bindings))
            })
            .collect()
    }

    /// The answer of an ASK query.
    pub fn to_boolean(&self) -> Result<bool> {
        self.boolean.ok_or_else(|| {
            FederationError::Parse("expected boolean SPARQL JSON results".to_string())
        })
    }

    /// Serialize rows into the results format.
    pub fn from_bindings(variables: &[String], rows: &[BindingSet]) -> Self {
        SparqlJsonResults {
            head: Head {
                vars: variables.to_vec(),
            },
            results: Some(Rows {
                bindings: rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|(var, term)| (var.to_string(), JsonTerm::from_term(term)))
                            .collect()
                    })
                    .collect(),
            }),
            boolean: None,
        }
    }

    pub fn from_boolean(value: bool) -> Self {
        SparqlJsonResults {
            head: Head::default(),
            results: None,
            boolean: Some(value),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| FederationError::Parse(format!("cannot serialize results: {e}")))
    }
}
