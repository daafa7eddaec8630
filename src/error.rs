//! Error taxonomy for the federation engine.
//!
//! Errors are grouped by the phase in which they occur: configuration,
//! query parsing, optimization (source selection), and evaluation.
//! Evaluation errors carry the id of the originating endpoint so that a
//! failure deep inside a parallel union can be traced back to a federation
//! member.

use crate::endpoint::EndpointId;

/// Result alias used throughout the crate.
pub type Result<T, E = FederationError> = std::result::Result<T, E>;

/// The error type of the federation engine.
///
/// All variants are cheap to clone: the first error raised by any worker
/// task is recorded on the owning query and re-surfaced on the consumer
/// side of the result stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FederationError {
    /// Invalid or missing member/engine configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed SPARQL input.
    #[error("malformed query: {0}")]
    Parse(String),

    /// The query is syntactically valid but uses a SPARQL feature the
    /// federation engine does not evaluate.
    #[error("unsupported query feature: {0}")]
    UnsupportedFeature(String),

    /// Source selection failure: a probe raised an error or the probe
    /// latch ran into the query deadline.
    #[error("optimization error: {0}")]
    Optimization(String),

    /// Remote query failure, binding-type mismatch or I/O error during
    /// evaluation, attributed to a federation member.
    #[error("evaluation error at endpoint '{endpoint}': {message}")]
    Evaluation {
        endpoint: EndpointId,
        message: String,
    },

    /// The query was aborted by timeout, user cancel or a failing task.
    #[error("query {query_id} was cancelled")]
    Cancelled { query_id: u64 },

    /// An operation was attempted against an endpoint or engine in the
    /// wrong lifecycle state, e.g. an uninitialized member.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl FederationError {
    /// Shorthand for an evaluation error attributed to an endpoint.
    pub fn evaluation(endpoint: &EndpointId, message: impl Into<String>) -> Self {
        FederationError::Evaluation {
            endpoint: endpoint.clone(),
            message: message.into(),
        }
    }

    /// True if this error represents a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FederationError::Cancelled { .. })
    }
}
