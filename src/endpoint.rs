//! Federation members and the endpoint registry.
//!
//! An [`Endpoint`] combines immutable identity (id, name, type, location)
//! with mutable runtime state (initialization flag and the triple source
//! facade). Endpoints are created by the builder or from [`MemberConfig`]
//! entries, initialized once, shared by all queries of an engine and shut
//! down with it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::algebra::SourceKind;
use crate::config::{FederationConfig, MemberConfig};
use crate::error::{FederationError, Result};
use crate::monitoring::MonitoringService;
use crate::triple_source::{MemoryTripleSource, SparqlTripleSource, TripleSource};

/// Identity of a federation member. Cheap to clone, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    pub fn new(id: impl AsRef<str>) -> Self {
        EndpointId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        EndpointId::new(value)
    }
}

/// The kind of federation member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointType {
    /// A remote SPARQL 1.1 protocol endpoint.
    SparqlEndpoint,
    /// A remote repository speaking the same protocol behind a repository
    /// location.
    RemoteRepository,
    /// A co-located store; no network I/O involved.
    NativeStore,
    /// A repository resolved at runtime; treated as remote.
    RemoteResolvable,
}

impl EndpointType {
    /// Whether statements of this member are served locally or over the
    /// wire.
    pub fn source_kind(&self) -> SourceKind {
        match self {
            EndpointType::NativeStore => SourceKind::Local,
            _ => SourceKind::Remote,
        }
    }
}

struct EndpointState {
    initialized: bool,
    triple_source: Option<Arc<dyn TripleSource>>,
}

/// A federation member.
///
/// Equality and hashing use the id only; two endpoints with the same id
/// are the same member.
pub struct Endpoint {
    id: EndpointId,
    name: String,
    endpoint_type: EndpointType,
    location: String,
    supports_ask: bool,
    writable: AtomicBool,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    pub fn new(
        id: impl AsRef<str>,
        name: impl Into<String>,
        endpoint_type: EndpointType,
        location: impl Into<String>,
    ) -> Self {
        Endpoint {
            id: EndpointId::new(id),
            name: name.into(),
            endpoint_type,
            location: location.into(),
            supports_ask: true,
            writable: AtomicBool::new(false),
            state: RwLock::new(EndpointState {
                initialized: false,
                triple_source: None,
            }),
        }
    }

    pub fn from_config(config: &MemberConfig) -> Self {
        let endpoint = Endpoint::new(
            &config.id,
            config.name.clone(),
            config.endpoint_type,
            config.location.clone(),
        );
        endpoint.writable.store(config.writable, Ordering::Relaxed);
        Endpoint {
            supports_ask: config.supports_ask_queries,
            ..endpoint
        }
    }

    /// Create an endpoint whose triple source is supplied by the caller,
    /// e.g. a preloaded in-memory store. The endpoint is initialized.
    pub fn with_triple_source(
        id: impl AsRef<str>,
        name: impl Into<String>,
        endpoint_type: EndpointType,
        source: Arc<dyn TripleSource>,
    ) -> Self {
        let endpoint = Endpoint::new(id, name, endpoint_type, "");
        {
            let mut state = endpoint.state.write();
            state.initialized = true;
            state.triple_source = Some(source);
        }
        endpoint
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn source_kind(&self) -> SourceKind {
        self.endpoint_type.source_kind()
    }

    pub fn supports_ask_queries(&self) -> bool {
        self.supports_ask
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Open the underlying connection and build the triple source. Calling
    /// this on an initialized endpoint is a no-op.
    pub fn initialize(
        &self,
        config: &FederationConfig,
        monitoring: Arc<MonitoringService>,
    ) -> Result<()> {
        let mut state = self.state.write();
        if state.initialized {
            return Ok(());
        }
        let source: Arc<dyn TripleSource> = match self.endpoint_type {
            EndpointType::NativeStore => Arc::new(MemoryTripleSource::empty(self.id.clone())),
            EndpointType::SparqlEndpoint
            | EndpointType::RemoteRepository
            | EndpointType::RemoteResolvable => {
                let url = Url::parse(&self.location).map_err(|e| {
                    FederationError::Config(format!(
                        "invalid location '{}' for endpoint '{}': {e}",
                        self.location, self.id
                    ))
                })?;
                Arc::new(SparqlTripleSource::new(
                    self.id.clone(),
                    url,
                    self.supports_ask,
                    config,
                    monitoring,
                )?)
            }
        };
        state.triple_source = Some(source);
        state.initialized = true;
        debug!(endpoint = %self.id, "endpoint initialized");
        Ok(())
    }

    /// The per-endpoint evaluation facade.
    pub fn triple_source(&self) -> Result<Arc<dyn TripleSource>> {
        self.state
            .read()
            .triple_source
            .clone()
            .ok_or_else(|| {
                FederationError::IllegalState(format!("endpoint '{}' is not initialized", self.id))
            })
    }

    /// Release the underlying connection.
    pub fn shutdown(&self) {
        let mut state = self.state.write();
        state.triple_source = None;
        state.initialized = false;
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.endpoint_type)
            .field("location", &self.location)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Holds the federation members of one engine instance.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    ordered: RwLock<Vec<Arc<Endpoint>>>,
    by_id: DashMap<EndpointId, Arc<Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        EndpointRegistry::default()
    }

    /// Register a member. Ids must be unique within the federation.
    pub fn add(&self, endpoint: Arc<Endpoint>) -> Result<()> {
        if self.by_id.contains_key(endpoint.id()) {
            return Err(FederationError::Config(format!(
                "duplicate endpoint id '{}'",
                endpoint.id()
            )));
        }
        self.by_id.insert(endpoint.id().clone(), endpoint.clone());
        self.ordered.write().push(endpoint);
        Ok(())
    }

    pub fn get(&self, id: &EndpointId) -> Option<Arc<Endpoint>> {
        self.by_id.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of all members in registration order.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.ordered.read().clone()
    }

    pub fn len(&self) -> usize {
        self.ordered.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every member.
    pub fn shutdown_all(&self) {
        for endpoint in self.endpoints() {
            endpoint.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_ids() {
        let registry = EndpointRegistry::new();
        let a = Arc::new(Endpoint::new(
            "a",
            "A",
            EndpointType::SparqlEndpoint,
            "http://example.org/sparql",
        ));
        let b = Arc::new(Endpoint::new(
            "a",
            "other A",
            EndpointType::NativeStore,
            "store",
        ));
        registry.add(a).unwrap();
        assert!(registry.add(b).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn endpoint_equality_is_by_id() {
        let a = Endpoint::new("x", "A", EndpointType::SparqlEndpoint, "http://a/");
        let b = Endpoint::new("x", "B", EndpointType::NativeStore, "store");
        assert_eq!(a, b);
    }

    #[test]
    fn native_store_is_local() {
        assert_eq!(EndpointType::NativeStore.source_kind(), SourceKind::Local);
        assert_eq!(
            EndpointType::SparqlEndpoint.source_kind(),
            SourceKind::Remote
        );
    }

    #[test]
    fn uninitialized_endpoint_has_no_triple_source() {
        let endpoint = Endpoint::new("x", "X", EndpointType::SparqlEndpoint, "http://a/");
        assert!(matches!(
            endpoint.triple_source(),
            Err(FederationError::IllegalState(_))
        ));
    }
}
