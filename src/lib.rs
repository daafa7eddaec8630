//! # fedra: a federated SPARQL query engine
//!
//! fedra answers a single SPARQL query by transparently distributing its
//! evaluation across a set of independent, heterogeneous RDF endpoints
//! and merging the partial results into one consistent result stream.
//! The user sees a single virtual graph; the engine hides sharding,
//! remote I/O and parallelism.
//!
//! The pipeline: SPARQL text is parsed and converted into a federation
//! algebra; source selection decides per triple pattern which members can
//! contribute (content cache plus concurrent remote ASK probes); the
//! rewriter forms exclusive groups, pushes filters to their sources and
//! marks bound joins; the join-order optimiser arranges patterns by a
//! variable-count heuristic; and the parallel evaluator executes the plan
//! over two bounded worker pools, producing a streaming result under
//! cancellation and timeout control.
//!
//! ## Example
//!
//! ```no_run
//! use fedra::FederationEngine;
//!
//! # async fn run() -> fedra::Result<()> {
//! let engine = FederationEngine::builder()
//!     .with_sparql_endpoint("https://dbpedia.org/sparql")
//!     .with_sparql_endpoint("https://data.semanticweb.org/sparql")
//!     .build()
//!     .await?;
//!
//! let mut result = engine
//!     .query("SELECT ?c WHERE { ?c a <http://data.semanticweb.org/ns/swc/ontology#ConferenceEvent> }")
//!     .await?;
//! while let Some(row) = result.next().await {
//!     println!("{}", row?);
//! }
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod algebra;
pub mod cache;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod join_optimizer;
pub mod model;
pub mod monitoring;
pub mod planner;
pub mod query;
pub mod results;
pub mod scheduler;
pub mod source_selection;
pub mod sparql;
pub mod triple_source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

pub use crate::algebra::{QueryNode, SourceKind, StatementSource, TriplePattern};
pub use crate::cache::{SourceAssurance, SourceSelectionCache};
pub use crate::config::{FederationConfig, MemberConfig};
pub use crate::endpoint::{Endpoint, EndpointId, EndpointRegistry, EndpointType};
pub use crate::error::{FederationError, Result};
pub use crate::model::{BindingSet, Literal, Statement, Term};
pub use crate::monitoring::{InMemoryMonitoring, MonitoringService, MonitoringSink, NoopSink};
pub use crate::planner::ExecutionPlan;
pub use crate::query::{QueryInfo, QueryManager, QueryResult};
pub use crate::triple_source::{
    BindingStream, LocalQuery, MemoryTripleSource, PreparedQuery, SparqlTripleSource, TripleSource,
};

use crate::executor::ParallelEvaluator;
use crate::planner::QueryPlanner;
use crate::scheduler::WorkerScheduler;
use crate::sparql::ParsedQuery;

/// Shared engine state handed to every component: endpoint registry,
/// cache, schedulers, configuration, monitoring and the query manager.
/// There are no process-wide singletons; the context's lifetime is tied
/// to its [`FederationEngine`].
#[derive(Clone)]
pub struct FederationContext {
    registry: Arc<EndpointRegistry>,
    cache: Arc<SourceSelectionCache>,
    join_scheduler: Arc<WorkerScheduler>,
    union_scheduler: Arc<WorkerScheduler>,
    config: Arc<FederationConfig>,
    monitoring: Arc<MonitoringService>,
    query_manager: Arc<QueryManager>,
}

impl FederationContext {
    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<SourceSelectionCache> {
        &self.cache
    }

    pub(crate) fn join_scheduler(&self) -> &Arc<WorkerScheduler> {
        &self.join_scheduler
    }

    pub(crate) fn union_scheduler(&self) -> &Arc<WorkerScheduler> {
        &self.union_scheduler
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }

    pub fn query_manager(&self) -> &Arc<QueryManager> {
        &self.query_manager
    }
}

impl std::fmt::Debug for FederationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationContext")
            .field("members", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}

/// A query parsed and validated against the supported feature set,
/// reusable across evaluations.
#[derive(Debug, Clone)]
pub struct PreparedFederatedQuery {
    sparql: String,
    parsed: ParsedQuery,
}

impl PreparedFederatedQuery {
    pub fn query_string(&self) -> &str {
        &self.sparql
    }

    pub fn parsed(&self) -> &ParsedQuery {
        &self.parsed
    }

    /// The projected variables of the query.
    pub fn variables(&self) -> &[String] {
        &self.parsed.projection
    }
}

/// The federation engine: owns the federation members, the source
/// selection cache, the worker pools and the in-flight queries.
pub struct FederationEngine {
    ctx: FederationContext,
    closed: AtomicBool,
}

impl FederationEngine {
    /// Start configuring a new federation.
    pub fn builder() -> FederationEngineBuilder {
        FederationEngineBuilder::new()
    }

    pub fn context(&self) -> &FederationContext {
        &self.ctx
    }

    /// The registered federation members.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.ctx.registry.endpoints()
    }

    /// Parse a SPARQL query against the supported feature set.
    pub fn prepare_query(&self, sparql: &str) -> Result<PreparedFederatedQuery> {
        let parsed = crate::sparql::parse_query(sparql)?;
        Ok(PreparedFederatedQuery {
            sparql: sparql.to_string(),
            parsed,
        })
    }

    /// Evaluate a prepared query, returning the streaming result. Source
    /// selection and planning happen up front (bounded by the query
    /// deadline); rows stream in as the members deliver them.
    pub async fn evaluate(&self, prepared: &PreparedFederatedQuery) -> Result<QueryResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FederationError::IllegalState(
                "the federation engine is shut down".into(),
            ));
        }

        let query = self
            .ctx
            .query_manager
            .register(&prepared.sparql, self.ctx.config.max_query_time());
        self.ctx.monitoring.query_started(query.query_id());
        debug!(query_id = query.query_id(), "evaluating federated query");

        let planner = QueryPlanner::new(self.ctx.clone());
        let plan = match planner.plan(&prepared.parsed, &query).await {
            Ok(plan) => plan,
            Err(error) => {
                query.record_error(error.clone());
                self.ctx.query_manager.finish(&query);
                self.ctx.monitoring.query_finished(
                    query.query_id(),
                    query.start_time().elapsed(),
                    true,
                );
                return Err(error);
            }
        };

        let evaluator = ParallelEvaluator::new(self.ctx.clone());
        let stream = evaluator.evaluate(&plan, &query);
        Ok(QueryResult::new(
            stream,
            plan.projection,
            query,
            self.ctx.query_manager.clone(),
            (*self.ctx.monitoring).clone(),
        ))
    }

    /// Convenience: prepare and evaluate in one step.
    pub async fn query(&self, sparql: &str) -> Result<QueryResult> {
        let prepared = self.prepare_query(sparql)?;
        self.evaluate(&prepared).await
    }

    /// Abort all in-flight queries, stop the worker pools and shut down
    /// the federation members. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down federation engine");
        self.ctx.query_manager.abort_all();
        self.ctx.join_scheduler.shutdown();
        self.ctx.union_scheduler.shutdown();
        self.ctx.registry.shutdown_all();
    }
}

impl Drop for FederationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FederationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationEngine")
            .field("members", &self.ctx.registry.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Builder assembling a [`FederationEngine`] from members and
/// configuration.
pub struct FederationEngineBuilder {
    members: Vec<Arc<Endpoint>>,
    config: FederationConfig,
    sink: Option<Arc<dyn MonitoringSink>>,
}

impl FederationEngineBuilder {
    fn new() -> Self {
        FederationEngineBuilder {
            members: Vec::new(),
            config: FederationConfig::default(),
            sink: None,
        }
    }

    pub fn with_config(mut self, config: FederationConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a fully constructed member.
    pub fn with_member(mut self, endpoint: Endpoint) -> Self {
        self.members.push(Arc::new(endpoint));
        self
    }

    /// Add members from declarative configuration.
    pub fn with_members(mut self, members: &[MemberConfig]) -> Self {
        for member in members {
            self.members.push(Arc::new(Endpoint::from_config(member)));
        }
        self
    }

    /// Add a remote SPARQL endpoint; its URL doubles as the member id.
    pub fn with_sparql_endpoint(self, url: impl AsRef<str>) -> Self {
        let url = url.as_ref();
        self.with_members(&[MemberConfig::sparql(url, url)])
    }

    pub fn with_sparql_endpoints<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            self = self.with_sparql_endpoint(url);
        }
        self
    }

    /// Route statistics events into a custom sink.
    pub fn with_monitoring_sink(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Initialize every member and start the worker pools. Must run
    /// inside a tokio runtime.
    pub async fn build(self) -> Result<FederationEngine> {
        let config = Arc::new(self.config);
        let monitoring = Arc::new(MonitoringService::new(
            config.enable_monitoring,
            self.sink
                .unwrap_or_else(|| Arc::new(InMemoryMonitoring::new())),
        ));

        let registry = Arc::new(EndpointRegistry::new());
        for endpoint in self.members {
            endpoint.initialize(&config, monitoring.clone())?;
            registry.add(endpoint)?;
        }

        let ctx = FederationContext {
            registry,
            cache: Arc::new(SourceSelectionCache::new(
                config.source_selection_cache_size,
            )),
            join_scheduler: WorkerScheduler::new("join", config.join_workers()),
            union_scheduler: WorkerScheduler::new("union", config.union_workers()),
            monitoring,
            query_manager: Arc::new(QueryManager::new()),
            config,
        };
        info!(members = ctx.registry.len(), "federation engine ready");
        Ok(FederationEngine {
            ctx,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for FederationEngineBuilder {
    fn default() -> Self {
        FederationEngineBuilder::new()
    }
}
