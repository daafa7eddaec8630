//! Per-endpoint evaluation facade.
//!
//! A [`TripleSource`] hides how a federation member is spoken to:
//! [`SparqlTripleSource`] uses the SPARQL 1.1 protocol over HTTP,
//! [`MemoryTripleSource`] evaluates the algebra against a co-located
//! in-memory store. Remote result sets are drained eagerly and replayed
//! through a bounded channel (the consuming buffer), so the HTTP
//! connection returns to the pool even when the consumer is slow.
//! Failures carry the id of the originating endpoint; a failed remote
//! request triggers one connection repair before the error propagates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::algebra::{FilterExpr, PatternElement, TriplePattern};
use crate::config::FederationConfig;
use crate::endpoint::EndpointId;
use crate::error::{FederationError, Result};
use crate::model::{BindingSet, Statement, Term};
use crate::monitoring::MonitoringService;
use crate::results::SparqlJsonResults;
use crate::sparql;

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

/// A sub-query prepared for one endpoint: SPARQL text for members that
/// accept it, the algebra itself for co-located stores.
#[derive(Debug, Clone)]
pub enum PreparedQuery {
    Sparql(String),
    Algebra(LocalQuery),
}

/// The in-memory form of a sub-query shipped to a local member.
#[derive(Debug, Clone)]
pub struct LocalQuery {
    pub patterns: Vec<TriplePattern>,
    pub filter: Option<FilterExpr>,
}

/// Streaming statement result of a triple pattern lookup.
pub type StatementStream = BoxStream<'static, Result<Statement>>;

/// A closable stream of binding sets backed by a bounded channel.
///
/// Closing the stream (or dropping it) aborts the producer tasks feeding
/// the channel, which releases whatever resources they hold. Close is
/// idempotent.
pub struct BindingStream {
    rx: mpsc::Receiver<Result<BindingSet>>,
    producers: Vec<AbortHandle>,
}

impl BindingStream {
    /// A bounded channel plus the stream reading from it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<BindingSet>>, BindingStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            BindingStream {
                rx,
                producers: Vec::new(),
            },
        )
    }

    /// A stream yielding no rows.
    pub fn empty() -> BindingStream {
        let (_tx, stream) = BindingStream::channel(1);
        stream
    }

    /// A stream replaying rows already in memory.
    pub fn from_rows(rows: Vec<BindingSet>) -> BindingStream {
        let (tx, stream) = BindingStream::channel(rows.len());
        for row in rows {
            // capacity covers all rows, the sends cannot fail
            let _ = tx.try_send(Ok(row));
        }
        stream
    }

    /// A stream yielding a single error.
    pub fn from_error(error: FederationError) -> BindingStream {
        let (tx, stream) = BindingStream::channel(1);
        let _ = tx.try_send(Err(error));
        stream
    }

    /// Register a producer task to be aborted when the stream closes.
    pub fn attach_producer(&mut self, handle: AbortHandle) {
        self.producers.push(handle);
    }

    /// Pull the next row; `None` once the stream is exhausted or closed.
    pub async fn next(&mut self) -> Option<Result<BindingSet>> {
        self.rx.recv().await
    }

    /// Close the stream and abort its producers. Idempotent.
    pub fn close(&mut self) {
        self.rx.close();
        for producer in self.producers.drain(..) {
            producer.abort();
        }
    }
}

impl Drop for BindingStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for BindingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingStream")
            .field("producers", &self.producers.len())
            .finish()
    }
}

impl futures::Stream for BindingStream {
    type Item = Result<BindingSet>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Interface of a federation member's query facade.
#[async_trait]
pub trait TripleSource: Send + Sync + fmt::Debug {
    /// Run a SELECT sub-query, streaming rows. The provided `bindings`
    /// are re-inserted into every produced row.
    async fn evaluate(
        &self,
        query: PreparedQuery,
        bindings: &BindingSet,
        timeout: Option<Duration>,
    ) -> Result<BindingStream>;

    /// Probe whether the pattern has any answer at this member.
    async fn ask(
        &self,
        pattern: &TriplePattern,
        bindings: &BindingSet,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    /// Triple pattern lookup; unbound slots act as wildcards.
    async fn statements(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        timeout: Option<Duration>,
    ) -> Result<StatementStream>;

    /// Whether this member accepts SPARQL text (true) or the in-memory
    /// algebra (false).
    fn use_prepared_query(&self) -> bool;

    /// The member this facade belongs to, for diagnostics.
    fn endpoint_id(&self) -> &EndpointId;
}

/// Triple source for remote SPARQL 1.1 protocol endpoints.
pub struct SparqlTripleSource {
    endpoint: EndpointId,
    url: Url,
    supports_ask: bool,
    client: RwLock<reqwest::Client>,
    request_timeout: Duration,
    buffer_size: usize,
    monitoring: MonitoringService,
}

impl SparqlTripleSource {
    pub fn new(
        endpoint: EndpointId,
        url: Url,
        supports_ask: bool,
        config: &FederationConfig,
        monitoring: Arc<MonitoringService>,
    ) -> Result<Self> {
        Ok(SparqlTripleSource {
            client: RwLock::new(Self::build_client(config.request_timeout)?),
            endpoint,
            url,
            supports_ask,
            request_timeout: config.request_timeout,
            buffer_size: config.stream_buffer_size,
            monitoring: (*monitoring).clone(),
        })
    }

    fn build_client(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fedra/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Config(format!("cannot build HTTP client: {e}")))
    }

    /// Close and reopen the underlying connection pool.
    fn repair(&self) -> Result<()> {
        debug!(endpoint = %self.endpoint, "repairing connection");
        *self.client.write() = Self::build_client(self.request_timeout)?;
        info!(endpoint = %self.endpoint, "connection repaired");
        Ok(())
    }

    async fn send_once(&self, query: &str, timeout: Duration) -> Result<Vec<u8>, reqwest::Error> {
        let client = self.client.read().clone();
        let response = client
            .post(self.url.clone())
            .header(ACCEPT, SPARQL_RESULTS_JSON)
            .form(&[("query", query)])
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Issue a request with the remote-side execution bound applied,
    /// repairing the connection once on transport failure.
    async fn execute(&self, query: &str, timeout: Option<Duration>) -> Result<SparqlJsonResults> {
        let effective = timeout
            .map(|t| t.min(self.request_timeout))
            .unwrap_or(self.request_timeout);
        if effective.is_zero() {
            return Err(FederationError::evaluation(
                &self.endpoint,
                "query deadline exceeded before request",
            ));
        }

        self.monitoring.remote_request(&self.endpoint);
        let bytes = match self.send_once(query, effective).await {
            Ok(bytes) => bytes,
            Err(first) if first.is_status() => {
                return Err(FederationError::evaluation(
                    &self.endpoint,
                    format!("endpoint answered with error status: {first}"),
                ));
            }
            Err(first) => {
                warn!(endpoint = %self.endpoint, error = %first, "remote request failed, repairing connection");
                self.repair()?;
                self.monitoring.remote_request(&self.endpoint);
                self.send_once(query, effective).await.map_err(|second| {
                    FederationError::evaluation(
                        &self.endpoint,
                        format!("remote request failed after repair: {second}"),
                    )
                })?
            }
        };

        SparqlJsonResults::parse(&bytes)
            .map_err(|e| FederationError::evaluation(&self.endpoint, e.to_string()))
    }
}

#[async_trait]
impl TripleSource for SparqlTripleSource {
    async fn evaluate(
        &self,
        query: PreparedQuery,
        bindings: &BindingSet,
        timeout: Option<Duration>,
    ) -> Result<BindingStream> {
        let text = match query {
            PreparedQuery::Sparql(text) => text,
            PreparedQuery::Algebra(_) => {
                return Err(FederationError::IllegalState(format!(
                    "endpoint '{}' expects SPARQL text",
                    self.endpoint
                )))
            }
        };

        let results = self.execute(&text, timeout).await?;
        let rows = results
            .to_binding_sets()
            .map_err(|e| FederationError::evaluation(&self.endpoint, e.to_string()))?;

        // the response is fully drained at this point; replay the rows
        // through the bounded buffer towards the consumer
        let input = bindings.clone();
        let (tx, mut stream) = BindingStream::channel(self.buffer_size);
        let producer = tokio::spawn(async move {
            for row in rows {
                let merged = match row.merge_compatible(&input) {
                    Some(merged) => merged,
                    None => continue,
                };
                if tx.send(Ok(merged)).await.is_err() {
                    break;
                }
            }
        });
        stream.attach_producer(producer.abort_handle());
        Ok(stream)
    }

    async fn ask(
        &self,
        pattern: &TriplePattern,
        bindings: &BindingSet,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let bound = pattern.bind(bindings);
        if self.supports_ask {
            let results = self.execute(&sparql::ask_query(&bound), timeout).await?;
            results
                .to_boolean()
                .map_err(|e| FederationError::evaluation(&self.endpoint, e.to_string()))
        } else {
            // fall back to a SELECT with LIMIT 1
            let results = self
                .execute(&sparql::select_limit1_query(&bound), timeout)
                .await?;
            let rows = results
                .to_binding_sets()
                .map_err(|e| FederationError::evaluation(&self.endpoint, e.to_string()))?;
            Ok(!rows.is_empty())
        }
    }

    async fn statements(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        timeout: Option<Duration>,
    ) -> Result<StatementStream> {
        let results = self
            .execute(&sparql::statements_query(subject, predicate, object), timeout)
            .await?;
        let rows = results
            .to_binding_sets()
            .map_err(|e| FederationError::evaluation(&self.endpoint, e.to_string()))?;

        let endpoint = self.endpoint.clone();
        let fixed = (subject.cloned(), predicate.cloned(), object.cloned());
        let statements = rows.into_iter().map(move |row| {
            fn term(
                fixed: &Option<Term>,
                row: &BindingSet,
                var: &str,
                endpoint: &EndpointId,
            ) -> Result<Term> {
                match fixed {
                    Some(term) => Ok(term.clone()),
                    None => row.get(var).cloned().ok_or_else(|| {
                        FederationError::evaluation(
                            endpoint,
                            format!("missing '{var}' binding in statement result"),
                        )
                    }),
                }
            }
            Ok(Statement::new(
                term(&fixed.0, &row, "s", &endpoint)?,
                term(&fixed.1, &row, "p", &endpoint)?,
                term(&fixed.2, &row, "o", &endpoint)?,
            ))
        });
        Ok(Box::pin(futures::stream::iter(
            statements.collect::<Vec<_>>(),
        )))
    }

    fn use_prepared_query(&self) -> bool {
        true
    }

    fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint
    }
}

impl fmt::Debug for SparqlTripleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparqlTripleSource")
            .field("endpoint", &self.endpoint)
            .field("url", &self.url.as_str())
            .field("supports_ask", &self.supports_ask)
            .finish()
    }
}

/// Triple source over a co-located in-memory store, used for
/// `NativeStore` members and tests.
#[derive(Debug)]
pub struct MemoryTripleSource {
    endpoint: EndpointId,
    statements: RwLock<Vec<Statement>>,
}

impl MemoryTripleSource {
    pub fn empty(endpoint: EndpointId) -> Self {
        MemoryTripleSource {
            endpoint,
            statements: RwLock::new(Vec::new()),
        }
    }

    pub fn with_statements(
        endpoint: EndpointId,
        statements: impl IntoIterator<Item = Statement>,
    ) -> Self {
        MemoryTripleSource {
            endpoint,
            statements: RwLock::new(statements.into_iter().collect()),
        }
    }

    pub fn insert(&self, statement: Statement) {
        self.statements.write().push(statement);
    }

    pub fn len(&self) -> usize {
        self.statements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Match one statement against a pattern, extending `row` with the
    /// variable bindings of the match.
    fn match_statement(pattern: &TriplePattern, statement: &Statement, row: &BindingSet) -> Option<BindingSet> {
        let mut fresh: BTreeMap<&str, &Term> = BTreeMap::new();
        for (element, value) in pattern
            .elements()
            .into_iter()
            .zip([&statement.subject, &statement.predicate, &statement.object])
        {
            match element {
                PatternElement::Term(term) => {
                    if term != value {
                        return None;
                    }
                }
                PatternElement::Variable(name) => {
                    if let Some(bound) = row.get(name).or_else(|| fresh.get(name.as_str()).copied())
                    {
                        if bound != value {
                            return None;
                        }
                    } else {
                        fresh.insert(name.as_str(), value);
                    }
                }
            }
        }
        let mut merged = row.clone();
        for (name, value) in fresh {
            merged = merged.with_binding(name, value.clone());
        }
        Some(merged)
    }

    /// Nested-loop evaluation of a conjunctive query against the store.
    fn eval_patterns(
        &self,
        patterns: &[TriplePattern],
        filter: Option<&FilterExpr>,
        input: &BindingSet,
    ) -> Vec<BindingSet> {
        let store = self.statements.read();
        let mut rows = vec![input.clone()];
        for pattern in patterns {
            let mut next = Vec::new();
            for row in &rows {
                for statement in store.iter() {
                    if let Some(extended) = Self::match_statement(pattern, statement, row) {
                        next.push(extended);
                    }
                }
            }
            rows = next;
            if rows.is_empty() {
                break;
            }
        }
        match filter {
            Some(expr) => rows.into_iter().filter(|row| expr.matches(row)).collect(),
            None => rows,
        }
    }
}

#[async_trait]
impl TripleSource for MemoryTripleSource {
    async fn evaluate(
        &self,
        query: PreparedQuery,
        bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> Result<BindingStream> {
        let local = match query {
            PreparedQuery::Algebra(local) => local,
            PreparedQuery::Sparql(_) => {
                return Err(FederationError::IllegalState(format!(
                    "local endpoint '{}' evaluates the algebra directly",
                    self.endpoint
                )))
            }
        };
        let rows = self.eval_patterns(&local.patterns, local.filter.as_ref(), bindings);
        Ok(BindingStream::from_rows(rows))
    }

    async fn ask(
        &self,
        pattern: &TriplePattern,
        bindings: &BindingSet,
        _timeout: Option<Duration>,
    ) -> Result<bool> {
        let bound = pattern.bind(bindings);
        let store = self.statements.read();
        Ok(store
            .iter()
            .any(|statement| Self::match_statement(&bound, statement, bindings).is_some()))
    }

    async fn statements(
        &self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        _timeout: Option<Duration>,
    ) -> Result<StatementStream> {
        fn slot_matches(slot: Option<&Term>, value: &Term) -> bool {
            slot.map(|term| term == value).unwrap_or(true)
        }
        let matching: Vec<Result<Statement>> = self
            .statements
            .read()
            .iter()
            .filter(|statement| {
                slot_matches(subject, &statement.subject)
                    && slot_matches(predicate, &statement.predicate)
                    && slot_matches(object, &statement.object)
            })
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(matching)))
    }

    fn use_prepared_query(&self) -> bool {
        false
    }

    fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint
    }
}
