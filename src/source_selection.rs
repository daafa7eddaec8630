//! Source selection: decide which federation members can answer each
//! triple pattern.
//!
//! For every pattern the cache is consulted first; unknown
//! `(pattern, endpoint)` pairs are probed with concurrent remote ASK
//! tasks on the join scheduler. The caller blocks on a latch that counts
//! one completion per probe and honours the query deadline. Probe errors
//! are collected in a shared list and sampled once after the latch
//! drains. Finally each pattern is replaced by its annotated algebra
//! variant.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::algebra::{
    collect_patterns, QueryNode, StatementSource, SubQueryKey, TriplePattern,
};
use crate::cache::SourceAssurance;
use crate::endpoint::Endpoint;
use crate::error::{FederationError, Result};
use crate::model::BindingSet;
use crate::query::QueryInfo;
use crate::scheduler::{CountDownLatch, TaskControl};
use crate::FederationContext;

/// Latch-based control for the parallel probe tasks.
struct ProbeControl {
    latch: CountDownLatch,
    errors: Mutex<Vec<FederationError>>,
}

impl TaskControl for ProbeControl {
    fn done(&self) {
        self.latch.count_down();
    }

    fn toss(&self, error: FederationError) {
        self.errors.lock().push(error);
        self.latch.count_down();
    }

    fn cancelled(&self) {
        self.latch.count_down();
    }
}

/// Performs source selection for one query.
pub struct SourceSelection {
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    sources: Arc<DashMap<SubQueryKey, Vec<StatementSource>>>,
}

impl SourceSelection {
    pub fn new(ctx: FederationContext, query: Arc<QueryInfo>) -> Self {
        SourceSelection {
            ctx,
            query,
            sources: Arc::new(DashMap::new()),
        }
    }

    /// Resolve the sources of every pattern in `node` and replace the
    /// patterns with their annotated variants. Blocks until all probes
    /// finished or the query deadline passed.
    pub async fn annotate(&self, node: QueryNode) -> Result<QueryNode> {
        let patterns = collect_patterns(&node);
        self.resolve(&patterns).await?;
        let rewritten = self.rewrite(node);
        rewritten.ensure_annotated()?;
        Ok(rewritten)
    }

    async fn resolve(&self, patterns: &[TriplePattern]) -> Result<()> {
        let endpoints = self.ctx.registry().endpoints();
        if endpoints.is_empty() {
            return Err(FederationError::Config(
                "the federation has no members".into(),
            ));
        }

        // consult the cache; collect one probe task per unknown pair,
        // deduplicated over the normalised subquery
        let mut probes: Vec<(Arc<Endpoint>, TriplePattern, SubQueryKey)> = Vec::new();
        for pattern in patterns {
            let key = pattern.subquery_key();
            if self.sources.contains_key(&key) {
                continue;
            }
            self.sources.insert(key.clone(), Vec::new());
            for endpoint in &endpoints {
                match self.ctx.cache().can_provide_statements(&key, endpoint.id()) {
                    SourceAssurance::HasLocalStatements | SourceAssurance::HasRemoteStatements => {
                        self.add_source(
                            &key,
                            StatementSource::new(endpoint.id().clone(), endpoint.source_kind()),
                        );
                    }
                    SourceAssurance::None => continue,
                    SourceAssurance::PossiblyHasStatements => {
                        probes.push((endpoint.clone(), pattern.clone(), key.clone()));
                    }
                }
            }
        }

        if probes.is_empty() {
            return Ok(());
        }

        let control = Arc::new(ProbeControl {
            latch: CountDownLatch::new(probes.len()),
            errors: Mutex::new(Vec::new()),
        });

        for (endpoint, pattern, key) in probes {
            let cache = self.ctx.cache().clone();
            let sources = self.sources.clone();
            let query = self.query.clone();
            let task = async move {
                let triple_source = endpoint.triple_source()?;
                if endpoint.source_kind() == crate::algebra::SourceKind::Remote {
                    query.stats().count_remote_request();
                }
                let has_results = triple_source
                    .ask(&pattern, &BindingSet::new(), Some(query.remaining_time()))
                    .await
                    .map_err(|e| {
                        FederationError::Optimization(format!(
                            "error checking results for endpoint '{}': {e}",
                            endpoint.id()
                        ))
                    })?;
                cache.update_entry(&key, endpoint.id(), endpoint.source_kind(), has_results);
                if has_results {
                    let mut entry = sources.entry(key).or_default();
                    entry.push(StatementSource::new(
                        endpoint.id().clone(),
                        endpoint.source_kind(),
                    ));
                }
                Ok(())
            };
            self.ctx
                .join_scheduler()
                .schedule_with_control(self.query.clone(), control.clone(), task)?;
        }

        // block until every probe resolved, bounded by the remaining
        // query time
        let completed = control
            .latch
            .wait_timeout(self.query.remaining_time())
            .await;
        if !completed {
            self.query.abort();
            return Err(FederationError::Optimization(
                "source selection has run into a timeout".into(),
            ));
        }

        // sample the error list exactly once after the latch drained
        let mut errors = control.errors.lock();
        if let Some(first) = errors.first().cloned() {
            debug!(
                query_id = self.query.query_id(),
                error_count = errors.len(),
                "errors were reported during source selection"
            );
            errors.clear();
            return Err(first);
        }
        Ok(())
    }

    fn add_source(&self, key: &SubQueryKey, source: StatementSource) {
        self.sources.entry(key.clone()).or_default().push(source);
    }

    /// Replace every unannotated pattern with Empty / Exclusive /
    /// SourcePattern depending on its resolved source list.
    fn rewrite(&self, node: QueryNode) -> QueryNode {
        match node {
            QueryNode::Pattern { pattern } => {
                let mut sources = self
                    .sources
                    .get(&pattern.subquery_key())
                    .map(|entry| entry.value().clone())
                    .unwrap_or_default();
                sources.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
                match sources.len() {
                    0 => {
                        debug!(%pattern, "no source provides results, replacing with empty pattern");
                        QueryNode::Empty { pattern }
                    }
                    1 => QueryNode::Exclusive {
                        pattern,
                        source: sources.remove(0),
                        filter: None,
                    },
                    _ => QueryNode::SourcePattern { pattern, sources },
                }
            }
            QueryNode::Join { children } => QueryNode::Join {
                children: children.into_iter().map(|c| self.rewrite(c)).collect(),
            },
            QueryNode::Union { children } => QueryNode::Union {
                children: children.into_iter().map(|c| self.rewrite(c)).collect(),
            },
            QueryNode::BoundJoin { left, right } => QueryNode::BoundJoin {
                left: Box::new(self.rewrite(*left)),
                right: Box::new(self.rewrite(*right)),
            },
            QueryNode::Filter { expr, child } => QueryNode::Filter {
                expr,
                child: Box::new(self.rewrite(*child)),
            },
            QueryNode::Projection { variables, child } => QueryNode::Projection {
                variables,
                child: Box::new(self.rewrite(*child)),
            },
            annotated => annotated,
        }
    }

    /// The set of members that contribute to at least one pattern.
    pub fn relevant_sources(&self) -> Vec<Arc<Endpoint>> {
        let mut seen = std::collections::BTreeSet::new();
        let mut endpoints = Vec::new();
        for entry in self.sources.iter() {
            for source in entry.value() {
                if seen.insert(source.endpoint.clone()) {
                    if let Some(endpoint) = self.ctx.registry().get(&source.endpoint) {
                        endpoints.push(endpoint);
                    }
                }
            }
        }
        endpoints
    }
}
