//! Parallel evaluation of the rewritten algebra.
//!
//! Every node produces a lazy stream of binding sets consumed by its
//! parent. Exclusive statements and groups ship one sub-query to their
//! only source; multi-source patterns and unions merge per-source streams
//! through the union worker pool as they arrive; joins are evaluated
//! left-deep with per-binding tasks on the join pool; bound joins batch
//! left bindings into one `VALUES` sub-query per endpoint and re-associate
//! result rows through a hidden index variable. Every producer observes
//! the query abort flag at its next pull, so closing the consumer tears
//! the whole tree down and with it the remote streams.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::algebra::{FilterExpr, QueryNode, StatementSource, TriplePattern};
use crate::error::{FederationError, Result};
use crate::model::{BindingSet, Term};
use crate::planner::ExecutionPlan;
use crate::query::QueryInfo;
use crate::sparql::{self, INDEX_VAR};
use crate::triple_source::{BindingStream, LocalQuery, PreparedQuery};
use crate::FederationContext;

type RowSender = mpsc::Sender<Result<BindingSet>>;

/// Evaluates execution plans against the federation.
pub struct ParallelEvaluator {
    ctx: FederationContext,
}

impl ParallelEvaluator {
    pub fn new(ctx: FederationContext) -> Self {
        ParallelEvaluator { ctx }
    }

    /// Start evaluation of a plan, returning the streaming result. The
    /// final projection, DISTINCT and LIMIT/OFFSET are applied here.
    pub fn evaluate(&self, plan: &ExecutionPlan, query: &Arc<QueryInfo>) -> BindingStream {
        let mut inner = eval_node(
            self.ctx.clone(),
            query.clone(),
            plan.root.clone(),
            BindingSet::new(),
        );
        let projection = plan.projection.clone();
        let distinct = plan.distinct;
        let limit = plan.limit;
        let offset = plan.offset;

        let (tx, mut out) = BindingStream::channel(self.ctx.config().stream_buffer_size);
        let query = query.clone();
        let producer = tokio::spawn(async move {
            let mut seen: HashSet<BindingSet> = HashSet::new();
            let mut skipped = 0usize;
            let mut emitted = 0usize;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(row) => {
                        if query.is_aborted() {
                            break;
                        }
                        let row = if projection.is_empty() {
                            row
                        } else {
                            row.project(&projection)
                        };
                        if distinct && !seen.insert(row.clone()) {
                            continue;
                        }
                        if skipped < offset {
                            skipped += 1;
                            continue;
                        }
                        if let Some(limit) = limit {
                            if emitted >= limit {
                                break;
                            }
                        }
                        if tx.send(Ok(row)).await.is_err() {
                            break;
                        }
                        emitted += 1;
                    }
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                }
            }
        });
        out.attach_producer(producer.abort_handle());
        out
    }
}

/// Evaluate one node under the given outer bindings.
fn eval_node(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    node: QueryNode,
    input: BindingSet,
) -> BindingStream {
    match node {
        // no source can answer: zero rows, no I/O
        QueryNode::Empty { .. } => BindingStream::empty(),
        QueryNode::Exclusive {
            pattern,
            source,
            filter,
        } => eval_on_single_source(ctx, query, vec![pattern], source, filter, input),
        QueryNode::ExclusiveGroup {
            patterns,
            source,
            filter,
        } => eval_on_single_source(ctx, query, patterns, source, filter, input),
        QueryNode::SourcePattern { pattern, sources } => {
            eval_source_union(ctx, query, pattern, sources, input)
        }
        QueryNode::Join { children } => {
            // a conjunction with an unanswerable pattern yields nothing
            if children.iter().any(|c| matches!(c, QueryNode::Empty { .. })) {
                return BindingStream::empty();
            }
            let mut children = children.into_iter();
            let mut stream = match children.next() {
                Some(first) => eval_node(ctx.clone(), query.clone(), first, input.clone()),
                // an empty conjunction yields a single empty row
                None => BindingStream::from_rows(vec![input.clone()]),
            };
            for child in children {
                stream = eval_join(ctx.clone(), query.clone(), stream, child);
            }
            stream
        }
        QueryNode::BoundJoin { left, right } => {
            let left_stream = eval_node(ctx.clone(), query.clone(), *left, input);
            eval_bound_join(ctx, query, left_stream, *right)
        }
        QueryNode::Union { children } => eval_union(ctx, query, children, input),
        QueryNode::Filter { expr, child } => {
            let inner = eval_node(ctx.clone(), query.clone(), *child, input);
            eval_filter(ctx, query, expr, inner)
        }
        QueryNode::Projection { variables, child } => {
            let inner = eval_node(ctx.clone(), query.clone(), *child, input);
            eval_projection(ctx, query, variables, inner)
        }
        QueryNode::Pattern { pattern } => BindingStream::from_error(FederationError::Optimization(
            format!("pattern '{pattern}' reached evaluation without source annotation"),
        )),
    }
}

/// Prepare the sub-query for one member: SPARQL text for endpoints that
/// accept it, the algebra for co-located stores.
async fn open_source_stream(
    ctx: &FederationContext,
    query: &Arc<QueryInfo>,
    patterns: &[TriplePattern],
    filter: Option<&FilterExpr>,
    source: &StatementSource,
    input: &BindingSet,
) -> Result<BindingStream> {
    let endpoint = ctx.registry().get(&source.endpoint).ok_or_else(|| {
        FederationError::evaluation(&source.endpoint, "endpoint is not registered")
    })?;
    let triple_source = endpoint.triple_source()?;
    let bound: Vec<TriplePattern> = patterns.iter().map(|p| p.bind(input)).collect();
    let prepared = if triple_source.use_prepared_query() {
        PreparedQuery::Sparql(sparql::select_query(&bound, filter))
    } else {
        PreparedQuery::Algebra(LocalQuery {
            patterns: bound,
            filter: filter.cloned(),
        })
    };
    if source.kind == crate::algebra::SourceKind::Remote {
        query.stats().count_remote_request();
    }
    triple_source
        .evaluate(prepared, input, Some(query.remaining_time()))
        .await
}

/// Evaluation of an exclusive statement or group: one sub-query against
/// the only source that can answer it.
fn eval_on_single_source(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    patterns: Vec<TriplePattern>,
    source: StatementSource,
    filter: Option<FilterExpr>,
    input: BindingSet,
) -> BindingStream {
    let (tx, mut out) = BindingStream::channel(ctx.config().stream_buffer_size);
    let producer = tokio::spawn(async move {
        match open_source_stream(&ctx, &query, &patterns, filter.as_ref(), &source, &input).await {
            Ok(stream) => forward_rows(stream, &tx, &query).await,
            Err(error) => fail(&tx, &query, error).await,
        }
    });
    out.attach_producer(producer.abort_handle());
    out
}

/// A multi-source pattern: per-source sub-evaluations merged through the
/// union pool as they arrive. Output order across sources is unspecified.
fn eval_source_union(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    pattern: TriplePattern,
    sources: Vec<StatementSource>,
    input: BindingSet,
) -> BindingStream {
    let (tx, out) = BindingStream::channel(ctx.config().stream_buffer_size);
    for source in sources {
        let ctx_for_task = ctx.clone();
        let task_query = query.clone();
        let pattern = pattern.clone();
        let input = input.clone();
        let task_tx = tx.clone();
        let scheduled = ctx.union_scheduler().schedule(query.clone(), async move {
            let patterns = std::slice::from_ref(&pattern);
            match open_source_stream(&ctx_for_task, &task_query, patterns, None, &source, &input)
                .await
            {
                Ok(stream) => forward_rows(stream, &task_tx, &task_query).await,
                Err(error) => fail(&task_tx, &task_query, error).await,
            }
        });
        if let Err(error) = scheduled {
            let query = query.clone();
            let tx = tx.clone();
            tokio::spawn(async move { fail(&tx, &query, error).await });
        }
    }
    // the channel closes once every per-source task dropped its sender
    out
}

/// Bag union over arbitrary children.
fn eval_union(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    children: Vec<QueryNode>,
    input: BindingSet,
) -> BindingStream {
    let (tx, out) = BindingStream::channel(ctx.config().stream_buffer_size);
    for child in children {
        let ctx_for_task = ctx.clone();
        let task_query = query.clone();
        let input = input.clone();
        let task_tx = tx.clone();
        let scheduled = ctx.union_scheduler().schedule(query.clone(), async move {
            let mut stream = eval_node(ctx_for_task, task_query.clone(), child, input);
            forward_rows_stream(&mut stream, &task_tx, &task_query).await;
        });
        if let Err(error) = scheduled {
            let query = query.clone();
            let tx = tx.clone();
            tokio::spawn(async move { fail(&tx, &query, error).await });
        }
    }
    out
}

/// Left-deep join: each left row spawns one evaluation of the right side
/// with the row's bindings applied, on the join pool.
fn eval_join(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    mut left: BindingStream,
    right: QueryNode,
) -> BindingStream {
    let (tx, mut out) = BindingStream::channel(ctx.config().stream_buffer_size);
    let driver_query = query.clone();
    let driver = tokio::spawn(async move {
        while let Some(item) = left.next().await {
            if driver_query.is_aborted() {
                break;
            }
            let row = match item {
                Ok(row) => row,
                Err(error) => {
                    fail(&tx, &driver_query, error).await;
                    break;
                }
            };
            let ctx_for_task = ctx.clone();
            let task_query = driver_query.clone();
            let right = right.clone();
            let tx_task = tx.clone();
            let scheduled = ctx.join_scheduler().schedule(driver_query.clone(), async move {
                let mut stream = eval_node(ctx_for_task, task_query.clone(), right, row);
                forward_rows_stream(&mut stream, &tx_task, &task_query).await;
            });
            if let Err(error) = scheduled {
                fail(&tx, &driver_query, error).await;
                break;
            }
        }
    });
    out.attach_producer(driver.abort_handle());
    out
}

/// Bound join: batch left rows and push each batch as one `VALUES`
/// sub-query per source of the right side.
fn eval_bound_join(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    mut left: BindingStream,
    right: QueryNode,
) -> BindingStream {
    let (patterns, sources, filter) = match right {
        QueryNode::SourcePattern { pattern, sources } => (vec![pattern], sources, None),
        QueryNode::Exclusive {
            pattern,
            source,
            filter,
        } => (vec![pattern], vec![source], filter),
        QueryNode::ExclusiveGroup {
            patterns,
            source,
            filter,
        } => (patterns, vec![source], filter),
        // anything else degrades to the generic join
        other => return eval_join(ctx, query, left, other),
    };

    let block_size = ctx.config().bound_join_block_size.max(1);
    let (tx, mut out) = BindingStream::channel(ctx.config().stream_buffer_size);
    let driver_query = query.clone();
    let driver = tokio::spawn(async move {
        let mut batch: Vec<BindingSet> = Vec::with_capacity(block_size);
        loop {
            let item = left.next().await;
            match item {
                Some(Ok(row)) => {
                    if driver_query.is_aborted() {
                        break;
                    }
                    batch.push(row);
                    if batch.len() >= block_size {
                        dispatch_batch(
                            &ctx,
                            &driver_query,
                            &patterns,
                            &sources,
                            filter.as_ref(),
                            std::mem::take(&mut batch),
                            &tx,
                        );
                    }
                }
                Some(Err(error)) => {
                    fail(&tx, &driver_query, error).await;
                    break;
                }
                None => {
                    if !batch.is_empty() && !driver_query.is_aborted() {
                        dispatch_batch(
                            &ctx,
                            &driver_query,
                            &patterns,
                            &sources,
                            filter.as_ref(),
                            batch,
                            &tx,
                        );
                    }
                    break;
                }
            }
        }
    });
    out.attach_producer(driver.abort_handle());
    out
}

/// Ship one batch to every source of the right side.
fn dispatch_batch(
    ctx: &FederationContext,
    query: &Arc<QueryInfo>,
    patterns: &[TriplePattern],
    sources: &[StatementSource],
    filter: Option<&FilterExpr>,
    batch: Vec<BindingSet>,
    tx: &RowSender,
) {
    let batch = Arc::new(batch);
    for source in sources {
        let ctx_for_task = ctx.clone();
        let task_query = query.clone();
        let patterns = patterns.to_vec();
        let source = source.clone();
        let filter = filter.cloned();
        let batch = batch.clone();
        let tx_task = tx.clone();
        let scheduled = ctx.join_scheduler().schedule(query.clone(), async move {
            if let Err(error) = eval_batch_on_source(
                &ctx_for_task,
                &task_query,
                &patterns,
                &source,
                filter.as_ref(),
                &batch,
                &tx_task,
            )
            .await
            {
                fail(&tx_task, &task_query, error).await;
            }
        });
        if let Err(error) = scheduled {
            query.record_error(error);
        }
    }
}

async fn eval_batch_on_source(
    ctx: &FederationContext,
    query: &Arc<QueryInfo>,
    patterns: &[TriplePattern],
    source: &StatementSource,
    filter: Option<&FilterExpr>,
    batch: &Arc<Vec<BindingSet>>,
    tx: &RowSender,
) -> Result<()> {
    let endpoint = ctx.registry().get(&source.endpoint).ok_or_else(|| {
        FederationError::evaluation(&source.endpoint, "endpoint is not registered")
    })?;
    let triple_source = endpoint.triple_source()?;

    if triple_source.use_prepared_query() {
        // one VALUES sub-query for the whole batch
        if source.kind == crate::algebra::SourceKind::Remote {
            query.stats().count_remote_request();
        }
        let text = sparql::bound_join_query(patterns, filter, batch);
        let mut stream = triple_source
            .evaluate(
                PreparedQuery::Sparql(text),
                &BindingSet::new(),
                Some(query.remaining_time()),
            )
            .await?;
        while let Some(item) = stream.next().await {
            if query.is_aborted() {
                break;
            }
            let row = item?;
            let index = batch_index(&row, &source.endpoint)?;
            let left = batch.get(index).ok_or_else(|| {
                FederationError::evaluation(
                    &source.endpoint,
                    format!("bound join row index {index} out of range"),
                )
            })?;
            if let Some(merged) = row.without(INDEX_VAR).merge_compatible(left) {
                if tx.send(Ok(merged)).await.is_err() {
                    break;
                }
            }
        }
    } else {
        // local members are evaluated per left binding
        for left in batch.iter() {
            if query.is_aborted() {
                break;
            }
            let local = LocalQuery {
                patterns: patterns.iter().map(|p| p.bind(left)).collect(),
                filter: filter.cloned(),
            };
            let mut stream = triple_source
                .evaluate(
                    PreparedQuery::Algebra(local),
                    left,
                    Some(query.remaining_time()),
                )
                .await?;
            forward_rows_stream(&mut stream, tx, query).await;
        }
    }
    Ok(())
}

/// Pull the hidden row index out of a bound-join result row.
fn batch_index(row: &BindingSet, endpoint: &crate::endpoint::EndpointId) -> Result<usize> {
    let term = row.get(INDEX_VAR).ok_or_else(|| {
        FederationError::evaluation(endpoint, "bound join result misses the row index")
    })?;
    match term {
        Term::Literal(literal) => literal.value().trim().parse().map_err(|_| {
            FederationError::evaluation(
                endpoint,
                format!("invalid bound join row index '{}'", literal.value()),
            )
        }),
        other => Err(FederationError::evaluation(
            endpoint,
            format!("unexpected bound join row index term {other}"),
        )),
    }
}

/// Local filter evaluation, dropping failing rows.
fn eval_filter(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    expr: FilterExpr,
    mut inner: BindingStream,
) -> BindingStream {
    let (tx, mut out) = BindingStream::channel(ctx.config().stream_buffer_size);
    let producer = tokio::spawn(async move {
        while let Some(item) = inner.next().await {
            if query.is_aborted() {
                break;
            }
            match item {
                Ok(row) => {
                    if expr.matches(&row) && tx.send(Ok(row)).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    fail(&tx, &query, error).await;
                    break;
                }
            }
        }
    });
    out.attach_producer(producer.abort_handle());
    out
}

/// Restrict visible variables; cardinality is unchanged.
fn eval_projection(
    ctx: FederationContext,
    query: Arc<QueryInfo>,
    variables: Vec<String>,
    mut inner: BindingStream,
) -> BindingStream {
    let (tx, mut out) = BindingStream::channel(ctx.config().stream_buffer_size);
    let producer = tokio::spawn(async move {
        while let Some(item) = inner.next().await {
            if query.is_aborted() {
                break;
            }
            let item = item.map(|row| row.project(&variables));
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    out.attach_producer(producer.abort_handle());
    out
}

/// Forward all rows of `stream` into `tx`, observing the abort flag.
async fn forward_rows(stream: BindingStream, tx: &RowSender, query: &Arc<QueryInfo>) {
    let mut stream = stream;
    forward_rows_stream(&mut stream, tx, query).await;
}

async fn forward_rows_stream(stream: &mut BindingStream, tx: &RowSender, query: &Arc<QueryInfo>) {
    while let Some(item) = stream.next().await {
        if query.is_aborted() {
            break;
        }
        match item {
            Ok(row) => {
                if tx.send(Ok(row)).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                fail(tx, query, error).await;
                break;
            }
        }
    }
}

/// Record the first failure on the query (which aborts it) and hand the
/// error to the consumer.
async fn fail(tx: &RowSender, query: &Arc<QueryInfo>, error: FederationError) {
    debug!(query_id = query.query_id(), %error, "evaluation task failed");
    query.record_error(error.clone());
    let _ = tx.send(Err(error)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointId;
    use crate::model::Literal;

    #[test]
    fn batch_index_parses_integer_literals() {
        let endpoint = EndpointId::new("a");
        let row = BindingSet::from_iter([(INDEX_VAR, Term::Literal(Literal::integer(3)))]);
        assert_eq!(batch_index(&row, &endpoint).unwrap(), 3);
    }

    #[test]
    fn batch_index_rejects_missing_or_malformed() {
        let endpoint = EndpointId::new("a");
        assert!(batch_index(&BindingSet::new(), &endpoint).is_err());
        let bad = BindingSet::from_iter([(INDEX_VAR, Term::iri("http://example.org/3"))]);
        assert!(batch_index(&bad, &endpoint).is_err());
    }
}
