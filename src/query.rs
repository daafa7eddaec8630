//! Per-query context and lifecycle management.
//!
//! A [`QueryInfo`] is created when a query enters evaluation and lives
//! until its result stream is closed. Every worker task carries a
//! reference to it and observes the abort flag cooperatively. The
//! [`QueryManager`] tracks in-flight queries so the engine can abort them
//! all on shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FederationError, Result};
use crate::model::BindingSet;
use crate::monitoring::MonitoringService;
use crate::triple_source::BindingStream;

/// Counters accumulated while a query runs.
#[derive(Debug, Default)]
pub struct QueryStats {
    rows_produced: AtomicU64,
    remote_requests: AtomicU64,
}

impl QueryStats {
    pub fn rows_produced(&self) -> u64 {
        self.rows_produced.load(Ordering::Relaxed)
    }

    pub fn remote_requests(&self) -> u64 {
        self.remote_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn count_row(&self) {
        self.rows_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_remote_request(&self) {
        self.remote_requests.fetch_add(1, Ordering::Relaxed);
    }
}

/// Context of one query evaluation.
#[derive(Debug)]
pub struct QueryInfo {
    id: u64,
    query: String,
    start: Instant,
    max_execution_time: Duration,
    aborted: AtomicBool,
    abort_notify: tokio::sync::Notify,
    error: Mutex<Option<FederationError>>,
    stats: QueryStats,
}

impl QueryInfo {
    pub(crate) fn new(id: u64, query: impl Into<String>, max_execution_time: Duration) -> Self {
        QueryInfo {
            id,
            query: query.into(),
            start: Instant::now(),
            max_execution_time,
            aborted: AtomicBool::new(false),
            abort_notify: tokio::sync::Notify::new(),
            error: Mutex::new(None),
            stats: QueryStats::default(),
        }
    }

    pub fn query_id(&self) -> u64 {
        self.id
    }

    pub fn query_string(&self) -> &str {
        &self.query
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn max_execution_time(&self) -> Duration {
        self.max_execution_time
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Time budget left before the query deadline. All blocking waits
    /// derive their timeout from this.
    pub fn remaining_time(&self) -> Duration {
        self.max_execution_time.saturating_sub(self.start.elapsed())
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Request cooperative termination of all tasks of this query.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            debug!(query_id = self.id, "query aborted");
        }
        self.abort_notify.notify_waiters();
    }

    /// Resolves once the query is aborted; used by consumers to stop
    /// waiting on producers that will never deliver.
    pub async fn wait_aborted(&self) {
        loop {
            let notified = self.abort_notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Cancellation check for operator pull loops and task dequeue.
    pub fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(self.abort_error())
        } else {
            Ok(())
        }
    }

    /// Record the first error raised by any task and abort the query.
    /// Later errors are logged and discarded.
    pub fn record_error(&self, error: FederationError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            } else {
                debug!(query_id = self.id, %error, "subsequent query error discarded");
            }
        }
        self.abort();
    }

    /// The recorded failure, if any.
    pub fn error(&self) -> Option<FederationError> {
        self.error.lock().clone()
    }

    /// The error consumers observe for this aborted query: the recorded
    /// failure, or a plain cancellation.
    pub fn abort_error(&self) -> FederationError {
        self.error()
            .unwrap_or(FederationError::Cancelled { query_id: self.id })
    }
}

/// Registry of in-flight queries.
#[derive(Debug, Default)]
pub struct QueryManager {
    next_id: AtomicU64,
    active: DashMap<u64, Arc<QueryInfo>>,
}

impl QueryManager {
    pub fn new() -> Self {
        QueryManager::default()
    }

    /// Create and register the context for a new evaluation.
    pub fn register(&self, query: &str, max_execution_time: Duration) -> Arc<QueryInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = Arc::new(QueryInfo::new(id, query, max_execution_time));
        self.active.insert(id, info.clone());
        info
    }

    pub fn finish(&self, query: &QueryInfo) {
        self.active.remove(&query.query_id());
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Abort every in-flight query, used on engine shutdown.
    pub fn abort_all(&self) {
        for entry in self.active.iter() {
            entry.value().abort();
        }
    }
}

/// Streaming result of a federated query.
///
/// Rows arrive as the federation members deliver them; order across
/// sources is unspecified. Dropping the result aborts outstanding work.
pub struct QueryResult {
    stream: BindingStream,
    variables: Vec<String>,
    query: Arc<QueryInfo>,
    manager: Arc<QueryManager>,
    monitoring: MonitoringService,
    error_surfaced: bool,
    closed: bool,
}

impl QueryResult {
    pub(crate) fn new(
        stream: BindingStream,
        variables: Vec<String>,
        query: Arc<QueryInfo>,
        manager: Arc<QueryManager>,
        monitoring: MonitoringService,
    ) -> Self {
        QueryResult {
            stream,
            variables,
            query,
            manager,
            monitoring,
            error_surfaced: false,
            closed: false,
        }
    }

    /// The projected variable names of the query.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn query_info(&self) -> &Arc<QueryInfo> {
        &self.query
    }

    /// Pull the next row. After the underlying stream is exhausted a
    /// recorded failure is surfaced exactly once; a plain cancellation
    /// ends the stream silently within one poll.
    pub async fn next(&mut self) -> Option<Result<BindingSet>> {
        let query = self.query.clone();
        // an abort ends the pull even when all producers are stalled
        let item = tokio::select! {
            item = self.stream.next() => item,
            _ = query.wait_aborted() => None,
        };
        match item {
            Some(Ok(row)) => {
                self.query.stats().count_row();
                Some(Ok(row))
            }
            Some(Err(error)) => {
                self.error_surfaced = true;
                self.query.record_error(error.clone());
                Some(Err(error))
            }
            None => {
                let error = self.query.error()?;
                if self.error_surfaced || error.is_cancellation() {
                    return None;
                }
                self.error_surfaced = true;
                Some(Err(error))
            }
        }
    }

    /// Drain the remaining rows into a vector.
    pub async fn into_bindings(mut self) -> Result<Vec<BindingSet>> {
        let mut rows = Vec::new();
        while let Some(next) = self.next().await {
            rows.push(next?);
        }
        self.close()?;
        Ok(rows)
    }

    /// Abort the query without consuming further rows.
    pub fn abort(&self) {
        self.query.abort();
    }

    /// Close the stream and release all resources held by the query.
    /// Raises if the query aborted with a failure.
    pub fn close(&mut self) -> Result<()> {
        self.stream.close();
        self.finish();
        match self.query.error() {
            Some(error) if !self.error_surfaced && !error.is_cancellation() => {
                self.error_surfaced = true;
                Err(error)
            }
            _ => Ok(()),
        }
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.manager.finish(&self.query);
        self.monitoring.query_finished(
            self.query.query_id(),
            self.query.start_time().elapsed(),
            self.query.is_aborted(),
        );
    }
}

impl Drop for QueryResult {
    fn drop(&mut self) {
        // release outstanding producers even if the consumer walked away
        self.query.abort();
        self.stream.close();
        self.finish();
    }
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("query_id", &self.query.query_id())
            .field("variables", &self.variables)
            .finish()
    }
}
