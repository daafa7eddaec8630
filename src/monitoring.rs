//! Pluggable statistics sink.
//!
//! Every remote request and query lifecycle event is reported through a
//! [`MonitoringSink`]. The default sink discards everything; the
//! [`InMemoryMonitoring`] sink keeps per-endpoint counters and is mainly
//! used by tests and the engine's own reporting. Monitoring is gated by
//! `enableMonitoring` so the hot path stays cheap when disabled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::endpoint::EndpointId;

/// Receiver of engine statistics events.
pub trait MonitoringSink: Send + Sync {
    /// A remote request is about to be issued against `endpoint`.
    fn remote_request(&self, _endpoint: &EndpointId) {}

    /// A query entered evaluation.
    fn query_started(&self, _query_id: u64) {}

    /// A query finished; `aborted` covers both cancellation and failure.
    fn query_finished(&self, _query_id: u64, _duration: Duration, _aborted: bool) {}
}

/// Sink that discards all events.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MonitoringSink for NoopSink {}

/// Counting sink keeping totals and per-endpoint request counts.
#[derive(Debug, Default)]
pub struct InMemoryMonitoring {
    remote_requests: AtomicU64,
    queries_started: AtomicU64,
    queries_aborted: AtomicU64,
    per_endpoint: DashMap<EndpointId, u64>,
}

impl InMemoryMonitoring {
    pub fn new() -> Self {
        InMemoryMonitoring::default()
    }

    pub fn remote_requests(&self) -> u64 {
        self.remote_requests.load(Ordering::Relaxed)
    }

    pub fn remote_requests_for(&self, endpoint: &EndpointId) -> u64 {
        self.per_endpoint.get(endpoint).map(|e| *e).unwrap_or(0)
    }

    pub fn queries_started(&self) -> u64 {
        self.queries_started.load(Ordering::Relaxed)
    }

    pub fn queries_aborted(&self) -> u64 {
        self.queries_aborted.load(Ordering::Relaxed)
    }
}

impl MonitoringSink for InMemoryMonitoring {
    fn remote_request(&self, endpoint: &EndpointId) {
        self.remote_requests.fetch_add(1, Ordering::Relaxed);
        *self.per_endpoint.entry(endpoint.clone()).or_insert(0) += 1;
    }

    fn query_started(&self, _query_id: u64) {
        self.queries_started.fetch_add(1, Ordering::Relaxed);
    }

    fn query_finished(&self, _query_id: u64, _duration: Duration, aborted: bool) {
        if aborted {
            self.queries_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Dispatches events to the configured sink when monitoring is enabled.
#[derive(Clone)]
pub struct MonitoringService {
    enabled: bool,
    sink: Arc<dyn MonitoringSink>,
}

impl MonitoringService {
    pub fn new(enabled: bool, sink: Arc<dyn MonitoringSink>) -> Self {
        MonitoringService { enabled, sink }
    }

    pub fn disabled() -> Self {
        MonitoringService {
            enabled: false,
            sink: Arc::new(NoopSink),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn remote_request(&self, endpoint: &EndpointId) {
        if self.enabled {
            self.sink.remote_request(endpoint);
        }
    }

    pub fn query_started(&self, query_id: u64) {
        if self.enabled {
            self.sink.query_started(query_id);
        }
    }

    pub fn query_finished(&self, query_id: u64, duration: Duration, aborted: bool) {
        if self.enabled {
            self.sink.query_finished(query_id, duration, aborted);
        }
    }
}

impl std::fmt::Debug for MonitoringService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringService")
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_service_does_not_count() {
        let sink = Arc::new(InMemoryMonitoring::new());
        let service = MonitoringService::new(false, sink.clone());
        service.remote_request(&EndpointId::new("a"));
        assert_eq!(sink.remote_requests(), 0);
    }

    #[test]
    fn per_endpoint_counters() {
        let sink = Arc::new(InMemoryMonitoring::new());
        let service = MonitoringService::new(true, sink.clone());
        let a = EndpointId::new("a");
        let b = EndpointId::new("b");
        service.remote_request(&a);
        service.remote_request(&a);
        service.remote_request(&b);
        assert_eq!(sink.remote_requests(), 3);
        assert_eq!(sink.remote_requests_for(&a), 2);
        assert_eq!(sink.remote_requests_for(&b), 1);
    }
}
