//! Engine and federation-member configuration.
//!
//! [`FederationConfig`] carries the engine knobs (scheduler sizing, bound
//! join block size, timeouts, cache spec). It can be deserialized with
//! serde or parsed from `key=value` property lines, the format the
//! original configuration files use. [`MemberConfig`] describes one
//! federation member declaratively.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointType;
use crate::error::{FederationError, Result};

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FederationConfig {
    /// Maximum number of distinct subqueries kept in the source selection
    /// cache before least-recently-used entries are evicted.
    pub source_selection_cache_size: usize,
    /// Worker count of the join scheduler. `0` selects `2 x CPU count`.
    pub join_worker_threads: usize,
    /// Worker count of the union scheduler. `0` selects `CPU count`.
    pub union_worker_threads: usize,
    /// Number of left bindings grouped into one bound-join sub-query.
    pub bound_join_block_size: usize,
    /// Global per-query execution time limit in seconds.
    pub enforce_max_query_time: u64,
    /// Whether remote requests and query lifecycle are reported to the
    /// monitoring sink.
    pub enable_monitoring: bool,
    /// Emit the rewritten query plan through the tracing subscriber.
    pub debug_query_plan: bool,
    /// Capacity of the bounded buffer between a remote result stream and
    /// its consumer.
    pub stream_buffer_size: usize,
    /// Upper bound for a single remote HTTP request.
    pub request_timeout: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        FederationConfig {
            source_selection_cache_size: 10_000,
            join_worker_threads: 0,
            union_worker_threads: 0,
            bound_join_block_size: 20,
            enforce_max_query_time: 30,
            enable_monitoring: false,
            debug_query_plan: false,
            stream_buffer_size: 1_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl FederationConfig {
    /// Parse configuration from `key=value` property lines. Empty lines
    /// and lines starting with `#` are skipped. Unknown keys are rejected.
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut config = FederationConfig::default();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                FederationError::Config(format!(
                    "line {}: expected key=value, got '{line}'",
                    line_no + 1
                ))
            })?;
            config.apply_property(key.trim(), value.trim())?;
        }
        Ok(config)
    }

    fn apply_property(&mut self, key: &str, value: &str) -> Result<()> {
        fn number(key: &str, value: &str) -> Result<usize> {
            value.parse().map_err(|_| {
                FederationError::Config(format!("invalid numeric value '{value}' for {key}"))
            })
        }
        fn boolean(key: &str, value: &str) -> Result<bool> {
            value.parse().map_err(|_| {
                FederationError::Config(format!("invalid boolean value '{value}' for {key}"))
            })
        }

        match key {
            "sourceSelectionCacheSpec" => {
                self.source_selection_cache_size = parse_cache_spec(value)?
            }
            "joinWorkerThreads" => self.join_worker_threads = number(key, value)?,
            "unionWorkerThreads" => self.union_worker_threads = number(key, value)?,
            "boundJoinBlockSize" => {
                let size = number(key, value)?;
                if size == 0 {
                    return Err(FederationError::Config(
                        "boundJoinBlockSize must be positive".into(),
                    ));
                }
                self.bound_join_block_size = size;
            }
            "enforceMaxQueryTime" => self.enforce_max_query_time = number(key, value)? as u64,
            "enableMonitoring" => self.enable_monitoring = boolean(key, value)?,
            "debugQueryPlan" => self.debug_query_plan = boolean(key, value)?,
            "streamBufferSize" => self.stream_buffer_size = number(key, value)?,
            "requestTimeout" => {
                self.request_timeout = Duration::from_secs(number(key, value)? as u64)
            }
            other => {
                return Err(FederationError::Config(format!(
                    "unknown configuration key '{other}'"
                )))
            }
        }
        Ok(())
    }

    /// Effective join pool size.
    pub fn join_workers(&self) -> usize {
        match self.join_worker_threads {
            0 => 2 * available_parallelism(),
            n => n,
        }
    }

    /// Effective union pool size, kept smaller than the join pool so union
    /// workers are not starved by join tasks.
    pub fn union_workers(&self) -> usize {
        match self.union_worker_threads {
            0 => available_parallelism(),
            n => n,
        }
    }

    /// Global query deadline.
    pub fn max_query_time(&self) -> Duration {
        Duration::from_secs(self.enforce_max_query_time)
    }
}

fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Parse a cache spec of the form `lru:<size>` or a bare size.
fn parse_cache_spec(value: &str) -> Result<usize> {
    let size = match value.split_once(':') {
        Some(("lru", size)) => size,
        Some((kind, _)) => {
            return Err(FederationError::Config(format!(
                "unsupported cache type '{kind}', only 'lru' is available"
            )))
        }
        None => value,
    };
    size.trim().parse().map_err(|_| {
        FederationError::Config(format!("invalid cache spec '{value}'"))
    })
}

/// Declarative description of one federation member.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    /// SPARQL endpoint URL for remote members, a store identifier for
    /// local ones.
    pub location: String,
    /// Whether the endpoint answers SPARQL `ASK`. When `false`, probes
    /// fall back to `SELECT ... LIMIT 1`.
    #[serde(default = "default_true")]
    pub supports_ask_queries: bool,
    #[serde(default)]
    pub writable: bool,
}

fn default_true() -> bool {
    true
}

impl MemberConfig {
    /// A remote SPARQL endpoint member with defaults.
    pub fn sparql(id: impl Into<String>, location: impl Into<String>) -> Self {
        let id = id.into();
        MemberConfig {
            name: id.clone(),
            id,
            endpoint_type: EndpointType::SparqlEndpoint,
            location: location.into(),
            supports_ask_queries: true,
            writable: false,
        }
    }

    /// Parse a JSON array of members.
    pub fn parse_members(json: &str) -> Result<Vec<MemberConfig>> {
        serde_json::from_str(json)
            .map_err(|e| FederationError::Config(format!("invalid member config: {e}")))
    }
}
