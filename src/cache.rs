//! Source selection cache.
//!
//! Maps a normalised subquery to the per-endpoint knowledge about whether
//! that endpoint can contribute statements. A hit short-circuits the
//! remote ASK probe during source selection. Entries are monotone within a
//! query: a definite positive is never downgraded to [`SourceAssurance::None`].
//! The map is LRU-capped so long-lived federations with many distinct
//! triple patterns stay memory-bounded.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::algebra::{SourceKind, SubQueryKey};
use crate::endpoint::EndpointId;

/// What the cache knows about an `(subquery, endpoint)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceAssurance {
    /// The co-located store of this endpoint holds matching statements.
    HasLocalStatements,
    /// The remote endpoint answered a probe positively.
    HasRemoteStatements,
    /// Nothing is known yet; a probe is required.
    PossiblyHasStatements,
    /// A probe answered negatively; the endpoint cannot contribute.
    None,
}

impl SourceAssurance {
    pub fn is_definite_positive(&self) -> bool {
        matches!(
            self,
            SourceAssurance::HasLocalStatements | SourceAssurance::HasRemoteStatements
        )
    }
}

/// Process-wide `(subquery, endpoint) -> assurance` map.
pub struct SourceSelectionCache {
    entries: Mutex<LruCache<SubQueryKey, HashMap<EndpointId, SourceAssurance>>>,
}

impl SourceSelectionCache {
    /// Create a cache holding at most `capacity` distinct subqueries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        SourceSelectionCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up the assurance for a pair. Unknown pairs report
    /// [`SourceAssurance::PossiblyHasStatements`], which makes the caller
    /// schedule a probe.
    pub fn can_provide_statements(
        &self,
        subquery: &SubQueryKey,
        endpoint: &EndpointId,
    ) -> SourceAssurance {
        let mut entries = self.entries.lock();
        entries
            .get(subquery)
            .and_then(|per_endpoint| per_endpoint.get(endpoint).copied())
            .unwrap_or(SourceAssurance::PossiblyHasStatements)
    }

    /// Record a probe outcome. `has_results == true` stores a definite
    /// positive matching the endpoint kind; `false` stores
    /// [`SourceAssurance::None`] unless a definite positive is already
    /// present (updates are monotone per slot).
    pub fn update_entry(
        &self,
        subquery: &SubQueryKey,
        endpoint: &EndpointId,
        kind: SourceKind,
        has_results: bool,
    ) {
        let assurance = match (has_results, kind) {
            (true, SourceKind::Local) => SourceAssurance::HasLocalStatements,
            (true, SourceKind::Remote) => SourceAssurance::HasRemoteStatements,
            (false, _) => SourceAssurance::None,
        };
        let mut entries = self.entries.lock();
        if !entries.contains(subquery) {
            entries.put(subquery.clone(), HashMap::new());
        }
        let per_endpoint = entries.get_mut(subquery).expect("entry was just ensured");
        let slot = per_endpoint
            .entry(endpoint.clone())
            .or_insert(SourceAssurance::PossiblyHasStatements);
        if slot.is_definite_positive() && assurance == SourceAssurance::None {
            return;
        }
        *slot = assurance;
    }

    /// Number of cached subqueries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for SourceSelectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSelectionCache")
            .field("subqueries", &self.len())
            .finish()
    }
}
