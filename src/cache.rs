//! Result cache: success-only reuse of completed work.
//!
//! The cache is a plain get/set store keyed by request
//! [`Fingerprint`](crate::fingerprint::Fingerprint). It holds terminal
//! successes only; failed and cancelled outcomes are never stored, so a
//! resubmission after a failure always dispatches again.
//!
//! This is deliberately **not** a single-flight store: two identical
//! requests submitted before the first completes will both dispatch, and
//! the later success overwrites the earlier entry. Eviction is an external
//! collaborator's concern; the in-memory implementation grows until entries
//! are overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;

use crate::fingerprint::Fingerprint;
use crate::types::{TaskResponse, TaskStatus};

/// A cached terminal success plus its creation time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stored success response.
    pub response: TaskResponse,
    /// When this entry was created (last overwrite).
    pub created_at: DateTime<Utc>,
}

/// Store for terminal success responses, keyed by request fingerprint.
///
/// Implementations must be safe for concurrent use; no cross-key
/// coordination is required.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Returns the cached entry for `fingerprint`, if any.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry>;

    /// Stores a success response, overwriting any prior entry.
    ///
    /// Non-success responses are refused: the success-only invariant is
    /// enforced here as well as at the call site.
    async fn store(&self, fingerprint: Fingerprint, response: TaskResponse);
}

/// Thread-safe in-memory [`ResultCache`] backed by a [`DashMap`].
///
/// # Examples
///
/// ```
/// use taskmill::cache::InMemoryResultCache;
///
/// let cache = InMemoryResultCache::new();
/// assert!(cache.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryResultCache {
    entries: DashMap<Fingerprint, CacheEntry>,
}

impl InMemoryResultCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.get(fingerprint).map(|e| e.value().clone())
    }

    async fn store(&self, fingerprint: Fingerprint, response: TaskResponse) {
        if response.status != TaskStatus::Success {
            warn!(
                id = %response.id,
                status = %response.status,
                "refusing to cache non-success response"
            );
            return;
        }
        self.entries.insert(
            fingerprint,
            CacheEntry {
                response,
                created_at: Utc::now(),
            },
        );
    }
}
