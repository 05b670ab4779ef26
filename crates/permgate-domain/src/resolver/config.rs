//! Configuration for the query resolver.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::PermissionCache;

/// Configuration for the query resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum number of subject resolutions running at once.
    ///
    /// Bounds load on the permission store when the cache is cold or
    /// unavailable.
    pub max_concurrency: usize,
    /// Timeout for a single subject resolution.
    pub timeout: Duration,
    /// Optional cache whose role tier holds expanded role chains.
    ///
    /// Consulted only for `Consistency::MinimizeLatency` resolutions.
    pub role_cache: Option<Arc<PermissionCache>>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            timeout: Duration::from_secs(30),
            role_cache: None,
        }
    }
}

impl ResolverConfig {
    /// Enables the role tier of the given cache.
    pub fn with_role_cache(mut self, cache: Arc<PermissionCache>) -> Self {
        self.role_cache = Some(cache);
        self
    }

    /// Sets the concurrency bound.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the resolution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
