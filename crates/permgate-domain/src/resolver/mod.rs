//! Query resolver for subject permission sets.
//!
//! The resolver turns the rows of the permission store into the full,
//! hierarchy-expanded permission set of a subject.
//!
//! # Architecture Decisions
//!
//! - **Iterative traversal**: both the permission tree and the role chain are
//!   walked with an explicit stack and a visited set, so corrupt store data
//!   (back-edges, role cycles) terminates in O(nodes) without deep recursion.
//!
//! - **Superuser short-circuit**: superusers resolve to an unconditional
//!   permission set without touching roles or permissions.
//!
//! - **Bounded concurrency**: a semaphore caps in-flight resolutions so a cold
//!   or unavailable cache cannot stampede the store.
//!
//! - **Timeout Handling**: every resolution is bounded by the configured
//!   timeout (default 30s).

mod config;
mod traits;
mod types;

#[cfg(test)]
mod tests;

pub use config::ResolverConfig;
pub use traits::PermissionSource;
pub use types::{
    Consistency, PermissionNode, ResolverStats, RoleSnapshot, SubjectSnapshot,
};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::cache::CachedRole;
use crate::error::{DomainError, DomainResult};
use crate::model::{Operation, PermissionId, RoleId, SubjectId, SubjectPermissions};

/// Expanded permissions of a role and its ancestors.
#[derive(Debug, Clone, Default)]
struct RoleExpansion {
    role_code: Option<String>,
    permission_codes: HashSet<String>,
    role_chain: Vec<RoleId>,
}

impl From<CachedRole> for RoleExpansion {
    fn from(cached: CachedRole) -> Self {
        Self {
            role_code: Some(cached.role_code),
            permission_codes: cached.permission_codes,
            role_chain: cached.role_chain,
        }
    }
}

/// Resolves subject permission sets from a [`PermissionSource`].
pub struct QueryResolver<S: PermissionSource> {
    source: Arc<S>,
    config: ResolverConfig,
    limiter: Semaphore,
    resolutions: AtomicU64,
    failures: AtomicU64,
    role_cache_hits: AtomicU64,
}

impl<S: PermissionSource> std::fmt::Debug for QueryResolver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResolver")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<S: PermissionSource> QueryResolver<S> {
    /// Creates a resolver with default configuration.
    pub fn new(source: Arc<S>) -> Self {
        Self::with_config(source, ResolverConfig::default())
    }

    /// Creates a resolver with custom configuration.
    pub fn with_config(source: Arc<S>, config: ResolverConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            source,
            config,
            limiter: Semaphore::new(permits),
            resolutions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            role_cache_hits: AtomicU64::new(0),
        }
    }

    /// Returns the configuration of this resolver.
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Returns activity counters.
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            resolutions: self.resolutions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            role_cache_hits: self.role_cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Resolves the complete permission set of one subject.
    #[instrument(skip(self))]
    pub async fn resolve_subject_permissions(
        &self,
        subject_id: SubjectId,
        consistency: Consistency,
    ) -> DomainResult<SubjectPermissions> {
        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| DomainError::ResolverError {
                message: "resolver is shut down".to_string(),
            })?;

        let result = match timeout(
            self.config.timeout,
            self.resolve_inner(subject_id, consistency),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DomainError::Timeout {
                duration_ms: self.config.timeout.as_millis() as u64,
            }),
        };

        metrics::histogram!("permgate_resolve_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Resolves many subjects concurrently.
    ///
    /// Duplicate IDs are resolved once. Each subject gets its own result so
    /// one failing subject does not abort the others.
    pub async fn resolve_many(
        &self,
        subject_ids: &[SubjectId],
        consistency: Consistency,
    ) -> HashMap<SubjectId, DomainResult<SubjectPermissions>> {
        let mut seen = HashSet::with_capacity(subject_ids.len());
        let unique: Vec<SubjectId> = subject_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        debug!(count = unique.len(), ?consistency, "resolving subjects in batch");

        stream::iter(unique)
            .map(|id| async move { (id, self.resolve_subject_permissions(id, consistency).await) })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await
    }

    /// Decides whether the subject may perform `operation` on one resource instance.
    ///
    /// Reads only the subject row and its grants; roles are not consulted.
    pub async fn resolve_resource_operation(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
        operation: &Operation,
    ) -> DomainResult<bool> {
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| DomainError::ResolverError {
                message: "resolver is shut down".to_string(),
            })?;

        let snapshot = match timeout(self.config.timeout, self.source.load_subject(subject_id))
            .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                return Err(DomainError::Timeout {
                    duration_ms: self.config.timeout.as_millis() as u64,
                });
            }
        };

        if snapshot.is_superuser {
            return Ok(true);
        }

        let now = Utc::now();
        Ok(snapshot
            .resource_grants
            .iter()
            .find(|g| g.matches(resource_type, resource_id) && g.is_effective_at(now))
            .is_some_and(|grant| grant.allows(operation)))
    }

    async fn resolve_inner(
        &self,
        subject_id: SubjectId,
        consistency: Consistency,
    ) -> DomainResult<SubjectPermissions> {
        let snapshot = self.source.load_subject(subject_id).await?;
        let resolved_at = Utc::now();

        if snapshot.is_superuser {
            debug!(subject_id, "superuser short-circuit");
            return Ok(SubjectPermissions::superuser(subject_id, resolved_at));
        }

        let mut permission_codes = HashSet::new();
        let mut visited = HashSet::new();
        self.expand_permissions(
            &snapshot.direct_permissions,
            &mut visited,
            &mut permission_codes,
        )
        .await?;

        let expansion = match snapshot.primary_role {
            Some(role) => self.expand_role(role, consistency).await?,
            None => RoleExpansion::default(),
        };
        permission_codes.extend(expansion.permission_codes);

        Ok(SubjectPermissions {
            subject_id,
            is_superuser: false,
            permission_codes,
            resource_grants: snapshot.resource_grants,
            role_code: expansion.role_code,
            role_chain: expansion.role_chain,
            resolved_at,
        })
    }

    /// Expands the primary role and its ancestors, using the role tier when allowed.
    async fn expand_role(
        &self,
        role: RoleSnapshot,
        consistency: Consistency,
    ) -> DomainResult<RoleExpansion> {
        let role_cache = match consistency {
            Consistency::MinimizeLatency => self.config.role_cache.as_ref(),
            Consistency::HigherConsistency => None,
        };

        if let Some(cache) = role_cache {
            if let Some(cached) = cache.get_role(role.id).await {
                self.role_cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.into());
            }
        }

        let generation = role_cache.map(|cache| cache.generation()).unwrap_or_default();
        let expansion = self.walk_role_chain(role).await?;

        if let (Some(cache), Some(role_code)) = (role_cache, expansion.role_code.as_ref()) {
            let cached = CachedRole {
                role_code: role_code.clone(),
                permission_codes: expansion.permission_codes.clone(),
                role_chain: expansion.role_chain.clone(),
            };
            if let Some(&role_id) = expansion.role_chain.first() {
                cache.put_role(role_id, &cached, generation).await;
            }
        }

        Ok(expansion)
    }

    /// Walks a role and its parent chain, visiting each role at most once.
    async fn walk_role_chain(&self, primary: RoleSnapshot) -> DomainResult<RoleExpansion> {
        let mut expansion = RoleExpansion {
            role_code: Some(primary.code.clone()),
            ..Default::default()
        };
        let mut visited_roles: HashSet<RoleId> = HashSet::new();
        let mut visited_permissions: HashSet<PermissionId> = HashSet::new();
        let mut current = Some(primary);

        while let Some(role) = current.take() {
            if !visited_roles.insert(role.id) {
                warn!(role_id = role.id, "role hierarchy cycle detected, stopping walk");
                break;
            }
            expansion.role_chain.push(role.id);

            // An inactive role grants nothing itself but does not cut off its ancestors
            if role.is_active {
                self.expand_permissions(
                    &role.permissions,
                    &mut visited_permissions,
                    &mut expansion.permission_codes,
                )
                .await?;
            }

            current = match role.parent_id {
                Some(parent_id) if visited_roles.contains(&parent_id) => {
                    warn!(
                        role_id = role.id,
                        parent_id, "role hierarchy cycle detected, stopping walk"
                    );
                    None
                }
                Some(parent_id) => match self.source.load_role(parent_id).await {
                    Ok(parent) => Some(parent),
                    Err(DomainError::RoleNotFound { role_id }) => {
                        warn!(role_id, "dangling parent role reference");
                        None
                    }
                    Err(e) => return Err(e),
                },
                None => None,
            };
        }

        Ok(expansion)
    }

    /// Adds `roots` and all their descendants to `codes`, depth-first.
    ///
    /// Permissions already in `visited` are not expanded again, which also
    /// terminates on back-edges in the permission tree. Inactive permissions
    /// and their subtrees are skipped.
    async fn expand_permissions(
        &self,
        roots: &[PermissionNode],
        visited: &mut HashSet<PermissionId>,
        codes: &mut HashSet<String>,
    ) -> DomainResult<()> {
        let mut stack: Vec<PermissionNode> = roots.iter().rev().cloned().collect();

        while let Some(node) = stack.pop() {
            if !node.is_active || !visited.insert(node.id) {
                continue;
            }
            codes.insert(node.code);

            let children = self.source.load_child_permissions(node.id).await?;
            stack.extend(
                children
                    .into_iter()
                    .rev()
                    .filter(|child| !visited.contains(&child.id)),
            );
        }

        Ok(())
    }
}
