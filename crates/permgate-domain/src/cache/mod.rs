//! Permission caching with per-tier TTLs and coarse invalidation.
//!
//! The cache holds three tiers, all in one backing [`CacheStore`]:
//!
//! | tier     | key                                   | value                  | TTL    |
//! |----------|---------------------------------------|------------------------|--------|
//! | subject  | `perm:subject:{subject_id}`           | [`SubjectPermissions`] | 900s   |
//! | role     | `perm:role:{role_id}`                 | [`CachedRole`]         | 1800s  |
//! | resource | `perm:res:{type}:{id}:{subject_id}`   | [`ResourceAccess`]     | 600s   |
//!
//! `:` and `%` inside a resource type or id are percent-escaped in keys.
//!
//! # Key Design
//!
//! Entries are keyed by subject, never by permission code. A subject's whole
//! set is written and invalidated together, so a reader sees either a fully
//! resolved set or a miss, never a mix of old and new codes.
//!
//! # Failure Model
//!
//! The cache is never authoritative. Every store error, decode error and
//! expired entry reads as a miss; store errors are logged, counted and fed to
//! a [`CircuitBreaker`] that short-circuits the store once it keeps failing.
//!
//! # Invalidation
//!
//! Secondary indices map roles to the subjects whose cached chain contains
//! them, and subjects to their resource-tier keys, so role and subject
//! invalidation touch only the affected keys. When the backing store is
//! shared with other processes these local indices are incomplete and role
//! invalidation flushes the whole cache instead.
//!
//! Invalidation does not depend on the store honouring the delete. Every
//! invalidation advances a local [`Generation`] and records it as a
//! watermark for the subject, the role, or the whole cache. Entries carry
//! the generation captured before their data was read from the Permission
//! Store; a write or a stored entry older than a covering watermark is
//! dropped. A delete lost to an open circuit, or a resolution that finishes
//! after the invalidation, therefore never resurfaces. Generations are local
//! to one process.

mod breaker;
mod store;

pub use breaker::{CircuitBreaker, CircuitState};
pub use store::{CacheStore, CacheStoreError, MokaCacheStore};

use std::borrow::Cow;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{ResourceAccess, RoleId, SubjectId, SubjectPermissions};

/// Time-to-live of each cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub subject: Duration,
    pub role: Duration,
    pub resource: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            subject: Duration::from_secs(900),
            role: Duration::from_secs(1800),
            resource: Duration::from_secs(600),
        }
    }
}

/// Configuration for the permission cache.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCacheConfig {
    /// When disabled every read misses and every write is dropped.
    pub enabled: bool,
    pub ttls: CacheTtls,
    /// Consecutive store failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before a trial call.
    pub cooldown: Duration,
    /// Capacity of the in-process store.
    pub max_capacity: u64,
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttls: CacheTtls::default(),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_capacity: 100_000,
        }
    }
}

impl PermissionCacheConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_ttls(mut self, ttls: CacheTtls) -> Self {
        self.ttls = ttls;
        self
    }

    pub fn with_circuit_breaker(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.failure_threshold = failure_threshold;
        self.cooldown = cooldown;
        self
    }

    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }
}

/// Expanded permissions of a role and its ancestor chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRole {
    pub role_code: String,
    pub permission_codes: HashSet<String>,
    /// The role followed by its ancestors.
    pub role_chain: Vec<RoleId>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub circuit_state: CircuitState,
    pub indexed_subjects: usize,
}

impl CacheStats {
    /// Hits over lookups, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Invalidation epoch a value was read under.
///
/// Capture it with [`PermissionCache::generation`] before reading the
/// Permission Store and pass it to the write.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(u64);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    expires_at: DateTime<Utc>,
    generation: Generation,
    value: T,
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Subject,
    Role,
    Resource,
}

impl Tier {
    fn label(self) -> &'static str {
        match self {
            Tier::Subject => "subject",
            Tier::Role => "role",
            Tier::Resource => "resource",
        }
    }
}

fn subject_key(subject_id: SubjectId) -> String {
    format!("perm:subject:{subject_id}")
}

fn role_key(role_id: RoleId) -> String {
    format!("perm:role:{role_id}")
}

fn resource_key(resource_type: &str, resource_id: &str, subject_id: SubjectId) -> String {
    format!(
        "perm:res:{}:{}:{subject_id}",
        escape_segment(resource_type),
        escape_segment(resource_id)
    )
}

/// Escapes `%` and `:` so distinct (type, id) pairs never share a key.
fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains([':', '%']) {
        return Cow::Borrowed(segment);
    }
    Cow::Owned(segment.replace('%', "%25").replace(':', "%3A"))
}

/// Subject/role/resource permission cache.
///
/// Fully thread-safe; share it behind an `Arc`.
pub struct PermissionCache {
    store: Arc<dyn CacheStore>,
    config: RwLock<PermissionCacheConfig>,
    breaker: CircuitBreaker,
    /// role_id -> subjects whose cached role chain contains it.
    by_role: DashMap<RoleId, HashSet<SubjectId>>,
    /// role_id -> cached role entries whose chain contains it.
    role_dependents: DashMap<RoleId, HashSet<RoleId>>,
    /// subject_id -> roles recorded for it in `by_role`.
    subject_roles: DashMap<SubjectId, Vec<RoleId>>,
    /// subject_id -> resource-tier keys written for it.
    subject_resources: DashMap<SubjectId, HashSet<String>>,
    /// Advanced by every invalidation.
    epoch: AtomicU64,
    /// Epoch of the latest full flush.
    flushed_at: AtomicU64,
    subject_marks: DashMap<SubjectId, u64>,
    role_marks: DashMap<RoleId, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("config", &*self.config.read())
            .field("circuit_state", &self.breaker.state())
            .field("role_index_size", &self.by_role.len())
            .field("subject_index_size", &self.subject_roles.len())
            .finish()
    }
}

impl PermissionCache {
    /// Creates a cache backed by an in-process Moka store.
    pub fn new(config: PermissionCacheConfig) -> Self {
        let store = Arc::new(MokaCacheStore::new(config.max_capacity));
        Self::with_store(config, store)
    }

    /// Creates a cache on top of an arbitrary backing store.
    pub fn with_store(config: PermissionCacheConfig, store: Arc<dyn CacheStore>) -> Self {
        let breaker = CircuitBreaker::new(config.failure_threshold, config.cooldown);
        Self {
            store,
            config: RwLock::new(config),
            breaker,
            by_role: DashMap::new(),
            role_dependents: DashMap::new(),
            subject_roles: DashMap::new(),
            subject_resources: DashMap::new(),
            epoch: AtomicU64::new(0),
            flushed_at: AtomicU64::new(0),
            subject_marks: DashMap::new(),
            role_marks: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> PermissionCacheConfig {
        self.config.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    /// Applies new TTLs and breaker thresholds.
    ///
    /// Existing entries keep the TTL they were written with. The store
    /// capacity is fixed at construction.
    pub fn update_config(&self, config: PermissionCacheConfig) {
        self.breaker
            .reconfigure(config.failure_threshold, config.cooldown);
        info!(
            enabled = config.enabled,
            subject_ttl_secs = config.ttls.subject.as_secs(),
            role_ttl_secs = config.ttls.role.as_secs(),
            resource_ttl_secs = config.ttls.resource.as_secs(),
            "permission cache reconfigured"
        );
        *self.config.write() = config;
    }

    // ------------------------------------------------------------------
    // Subject tier
    // ------------------------------------------------------------------

    /// Returns the cached permission set of a subject.
    pub async fn get(&self, subject_id: SubjectId) -> Option<SubjectPermissions> {
        self.read(
            Tier::Subject,
            &subject_key(subject_id),
            |perms: &SubjectPermissions, generation| self.is_current(generation, perms),
        )
        .await
    }

    /// Whether a live subject entry exists. Does not count as a lookup.
    pub async fn contains(&self, subject_id: SubjectId) -> bool {
        self.read_envelope(
            &subject_key(subject_id),
            |perms: &SubjectPermissions, generation| self.is_current(generation, perms),
        )
        .await
        .is_some()
    }

    /// Caches a permission set resolved at `generation` with the subject TTL.
    pub async fn put(&self, permissions: &SubjectPermissions, generation: Generation) {
        let ttl = self.config.read().ttls.subject;
        self.put_with_ttl(permissions, generation, ttl).await;
    }

    /// Caches a permission set resolved at `generation` with an explicit TTL.
    ///
    /// Dropped when the subject, a role in its chain, or the whole cache was
    /// invalidated after `generation`.
    pub async fn put_with_ttl(
        &self,
        permissions: &SubjectPermissions,
        generation: Generation,
        ttl: Duration,
    ) {
        let subject_id = permissions.subject_id;
        if !self.is_current(generation, permissions) {
            debug!(subject_id, "dropping permission set resolved before an invalidation");
            return;
        }
        // Index before writing so a concurrent role invalidation cannot miss it
        self.index_subject_roles(subject_id, &permissions.role_chain);

        if self
            .write(
                Tier::Subject,
                &subject_key(subject_id),
                permissions,
                generation,
                ttl,
            )
            .await
        {
            debug!(
                subject_id,
                codes = permissions.permission_codes.len(),
                "cached subject permissions"
            );
        }
    }

    // ------------------------------------------------------------------
    // Role tier
    // ------------------------------------------------------------------

    /// Returns the cached expansion of a role chain.
    pub async fn get_role(&self, role_id: RoleId) -> Option<CachedRole> {
        self.read(Tier::Role, &role_key(role_id), |role: &CachedRole, generation| {
            self.survives(generation, None, &role.role_chain)
        })
        .await
    }

    /// Caches the expansion of a role chain, read at `generation`, under its
    /// first role.
    pub async fn put_role(&self, role_id: RoleId, role: &CachedRole, generation: Generation) {
        if !self.survives(generation, None, &role.role_chain) {
            debug!(role_id, "dropping role expansion read before an invalidation");
            return;
        }
        for ancestor in &role.role_chain {
            self.role_dependents
                .entry(*ancestor)
                .or_default()
                .insert(role_id);
        }
        let ttl = self.config.read().ttls.role;
        self.write(Tier::Role, &role_key(role_id), role, generation, ttl)
            .await;
    }

    // ------------------------------------------------------------------
    // Resource tier
    // ------------------------------------------------------------------

    /// Returns the cached access of a subject to one resource instance.
    pub async fn get_resource_ops(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
    ) -> Option<ResourceAccess> {
        self.read(
            Tier::Resource,
            &resource_key(resource_type, resource_id, subject_id),
            |_: &ResourceAccess, generation| self.survives(generation, Some(subject_id), &[]),
        )
        .await
    }

    /// Caches the access of a subject to one resource instance, read at
    /// `generation`.
    pub async fn put_resource_ops(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
        access: &ResourceAccess,
        generation: Generation,
    ) {
        let ttl = self.config.read().ttls.resource;
        self.put_resource_ops_with_ttl(
            subject_id,
            resource_type,
            resource_id,
            access,
            generation,
            ttl,
        )
        .await;
    }

    /// Caches resource access with an explicit TTL.
    ///
    /// Callers cap the TTL at the grant's expiry so an expired grant is never
    /// served from the cache.
    pub async fn put_resource_ops_with_ttl(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
        access: &ResourceAccess,
        generation: Generation,
        ttl: Duration,
    ) {
        if !self.survives(generation, Some(subject_id), &[]) {
            debug!(subject_id, "dropping resource access read before an invalidation");
            return;
        }
        let key = resource_key(resource_type, resource_id, subject_id);
        self.subject_resources
            .entry(subject_id)
            .or_default()
            .insert(key.clone());
        self.write(Tier::Resource, &key, access, generation, ttl)
            .await;
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Drops every entry of one subject (permission set and resource access).
    pub async fn invalidate(&self, subject_id: SubjectId) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mark = self.advance_epoch();
        raise_mark(&self.subject_marks, subject_id, mark);
        self.unindex_subject_roles(subject_id);

        let mut keys = vec![subject_key(subject_id)];
        if let Some((_, resource_keys)) = self.subject_resources.remove(&subject_id) {
            keys.extend(resource_keys);
        }
        for key in &keys {
            self.remove(key).await;
        }
        debug!(subject_id, keys = keys.len(), "invalidated subject");
    }

    /// Drops every entry that depends on a role.
    ///
    /// That is the role's own expansion, every cached expansion whose chain
    /// contains it, and every subject whose chain contains it. With a shared
    /// backing store the whole cache is flushed.
    pub async fn invalidate_role(&self, role_id: RoleId) {
        if self.store.is_shared() {
            info!(role_id, "shared cache store, flushing all on role change");
            self.invalidate_all().await;
            return;
        }

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mark = self.advance_epoch();
        raise_mark(&self.role_marks, role_id, mark);

        let mut roles: HashSet<RoleId> = self
            .role_dependents
            .remove(&role_id)
            .map(|(_, dependents)| dependents)
            .unwrap_or_default();
        roles.insert(role_id);
        for role in &roles {
            self.remove(&role_key(*role)).await;
        }

        let subjects = self
            .by_role
            .remove(&role_id)
            .map(|(_, subjects)| subjects)
            .unwrap_or_default();
        for subject_id in &subjects {
            self.invalidate(*subject_id).await;
        }

        info!(
            role_id,
            roles = roles.len(),
            subjects = subjects.len(),
            "invalidated role"
        );
    }

    /// Drops everything.
    pub async fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mark = self.advance_epoch();
        self.flushed_at.fetch_max(mark, Ordering::SeqCst);
        self.subject_marks.retain(|_, m| *m > mark);
        self.role_marks.retain(|_, m| *m > mark);
        self.by_role.clear();
        self.role_dependents.clear();
        self.subject_roles.clear();
        self.subject_resources.clear();

        if self.breaker.allow() {
            match self.store.clear().await {
                Ok(()) => self.breaker.record_success(),
                Err(e) => self.record_store_error("clear", &e),
            }
        }
        info!("invalidated entire permission cache");
    }

    /// The current invalidation epoch.
    pub fn generation(&self) -> Generation {
        Generation(self.epoch.load(Ordering::SeqCst))
    }

    /// Whether a permission set read at `generation` survives every later
    /// invalidation of its subject, of a role in its chain, and of the cache.
    pub fn is_current(&self, generation: Generation, permissions: &SubjectPermissions) -> bool {
        self.survives(
            generation,
            Some(permissions.subject_id),
            &permissions.role_chain,
        )
    }

    fn survives(
        &self,
        generation: Generation,
        subject_id: Option<SubjectId>,
        role_chain: &[RoleId],
    ) -> bool {
        let mut mark = self.flushed_at.load(Ordering::SeqCst);
        if let Some(subject_mark) = subject_id.and_then(|id| self.subject_marks.get(&id)) {
            mark = mark.max(*subject_mark);
        }
        for role_id in role_chain {
            if let Some(role_mark) = self.role_marks.get(role_id) {
                mark = mark.max(*role_mark);
            }
        }
        generation.0 >= mark
    }

    fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns point-in-time counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
            indexed_subjects: self.subject_roles.len(),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    // ------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------

    async fn read<T: DeserializeOwned>(
        &self,
        tier: Tier,
        key: &str,
        is_current: impl FnOnce(&T, Generation) -> bool,
    ) -> Option<T> {
        let value = self.read_envelope(key, is_current).await;
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("permgate_cache_hits_total", "tier" => tier.label()).increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("permgate_cache_misses_total", "tier" => tier.label())
                .increment(1);
        }
        value
    }

    async fn read_envelope<T: DeserializeOwned>(
        &self,
        key: &str,
        is_current: impl FnOnce(&T, Generation) -> bool,
    ) -> Option<T> {
        if !self.is_enabled() || !self.breaker.allow() {
            return None;
        }

        let bytes = match self.store.get(key).await {
            Ok(bytes) => {
                self.breaker.record_success();
                bytes?
            }
            Err(e) => {
                self.record_store_error("get", &e);
                return None;
            }
        };

        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) if envelope.expires_at <= Utc::now() => None,
            Ok(envelope) if !is_current(&envelope.value, envelope.generation) => {
                debug!(key, "cache entry predates an invalidation, treating as miss");
                None
            }
            Ok(envelope) => Some(envelope.value),
            Err(e) => {
                warn!(key, error = %e, "undecodable cache entry, treating as miss");
                self.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns whether the value reached the store.
    async fn write<T: Serialize>(
        &self,
        tier: Tier,
        key: &str,
        value: &T,
        generation: Generation,
        ttl: Duration,
    ) -> bool {
        if !self.is_enabled() || ttl.is_zero() || !self.breaker.allow() {
            return false;
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let envelope = Envelope {
            expires_at,
            generation,
            value,
        };
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "failed to encode cache entry");
                self.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match self.store.set(key, bytes, ttl).await {
            Ok(()) => {
                self.breaker.record_success();
                self.writes.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("permgate_cache_writes_total", "tier" => tier.label())
                    .increment(1);
                true
            }
            Err(e) => {
                self.record_store_error("set", &e);
                false
            }
        }
    }

    async fn remove(&self, key: &str) {
        if !self.breaker.allow() {
            return;
        }
        match self.store.delete(key).await {
            Ok(()) => self.breaker.record_success(),
            Err(e) => self.record_store_error("delete", &e),
        }
    }

    fn record_store_error(&self, operation: &'static str, error: &CacheStoreError) {
        warn!(operation, error = %error, "cache store error, falling back to miss");
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("permgate_cache_errors_total", "operation" => operation).increment(1);
        self.breaker.record_failure();
    }

    fn index_subject_roles(&self, subject_id: SubjectId, role_chain: &[RoleId]) {
        self.unindex_subject_roles(subject_id);
        if role_chain.is_empty() {
            return;
        }
        for role_id in role_chain {
            self.by_role.entry(*role_id).or_default().insert(subject_id);
        }
        self.subject_roles.insert(subject_id, role_chain.to_vec());
    }

    fn unindex_subject_roles(&self, subject_id: SubjectId) {
        if let Some((_, roles)) = self.subject_roles.remove(&subject_id) {
            for role_id in roles {
                if let Some(mut subjects) = self.by_role.get_mut(&role_id) {
                    subjects.remove(&subject_id);
                }
            }
        }
    }
}

fn raise_mark<K: Eq + Hash>(marks: &DashMap<K, u64>, key: K, mark: u64) {
    let mut entry = marks.entry(key).or_insert(0);
    if *entry < mark {
        *entry = mark;
    }
}

/// Registers permission cache metric descriptions.
///
/// Call once during startup, after the metrics recorder is installed.
pub fn register_cache_metrics() {
    metrics::describe_counter!(
        "permgate_cache_hits_total",
        "Total number of permission cache hits, by tier"
    );
    metrics::describe_counter!(
        "permgate_cache_misses_total",
        "Total number of permission cache misses, by tier"
    );
    metrics::describe_counter!(
        "permgate_cache_writes_total",
        "Total number of permission cache writes, by tier"
    );
    metrics::describe_counter!(
        "permgate_cache_errors_total",
        "Total number of cache store errors, by operation"
    );
    metrics::describe_counter!(
        "permgate_cache_circuit_opened_total",
        "Number of times the cache store circuit opened"
    );
}
