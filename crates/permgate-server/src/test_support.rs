//! Shared test fixtures for server components.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use permgate_domain::resolver::{
    PermissionNode, PermissionSource, QueryResolver, RoleSnapshot, SubjectSnapshot,
};
use permgate_domain::{
    DomainError, DomainResult, PermissionCache, PermissionCacheConfig, PermissionId,
    ResourceGrant, RoleId, SubjectId,
};

/// Flat permission source: every subject holds a fixed list of codes.
#[derive(Default)]
pub struct StaticSource {
    subjects: RwLock<HashMap<SubjectId, SubjectSnapshot>>,
    failing: RwLock<HashSet<SubjectId>>,
    delay: RwLock<Option<Duration>>,
    gate: RwLock<Option<Arc<Semaphore>>>,
    loads: AtomicUsize,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subject(&self, id: SubjectId, codes: &[&str]) {
        let snapshot = SubjectSnapshot {
            id,
            is_superuser: false,
            primary_role: None,
            direct_permissions: nodes(id, codes),
            resource_grants: Vec::new(),
        };
        self.subjects.write().insert(id, snapshot);
    }

    pub fn add_superuser(&self, id: SubjectId) {
        let snapshot = SubjectSnapshot {
            id,
            is_superuser: true,
            primary_role: None,
            direct_permissions: Vec::new(),
            resource_grants: Vec::new(),
        };
        self.subjects.write().insert(id, snapshot);
    }

    /// Replaces a subject's codes, simulating a store write.
    pub fn set_codes(&self, id: SubjectId, codes: &[&str]) {
        if let Some(subject) = self.subjects.write().get_mut(&id) {
            subject.direct_permissions = nodes(id, codes);
        }
    }

    pub fn add_grant(&self, id: SubjectId, grant: ResourceGrant) {
        if let Some(subject) = self.subjects.write().get_mut(&id) {
            subject.resource_grants.push(grant);
        }
    }

    pub fn clear_grants(&self, id: SubjectId) {
        if let Some(subject) = self.subjects.write().get_mut(&id) {
            subject.resource_grants.clear();
        }
    }

    pub fn fail_subject(&self, id: SubjectId) {
        self.failing.write().insert(id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = Some(delay);
    }

    /// Holds every subject load after it has read its snapshot, until the
    /// returned gate gets a permit.
    pub fn hold_loads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.write() = Some(Arc::clone(&gate));
        gate
    }

    /// Waits until `count` subject loads have started.
    pub async fn wait_for_loads(&self, count: usize) {
        for _ in 0..200 {
            if self.loads() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("only {} of {count} loads started", self.loads());
    }

    /// Number of subject loads served.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn nodes(id: SubjectId, codes: &[&str]) -> Vec<PermissionNode> {
    codes
        .iter()
        .enumerate()
        .map(|(i, code)| PermissionNode {
            id: id * 1000 + i as PermissionId,
            code: code.to_string(),
            is_active: true,
        })
        .collect()
}

#[async_trait]
impl PermissionSource for StaticSource {
    async fn load_subject(&self, subject_id: SubjectId) -> DomainResult<SubjectSnapshot> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.read().contains(&subject_id) {
            return Err(DomainError::ResolverError {
                message: "store unreachable".to_string(),
            });
        }
        let snapshot = self
            .subjects
            .read()
            .get(&subject_id)
            .cloned()
            .ok_or(DomainError::SubjectNotFound { subject_id });
        let gate = self.gate.read().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        snapshot
    }

    async fn load_role(&self, role_id: RoleId) -> DomainResult<RoleSnapshot> {
        Err(DomainError::RoleNotFound { role_id })
    }

    async fn load_child_permissions(
        &self,
        _permission_id: PermissionId,
    ) -> DomainResult<Vec<PermissionNode>> {
        Ok(Vec::new())
    }
}

/// Source, resolver and an enabled cache wired together.
pub struct Fixture {
    pub source: Arc<StaticSource>,
    pub resolver: Arc<QueryResolver<StaticSource>>,
    pub cache: Arc<PermissionCache>,
}

impl Fixture {
    pub fn new() -> Self {
        let source = Arc::new(StaticSource::new());
        let resolver = Arc::new(QueryResolver::new(Arc::clone(&source)));
        let cache = Arc::new(PermissionCache::new(PermissionCacheConfig::default()));
        Self {
            source,
            resolver,
            cache,
        }
    }
}

/// Polls until the subject is cached or a second passes.
pub async fn wait_until_cached(cache: &PermissionCache, subject_id: SubjectId) -> bool {
    for _ in 0..100 {
        if cache.contains(subject_id).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
