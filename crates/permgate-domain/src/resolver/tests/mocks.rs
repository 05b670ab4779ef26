//! Mock implementations for resolver testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{DomainError, DomainResult};
use crate::model::{PermissionId, ResourceGrant, RoleId, SubjectId};
use crate::resolver::{PermissionNode, PermissionSource, RoleSnapshot, SubjectSnapshot};

#[derive(Debug, Clone)]
struct MockPermission {
    code: String,
    parent_id: Option<PermissionId>,
    is_active: bool,
}

#[derive(Debug, Clone)]
struct MockRole {
    code: String,
    parent_id: Option<RoleId>,
    permission_ids: Vec<PermissionId>,
    is_active: bool,
}

#[derive(Debug, Clone, Default)]
struct MockSubject {
    is_superuser: bool,
    primary_role_id: Option<RoleId>,
    direct_permission_ids: Vec<PermissionId>,
    grants: Vec<ResourceGrant>,
}

/// In-memory permission source with call counters.
pub struct MockPermissionSource {
    permissions: RwLock<HashMap<PermissionId, MockPermission>>,
    /// Extra parent -> child edges, used to build corrupt trees.
    extra_edges: RwLock<HashMap<PermissionId, Vec<PermissionId>>>,
    roles: RwLock<HashMap<RoleId, MockRole>>,
    subjects: RwLock<HashMap<SubjectId, MockSubject>>,
    subject_loads: AtomicUsize,
    role_loads: AtomicUsize,
    child_loads: AtomicUsize,
    delay: RwLock<Option<Duration>>,
    failing: AtomicBool,
}

impl MockPermissionSource {
    pub fn new() -> Self {
        Self {
            permissions: RwLock::new(HashMap::new()),
            extra_edges: RwLock::new(HashMap::new()),
            roles: RwLock::new(HashMap::new()),
            subjects: RwLock::new(HashMap::new()),
            subject_loads: AtomicUsize::new(0),
            role_loads: AtomicUsize::new(0),
            child_loads: AtomicUsize::new(0),
            delay: RwLock::new(None),
            failing: AtomicBool::new(false),
        }
    }

    pub async fn add_permission(&self, id: PermissionId, code: &str, parent_id: Option<PermissionId>) {
        self.permissions.write().await.insert(
            id,
            MockPermission {
                code: code.to_string(),
                parent_id,
                is_active: true,
            },
        );
    }

    pub async fn deactivate_permission(&self, id: PermissionId) {
        if let Some(permission) = self.permissions.write().await.get_mut(&id) {
            permission.is_active = false;
        }
    }

    /// Adds a child edge that does not follow `parent_id`, e.g. a back-edge.
    pub async fn add_permission_edge(&self, parent: PermissionId, child: PermissionId) {
        self.extra_edges
            .write()
            .await
            .entry(parent)
            .or_default()
            .push(child);
    }

    pub async fn add_role(
        &self,
        id: RoleId,
        code: &str,
        parent_id: Option<RoleId>,
        permission_ids: &[PermissionId],
    ) {
        self.roles.write().await.insert(
            id,
            MockRole {
                code: code.to_string(),
                parent_id,
                permission_ids: permission_ids.to_vec(),
                is_active: true,
            },
        );
    }

    pub async fn set_role_parent(&self, id: RoleId, parent_id: Option<RoleId>) {
        if let Some(role) = self.roles.write().await.get_mut(&id) {
            role.parent_id = parent_id;
        }
    }

    pub async fn deactivate_role(&self, id: RoleId) {
        if let Some(role) = self.roles.write().await.get_mut(&id) {
            role.is_active = false;
        }
    }

    pub async fn add_subject(
        &self,
        id: SubjectId,
        primary_role_id: Option<RoleId>,
        direct_permission_ids: &[PermissionId],
    ) {
        self.subjects.write().await.insert(
            id,
            MockSubject {
                primary_role_id,
                direct_permission_ids: direct_permission_ids.to_vec(),
                ..Default::default()
            },
        );
    }

    pub async fn add_superuser(&self, id: SubjectId) {
        self.subjects.write().await.insert(
            id,
            MockSubject {
                is_superuser: true,
                ..Default::default()
            },
        );
    }

    pub async fn add_grant(&self, subject_id: SubjectId, grant: ResourceGrant) {
        if let Some(subject) = self.subjects.write().await.get_mut(&subject_id) {
            subject.grants.push(grant);
        }
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn subject_loads(&self) -> usize {
        self.subject_loads.load(Ordering::SeqCst)
    }

    pub fn role_loads(&self) -> usize {
        self.role_loads.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn child_loads(&self) -> usize {
        self.child_loads.load(Ordering::SeqCst)
    }

    async fn node(&self, id: PermissionId) -> Option<PermissionNode> {
        self.permissions
            .read()
            .await
            .get(&id)
            .map(|p| PermissionNode {
                id,
                code: p.code.clone(),
                is_active: p.is_active,
            })
    }

    async fn nodes(&self, ids: &[PermissionId]) -> Vec<PermissionNode> {
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.node(*id).await {
                nodes.push(node);
            }
        }
        nodes
    }

    async fn role_snapshot(&self, role_id: RoleId) -> DomainResult<RoleSnapshot> {
        let role = self
            .roles
            .read()
            .await
            .get(&role_id)
            .cloned()
            .ok_or(DomainError::RoleNotFound { role_id })?;
        Ok(RoleSnapshot {
            id: role_id,
            code: role.code,
            parent_id: role.parent_id,
            permissions: self.nodes(&role.permission_ids).await,
            is_active: role.is_active,
        })
    }

    async fn before_call(&self) -> DomainResult<()> {
        if let Some(delay) = *self.delay.read().await {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DomainError::ResolverError {
                message: "store unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionSource for MockPermissionSource {
    async fn load_subject(&self, subject_id: SubjectId) -> DomainResult<SubjectSnapshot> {
        self.subject_loads.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let subject = self
            .subjects
            .read()
            .await
            .get(&subject_id)
            .cloned()
            .ok_or(DomainError::SubjectNotFound { subject_id })?;

        let primary_role = match subject.primary_role_id {
            Some(role_id) => self.role_snapshot(role_id).await.ok(),
            None => None,
        };

        Ok(SubjectSnapshot {
            id: subject_id,
            is_superuser: subject.is_superuser,
            primary_role,
            direct_permissions: self.nodes(&subject.direct_permission_ids).await,
            resource_grants: subject.grants,
        })
    }

    async fn load_role(&self, role_id: RoleId) -> DomainResult<RoleSnapshot> {
        self.role_loads.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.role_snapshot(role_id).await
    }

    async fn load_child_permissions(
        &self,
        permission_id: PermissionId,
    ) -> DomainResult<Vec<PermissionNode>> {
        self.child_loads.fetch_add(1, Ordering::SeqCst);

        let mut child_ids: Vec<PermissionId> = {
            let permissions = self.permissions.read().await;
            let mut ids: Vec<PermissionId> = permissions
                .iter()
                .filter(|(_, p)| p.parent_id == Some(permission_id))
                .map(|(id, _)| *id)
                .collect();
            ids.sort_unstable();
            ids
        };
        if let Some(extra) = self.extra_edges.read().await.get(&permission_id) {
            child_ids.extend(extra.iter().copied());
        }

        Ok(self.nodes(&child_ids).await)
    }
}
