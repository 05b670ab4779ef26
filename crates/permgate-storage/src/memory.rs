//! In-memory storage implementation.
//!
//! Each table is a `DashMap` so concurrent readers never block each other.
//! Joins for `get_subject` / `get_role` are assembled on read, which mirrors
//! what an eager-loading relational query returns.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    validate_grant, validate_permission_code, DataStore, PermissionId, RoleId, RoleRecord,
    StoredPermission, StoredResourceGrant, StoredRole, StoredSubject, SubjectId, SubjectRecord,
};

/// Seed data for populating a [`MemoryDataStore`], usually loaded from JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub permissions: Vec<StoredPermission>,
    #[serde(default)]
    pub roles: Vec<StoredRole>,
    #[serde(default)]
    pub subjects: Vec<StoredSubject>,
    #[serde(default)]
    pub grants: Vec<StoredResourceGrant>,
}

/// In-memory implementation of DataStore.
///
/// # Performance Characteristics
///
/// - **get_subject**: O(P + G) where P is joined permissions and G is grants
/// - **get_child_permissions**: O(N) over all permissions (linear scan)
/// - **Writes**: O(1) average (DashMap insert), grants O(G) per subject
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    permissions: DashMap<PermissionId, StoredPermission>,
    roles: DashMap<RoleId, StoredRole>,
    subjects: DashMap<SubjectId, StoredSubject>,
    /// Grants keyed by subject.
    grants: DashMap<SubjectId, Vec<StoredResourceGrant>>,
    /// When set, every read fails with a connection error.
    unavailable: AtomicBool,
}

impl MemoryDataStore {
    /// Creates a new in-memory data store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory data store wrapped in Arc.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Creates a store populated from seed data.
    ///
    /// Rows are inserted in dependency order (permissions, roles, subjects,
    /// grants) so grant validation sees the full permission vocabulary.
    pub async fn from_seed(seed: SeedData) -> StorageResult<Self> {
        let store = Self::new();
        for permission in seed.permissions {
            store.upsert_permission(permission).await?;
        }
        for role in seed.roles {
            store.upsert_role(role).await?;
        }
        for subject in seed.subjects {
            store.upsert_subject(subject).await?;
        }
        for grant in seed.grants {
            store.grant_resource(grant).await?;
        }
        Ok(store)
    }

    /// Loads seed data from a JSON file.
    pub async fn from_seed_file<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| StorageError::InvalidInput {
            message: format!("failed to read seed file {}: {}", path.display(), e),
        })?;
        let seed: SeedData = serde_json::from_str(&raw)?;
        Self::from_seed(seed).await
    }

    /// Simulates the backing database going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionError {
                message: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves permission IDs to rows, skipping dangling references.
    fn lookup_permissions(&self, ids: &[PermissionId]) -> Vec<StoredPermission> {
        ids.iter()
            .filter_map(|id| self.permissions.get(id).map(|p| p.value().clone()))
            .collect()
    }

    fn role_record(&self, id: RoleId) -> StorageResult<RoleRecord> {
        let role = self
            .roles
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StorageError::RoleNotFound { role_id: id })?;
        let permissions = self.lookup_permissions(&role.permission_ids);
        Ok(RoleRecord { role, permissions })
    }

    /// Operation names defined by permissions of a resource type.
    fn operation_vocabulary(&self, resource_type: &str) -> HashSet<String> {
        self.permissions
            .iter()
            .filter(|p| p.resource_type == resource_type)
            .map(|p| p.operation_type.clone())
            .collect()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    #[instrument(skip(self))]
    async fn get_subject(&self, id: SubjectId) -> StorageResult<SubjectRecord> {
        self.ensure_available()?;

        let subject = self
            .subjects
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(StorageError::SubjectNotFound { subject_id: id })?;

        // A dangling role reference is surfaced as missing role, not an error,
        // matching a LEFT JOIN.
        let primary_role = match subject.primary_role_id {
            Some(role_id) => match self.role_record(role_id) {
                Ok(record) => Some(record),
                Err(StorageError::RoleNotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        let direct_permissions = self.lookup_permissions(&subject.direct_permission_ids);
        let resource_grants = self
            .grants
            .get(&id)
            .map(|g| g.value().clone())
            .unwrap_or_default();

        Ok(SubjectRecord {
            subject,
            primary_role,
            direct_permissions,
            resource_grants,
        })
    }

    #[instrument(skip(self))]
    async fn get_role(&self, id: RoleId) -> StorageResult<RoleRecord> {
        self.ensure_available()?;
        self.role_record(id)
    }

    async fn get_child_permissions(
        &self,
        parent_id: PermissionId,
    ) -> StorageResult<Vec<StoredPermission>> {
        self.ensure_available()?;
        let mut children: Vec<StoredPermission> = self
            .permissions
            .iter()
            .filter(|p| p.parent_id == Some(parent_id))
            .map(|p| p.value().clone())
            .collect();
        children.sort_by_key(|p| p.id);
        Ok(children)
    }

    async fn list_permissions(&self) -> StorageResult<Vec<StoredPermission>> {
        self.ensure_available()?;
        let mut permissions: Vec<StoredPermission> =
            self.permissions.iter().map(|p| p.value().clone()).collect();
        permissions.sort_by_key(|p| p.id);
        Ok(permissions)
    }

    async fn upsert_permission(&self, permission: StoredPermission) -> StorageResult<()> {
        validate_permission_code(&permission.code)?;

        let clash = self
            .permissions
            .iter()
            .any(|p| p.code == permission.code && p.id != permission.id);
        if clash {
            return Err(StorageError::DuplicatePermissionCode {
                code: permission.code,
            });
        }

        debug!(id = permission.id, code = %permission.code, "upserting permission");
        self.permissions.insert(permission.id, permission);
        Ok(())
    }

    async fn upsert_role(&self, role: StoredRole) -> StorageResult<()> {
        if role.code.trim().is_empty() {
            return Err(StorageError::InvalidInput {
                message: "role code cannot be empty".to_string(),
            });
        }
        debug!(id = role.id, code = %role.code, "upserting role");
        self.roles.insert(role.id, role);
        Ok(())
    }

    async fn upsert_subject(&self, subject: StoredSubject) -> StorageResult<()> {
        debug!(id = subject.id, "upserting subject");
        self.subjects.insert(subject.id, subject);
        Ok(())
    }

    async fn assign_role(
        &self,
        subject_id: SubjectId,
        role_id: Option<RoleId>,
    ) -> StorageResult<()> {
        if let Some(role_id) = role_id {
            if !self.roles.contains_key(&role_id) {
                return Err(StorageError::RoleNotFound { role_id });
            }
        }
        let mut subject = self
            .subjects
            .get_mut(&subject_id)
            .ok_or(StorageError::SubjectNotFound { subject_id })?;
        subject.primary_role_id = role_id;
        Ok(())
    }

    async fn grant_resource(&self, grant: StoredResourceGrant) -> StorageResult<()> {
        if !self.subjects.contains_key(&grant.subject_id) {
            return Err(StorageError::SubjectNotFound {
                subject_id: grant.subject_id,
            });
        }

        let vocabulary = self.operation_vocabulary(&grant.resource_type);
        validate_grant(&grant, &vocabulary)?;

        let mut grant = grant;
        grant.permission_level = grant.permission_level.to_ascii_lowercase();

        let mut grants = self.grants.entry(grant.subject_id).or_default();
        // Re-grant overwrites level and operations in place
        match grants.iter_mut().find(|g| {
            g.resource_type == grant.resource_type && g.resource_id == grant.resource_id
        }) {
            Some(existing) => *existing = grant,
            None => grants.push(grant),
        }
        Ok(())
    }

    async fn revoke_resource(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
    ) -> StorageResult<()> {
        let not_found = || StorageError::GrantNotFound {
            subject_id,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        };

        let mut grants = self.grants.get_mut(&subject_id).ok_or_else(not_found)?;
        let before = grants.len();
        grants.retain(|g| !(g.resource_type == resource_type && g.resource_id == resource_id));
        if grants.len() == before {
            return Err(not_found());
        }
        Ok(())
    }
}
