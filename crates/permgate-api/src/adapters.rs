//! Adapters bridging the storage and domain layers.
//!
//! The resolver in `permgate-domain` only knows [`PermissionSource`]. This
//! module implements it on top of any [`DataStore`], converting stored rows
//! into resolver snapshots and storage errors into domain errors.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use permgate_domain::error::{DomainError, DomainResult};
use permgate_domain::model::{Operation, PermissionLevel, ResourceGrant};
use permgate_domain::resolver::{PermissionNode, PermissionSource, RoleSnapshot, SubjectSnapshot};
use permgate_domain::{PermissionId, RoleId, SubjectId};
use permgate_storage::{
    DataStore, RoleRecord, StorageError, StoredPermission, StoredResourceGrant, SubjectRecord,
};
use tracing::instrument;

/// Serves resolver loads from a [`DataStore`].
pub struct DataStorePermissionSource<D: DataStore> {
    store: Arc<D>,
}

impl<D: DataStore> DataStorePermissionSource<D> {
    pub fn new(store: Arc<D>) -> Self {
        Self { store }
    }

    /// The wrapped store, for administrative writes.
    pub fn store(&self) -> &Arc<D> {
        &self.store
    }
}

impl<D: DataStore> std::fmt::Debug for DataStorePermissionSource<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStorePermissionSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<D: DataStore> PermissionSource for DataStorePermissionSource<D> {
    #[instrument(skip(self))]
    async fn load_subject(&self, subject_id: SubjectId) -> DomainResult<SubjectSnapshot> {
        let record = self
            .store
            .get_subject(subject_id)
            .await
            .map_err(storage_to_domain_error)?;
        subject_snapshot(record)
    }

    #[instrument(skip(self))]
    async fn load_role(&self, role_id: RoleId) -> DomainResult<RoleSnapshot> {
        let record = self
            .store
            .get_role(role_id)
            .await
            .map_err(storage_to_domain_error)?;
        Ok(role_snapshot(record))
    }

    #[instrument(skip(self))]
    async fn load_child_permissions(
        &self,
        permission_id: PermissionId,
    ) -> DomainResult<Vec<PermissionNode>> {
        let children = self
            .store
            .get_child_permissions(permission_id)
            .await
            .map_err(storage_to_domain_error)?;
        Ok(children.into_iter().map(permission_node).collect())
    }
}

/// Maps storage failures onto the resolver's error vocabulary.
///
/// Missing rows keep their meaning; everything else becomes a resolver error
/// so the checker treats it as a backend failure.
pub fn storage_to_domain_error(err: StorageError) -> DomainError {
    match err {
        StorageError::SubjectNotFound { subject_id } => DomainError::SubjectNotFound { subject_id },
        StorageError::RoleNotFound { role_id } => DomainError::RoleNotFound { role_id },
        other => DomainError::ResolverError {
            message: format!("storage error: {}", other),
        },
    }
}

fn permission_node(permission: StoredPermission) -> PermissionNode {
    PermissionNode {
        id: permission.id,
        code: permission.code,
        is_active: permission.is_active,
    }
}

fn role_snapshot(record: RoleRecord) -> RoleSnapshot {
    RoleSnapshot {
        id: record.role.id,
        code: record.role.code,
        parent_id: record.role.parent_id,
        permissions: record.permissions.into_iter().map(permission_node).collect(),
        is_active: record.role.is_active,
    }
}

fn subject_snapshot(record: SubjectRecord) -> DomainResult<SubjectSnapshot> {
    let resource_grants = record
        .resource_grants
        .into_iter()
        .map(resource_grant)
        .collect::<DomainResult<Vec<_>>>()?;

    Ok(SubjectSnapshot {
        id: record.subject.id,
        is_superuser: record.subject.is_superuser,
        primary_role: record.primary_role.map(role_snapshot),
        direct_permissions: record
            .direct_permissions
            .into_iter()
            .map(permission_node)
            .collect(),
        resource_grants,
    })
}

/// Malformed level or operation names surface as resolution errors.
fn resource_grant(stored: StoredResourceGrant) -> DomainResult<ResourceGrant> {
    let level = PermissionLevel::from_str(&stored.permission_level)?;
    let operations = stored
        .operations
        .map(|ops| {
            ops.iter()
                .map(|op| Operation::parse(op))
                .collect::<DomainResult<_>>()
        })
        .transpose()?;

    let mut grant = ResourceGrant::new(stored.resource_type, stored.resource_id, level);
    grant.operations = operations;
    grant.is_active = stored.is_active;
    grant.expires_at = stored.expires_at;
    Ok(grant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use permgate_storage::{MemoryDataStore, StoredRole, StoredSubject};

    fn permission(id: i64, code: &str, parent_id: Option<i64>) -> StoredPermission {
        let (resource_type, operation_type) = code.split_once(':').unwrap();
        StoredPermission {
            id,
            code: code.to_string(),
            name: code.to_string(),
            resource_type: resource_type.to_string(),
            operation_type: operation_type.to_string(),
            is_active: true,
            parent_id,
        }
    }

    async fn seeded_store() -> Arc<MemoryDataStore> {
        let store = MemoryDataStore::new_shared();
        store
            .upsert_permission(permission(1, "report:read", None))
            .await
            .unwrap();
        store
            .upsert_permission(permission(2, "report:export", Some(1)))
            .await
            .unwrap();
        store
            .upsert_role(StoredRole {
                id: 10,
                code: "analyst".to_string(),
                name: "Analyst".to_string(),
                level: 1,
                parent_id: None,
                permission_ids: vec![1],
                is_active: true,
            })
            .await
            .unwrap();
        store
            .upsert_subject(StoredSubject {
                id: 7,
                username: "alice".to_string(),
                is_superuser: false,
                primary_role_id: Some(10),
                direct_permission_ids: vec![2],
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_subject_converts_joined_record() {
        let source = DataStorePermissionSource::new(seeded_store().await);

        let snapshot = source.load_subject(7).await.unwrap();

        assert!(!snapshot.is_superuser);
        let role = snapshot.primary_role.unwrap();
        assert_eq!(role.code, "analyst");
        assert_eq!(role.permissions[0].code, "report:read");
        assert_eq!(snapshot.direct_permissions[0].code, "report:export");
    }

    #[tokio::test]
    async fn test_missing_rows_map_to_not_found() {
        let source = DataStorePermissionSource::new(seeded_store().await);

        let subject = source.load_subject(999).await.unwrap_err();
        let role = source.load_role(999).await.unwrap_err();

        assert!(matches!(subject, DomainError::SubjectNotFound { subject_id: 999 }));
        assert!(matches!(role, DomainError::RoleNotFound { role_id: 999 }));
    }

    #[tokio::test]
    async fn test_unavailable_store_maps_to_resolver_error() {
        let store = seeded_store().await;
        store.set_available(false);
        let source = DataStorePermissionSource::new(store);

        let err = source.load_subject(7).await.unwrap_err();

        match err {
            DomainError::ResolverError { message } => assert!(message.starts_with("storage error")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_child_permissions_loaded() {
        let source = DataStorePermissionSource::new(seeded_store().await);

        let children = source.load_child_permissions(1).await.unwrap();

        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, 2);
    }

    #[test]
    fn test_grant_with_unknown_level_is_rejected() {
        let stored = StoredResourceGrant {
            subject_id: 7,
            resource_type: "project".to_string(),
            resource_id: "42".to_string(),
            permission_level: "superpower".to_string(),
            operations: None,
            is_active: true,
            expires_at: None,
        };

        let err = resource_grant(stored).unwrap_err();

        assert!(matches!(err, DomainError::InvalidPermissionLevel { .. }));
    }

    #[test]
    fn test_grant_operations_are_parsed() {
        let stored = StoredResourceGrant {
            subject_id: 7,
            resource_type: "project".to_string(),
            resource_id: "42".to_string(),
            permission_level: "READ".to_string(),
            operations: Some(vec!["read".to_string(), "export".to_string()]),
            is_active: false,
            expires_at: None,
        };

        let grant = resource_grant(stored).unwrap();

        assert_eq!(grant.level, PermissionLevel::Read);
        let ops = grant.operations.unwrap();
        assert!(ops.contains(&Operation::Read));
        assert!(ops.contains(&Operation::parse("export").unwrap()));
        assert!(!grant.is_active);
    }
}
