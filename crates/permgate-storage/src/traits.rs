//! DataStore trait definition and stored record types.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Identifier of a subject (user) row.
pub type SubjectId = i64;
/// Identifier of a role row.
pub type RoleId = i64;
/// Identifier of a permission row.
pub type PermissionId = i64;

/// Permission levels a resource grant may carry, lowest to highest.
pub const PERMISSION_LEVELS: [&str; 4] = ["read", "write", "admin", "owner"];

/// Operations every resource type understands.
pub const STANDARD_OPERATIONS: [&str; 5] = ["create", "read", "update", "delete", "manage"];

/// A stored permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPermission {
    pub id: PermissionId,
    /// Globally unique code in `resource:operation` form.
    pub code: String,
    #[serde(default)]
    pub name: String,
    pub resource_type: String,
    pub operation_type: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Parent permission; holding the parent implies holding this one.
    #[serde(default)]
    pub parent_id: Option<PermissionId>,
}

/// A stored role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRole {
    pub id: RoleId,
    pub code: String,
    #[serde(default)]
    pub name: String,
    /// Ordering hint only.
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub parent_id: Option<RoleId>,
    #[serde(default)]
    pub permission_ids: Vec<PermissionId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// A stored subject (user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSubject {
    pub id: SubjectId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub primary_role_id: Option<RoleId>,
    #[serde(default)]
    pub direct_permission_ids: Vec<PermissionId>,
}

/// A permission scoped to one concrete resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResourceGrant {
    pub subject_id: SubjectId,
    pub resource_type: String,
    pub resource_id: String,
    /// One of [`PERMISSION_LEVELS`].
    pub permission_level: String,
    /// Optional explicit allow-list of operation names.
    #[serde(default)]
    pub operations: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// A role joined with its directly-assigned permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
    pub role: StoredRole,
    pub permissions: Vec<StoredPermission>,
}

/// A subject with role, direct permissions and resource grants eagerly joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectRecord {
    pub subject: StoredSubject,
    pub primary_role: Option<RoleRecord>,
    pub direct_permissions: Vec<StoredPermission>,
    pub resource_grants: Vec<StoredResourceGrant>,
}

/// Abstract storage interface for authorization data.
///
/// Implementations must be thread-safe (Send + Sync) and support
/// async operations. The read half is what the query resolver consumes;
/// the write half is used by administrative tooling and tests.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    // Read operations

    /// Gets a subject by ID with role, permission and grant associations joined.
    async fn get_subject(&self, id: SubjectId) -> StorageResult<SubjectRecord>;

    /// Gets a role by ID with its permissions. The parent is carried as `role.parent_id`.
    async fn get_role(&self, id: RoleId) -> StorageResult<RoleRecord>;

    /// Lists the direct children of a permission.
    async fn get_child_permissions(
        &self,
        parent_id: PermissionId,
    ) -> StorageResult<Vec<StoredPermission>>;

    /// Lists every permission.
    async fn list_permissions(&self) -> StorageResult<Vec<StoredPermission>>;

    // Write operations

    /// Inserts or replaces a permission.
    async fn upsert_permission(&self, permission: StoredPermission) -> StorageResult<()>;

    /// Inserts or replaces a role.
    async fn upsert_role(&self, role: StoredRole) -> StorageResult<()>;

    /// Inserts or replaces a subject.
    async fn upsert_subject(&self, subject: StoredSubject) -> StorageResult<()>;

    /// Sets (or clears) the primary role of a subject.
    async fn assign_role(&self, subject_id: SubjectId, role_id: Option<RoleId>)
        -> StorageResult<()>;

    /// Creates or overwrites the grant for `(subject, resource_type, resource_id)`.
    async fn grant_resource(&self, grant: StoredResourceGrant) -> StorageResult<()>;

    /// Deletes the grant for `(subject, resource_type, resource_id)`.
    async fn revoke_resource(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
    ) -> StorageResult<()>;
}

/// Validates a permission code has the `resource:operation` shape.
pub fn validate_permission_code(code: &str) -> StorageResult<()> {
    match code.split_once(':') {
        Some((resource, operation))
            if !resource.is_empty() && !operation.is_empty() && !operation.contains(':') =>
        {
            Ok(())
        }
        _ => Err(StorageError::InvalidInput {
            message: format!("permission code must be 'resource:operation', got '{code}'"),
        }),
    }
}

/// Validates a resource grant against the operation vocabulary of its resource type.
///
/// `vocabulary` holds the operation names known for `grant.resource_type`
/// beyond [`STANDARD_OPERATIONS`].
pub fn validate_grant(
    grant: &StoredResourceGrant,
    vocabulary: &HashSet<String>,
) -> StorageResult<()> {
    if grant.resource_type.is_empty() || grant.resource_id.is_empty() {
        return Err(StorageError::InvalidInput {
            message: "resource_type and resource_id cannot be empty".to_string(),
        });
    }

    let level = grant.permission_level.to_ascii_lowercase();
    if !PERMISSION_LEVELS.contains(&level.as_str()) {
        return Err(StorageError::InvalidInput {
            message: format!(
                "permission_level must be one of {:?}, got '{}'",
                PERMISSION_LEVELS, grant.permission_level
            ),
        });
    }

    if let Some(operations) = &grant.operations {
        for operation in operations {
            let known = STANDARD_OPERATIONS.contains(&operation.as_str())
                || vocabulary.contains(operation);
            if !known {
                return Err(StorageError::InvalidInput {
                    message: format!(
                        "operation '{}' is not defined for resource type '{}'",
                        operation, grant.resource_type
                    ),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(level: &str, operations: Option<Vec<&str>>) -> StoredResourceGrant {
        StoredResourceGrant {
            subject_id: 1,
            resource_type: "project".to_string(),
            resource_id: "42".to_string(),
            permission_level: level.to_string(),
            operations: operations.map(|ops| ops.into_iter().map(String::from).collect()),
            is_active: true,
            expires_at: None,
        }
    }

    #[test]
    fn test_permission_code_shape() {
        assert!(validate_permission_code("report:read").is_ok());
        assert!(validate_permission_code("report").is_err());
        assert!(validate_permission_code(":read").is_err());
        assert!(validate_permission_code("report:").is_err());
        assert!(validate_permission_code("a:b:c").is_err());
    }

    #[test]
    fn test_grant_level_must_be_known() {
        let vocabulary = HashSet::new();
        assert!(validate_grant(&grant("WRITE", None), &vocabulary).is_ok());
        assert!(validate_grant(&grant("superuser", None), &vocabulary).is_err());
    }

    #[test]
    fn test_grant_operations_validated_against_vocabulary() {
        let mut vocabulary = HashSet::new();
        vocabulary.insert("export".to_string());

        assert!(validate_grant(&grant("read", Some(vec!["read", "export"])), &vocabulary).is_ok());

        let err = validate_grant(&grant("read", Some(vec!["teleport"])), &vocabulary).unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }
}
