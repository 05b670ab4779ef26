//! Traits for permission store operations needed by the resolver.

use async_trait::async_trait;

use crate::error::DomainResult;
use crate::model::{PermissionId, RoleId, SubjectId};

use super::types::{PermissionNode, RoleSnapshot, SubjectSnapshot};

/// Read access to the authoritative permission store.
///
/// The query resolver is the only consumer of this trait; everything else
/// reaches the store through the resolver.
#[async_trait]
pub trait PermissionSource: Send + Sync {
    /// Loads a subject with its primary role, direct permissions and grants.
    ///
    /// Returns `DomainError::SubjectNotFound` when the subject does not exist.
    async fn load_subject(&self, subject_id: SubjectId) -> DomainResult<SubjectSnapshot>;

    /// Loads a role with its directly-assigned permissions and parent reference.
    ///
    /// Returns `DomainError::RoleNotFound` when the role does not exist.
    async fn load_role(&self, role_id: RoleId) -> DomainResult<RoleSnapshot>;

    /// Lists the direct children of a permission.
    async fn load_child_permissions(
        &self,
        permission_id: PermissionId,
    ) -> DomainResult<Vec<PermissionNode>>;
}
