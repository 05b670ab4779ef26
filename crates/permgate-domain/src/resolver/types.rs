//! Types used by the query resolver.

use serde::{Deserialize, Serialize};

use crate::model::{PermissionId, ResourceGrant, RoleId, SubjectId};

/// How fresh a resolution must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Cached role expansions may be reused.
    #[default]
    MinimizeLatency,
    /// Every hierarchy is re-read from the store.
    HigherConsistency,
}

/// A permission as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionNode {
    pub id: PermissionId,
    pub code: String,
    pub is_active: bool,
}

/// A role with its directly-assigned permissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub id: RoleId,
    pub code: String,
    pub parent_id: Option<RoleId>,
    pub permissions: Vec<PermissionNode>,
    pub is_active: bool,
}

/// A subject with its associations loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectSnapshot {
    pub id: SubjectId,
    pub is_superuser: bool,
    pub primary_role: Option<RoleSnapshot>,
    pub direct_permissions: Vec<PermissionNode>,
    pub resource_grants: Vec<ResourceGrant>,
}

/// Counters describing resolver activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    /// Subject resolutions started (point, batch members and resource checks).
    pub resolutions: u64,
    /// Resolutions that ended in an error.
    pub failures: u64,
    /// Role chains served from the role tier of the cache.
    pub role_cache_hits: u64,
}
