//! Core type definitions for the permission model.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Identifier of a subject (user).
pub type SubjectId = i64;
/// Identifier of a role.
pub type RoleId = i64;
/// Identifier of a permission.
pub type PermissionId = i64;

/// A permission code in `resource:operation` form (e.g., "report:read").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionCode(String);

impl PermissionCode {
    /// Parses a permission code, validating the `resource:operation` format.
    pub fn parse(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        match value.split_once(':') {
            Some((resource, operation))
                if !resource.is_empty() && !operation.is_empty() && !operation.contains(':') =>
            {
                Ok(Self(value))
            }
            _ => Err(DomainError::InvalidPermissionCode { value }),
        }
    }

    /// Builds a code from its two halves.
    pub fn from_parts(resource: &str, operation: &str) -> DomainResult<Self> {
        Self::parse(format!("{resource}:{operation}"))
    }

    /// The resource half (e.g., "report").
    pub fn resource(&self) -> &str {
        self.0.split_once(':').map(|(r, _)| r).unwrap_or_default()
    }

    /// The operation half (e.g., "read").
    pub fn operation(&self) -> &str {
        self.0.split_once(':').map(|(_, o)| o).unwrap_or_default()
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PermissionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PermissionCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PermissionCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PermissionCode> for String {
    fn from(code: PermissionCode) -> Self {
        code.0
    }
}

/// An operation on a resource.
///
/// The five standard operations are enumerated; anything else a resource
/// type defines is carried as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Manage,
    Custom(String),
}

impl Operation {
    /// Parses an operation name (case-insensitive).
    pub fn parse(value: &str) -> DomainResult<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Ok(match normalized.as_str() {
            "" => {
                return Err(DomainError::InvalidOperation {
                    value: value.to_string(),
                })
            }
            "create" => Operation::Create,
            "read" => Operation::Read,
            "update" => Operation::Update,
            "delete" => Operation::Delete,
            "manage" => Operation::Manage,
            _ => Operation::Custom(normalized),
        })
    }

    /// Returns the operation name.
    pub fn as_str(&self) -> &str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Manage => "manage",
            Operation::Custom(name) => name,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Operation {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Operation> for String {
    fn from(operation: Operation) -> Self {
        operation.as_str().to_string()
    }
}

/// Permission level of a resource grant, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
    Owner,
}

impl PermissionLevel {
    /// Whether this level alone permits the operation.
    ///
    /// OWNER permits everything, including custom operations.
    pub fn allows(&self, operation: &Operation) -> bool {
        match self {
            PermissionLevel::Owner => true,
            PermissionLevel::Admin => matches!(
                operation,
                Operation::Create
                    | Operation::Read
                    | Operation::Update
                    | Operation::Delete
                    | Operation::Manage
            ),
            PermissionLevel::Write => matches!(
                operation,
                Operation::Create | Operation::Read | Operation::Update
            ),
            PermissionLevel::Read => matches!(operation, Operation::Read),
        }
    }

    /// The named operations this level implies.
    pub fn operations(&self) -> Vec<Operation> {
        match self {
            PermissionLevel::Read => vec![Operation::Read],
            PermissionLevel::Write => vec![Operation::Create, Operation::Read, Operation::Update],
            PermissionLevel::Admin | PermissionLevel::Owner => vec![
                Operation::Create,
                Operation::Read,
                Operation::Update,
                Operation::Delete,
                Operation::Manage,
            ],
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(PermissionLevel::Read),
            "write" => Ok(PermissionLevel::Write),
            "admin" => Ok(PermissionLevel::Admin),
            "owner" => Ok(PermissionLevel::Owner),
            _ => Err(DomainError::InvalidPermissionLevel {
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Admin => "admin",
            PermissionLevel::Owner => "owner",
        };
        f.write_str(name)
    }
}

/// A permission scoped to one concrete resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub resource_type: String,
    pub resource_id: String,
    pub level: PermissionLevel,
    /// Explicit allow-list; consulted before level semantics.
    pub operations: Option<HashSet<Operation>>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResourceGrant {
    /// Creates an active, non-expiring grant at the given level.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        level: PermissionLevel,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            level,
            operations: None,
            is_active: true,
            expires_at: None,
        }
    }

    /// Whether the grant counts at `now`. Inactive or expired grants are absent.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    /// Whether the grant targets this resource instance.
    pub fn matches(&self, resource_type: &str, resource_id: &str) -> bool {
        self.resource_type == resource_type && self.resource_id == resource_id
    }

    /// Whether the grant permits the operation, ignoring expiry.
    pub fn allows(&self, operation: &Operation) -> bool {
        let listed = self
            .operations
            .as_ref()
            .is_some_and(|ops| ops.contains(operation));
        listed || self.level.allows(operation)
    }

    /// The effective access this grant confers.
    pub fn access(&self) -> ResourceAccess {
        if self.level == PermissionLevel::Owner {
            return ResourceAccess::all();
        }
        let mut operations: HashSet<Operation> = self.level.operations().into_iter().collect();
        if let Some(listed) = &self.operations {
            operations.extend(listed.iter().cloned());
        }
        ResourceAccess {
            all: false,
            operations,
        }
    }
}

/// The set of operations a subject may perform on one resource instance.
///
/// This is the value cached in the resource tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAccess {
    /// Every operation is allowed (superuser or OWNER).
    pub all: bool,
    pub operations: HashSet<Operation>,
}

impl ResourceAccess {
    /// Unrestricted access.
    pub fn all() -> Self {
        Self {
            all: true,
            operations: HashSet::new(),
        }
    }

    /// No access at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn allows(&self, operation: &Operation) -> bool {
        self.all || self.operations.contains(operation)
    }
}

/// The authoritative permission set of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPermissions {
    pub subject_id: SubjectId,
    pub is_superuser: bool,
    /// Every permission code held, hierarchy-expanded. Empty for superusers.
    pub permission_codes: HashSet<String>,
    pub resource_grants: Vec<ResourceGrant>,
    /// Code of the primary role, if any.
    pub role_code: Option<String>,
    /// Primary role followed by its ancestors, in walk order.
    pub role_chain: Vec<RoleId>,
    pub resolved_at: DateTime<Utc>,
}

impl SubjectPermissions {
    /// A superuser's permission set: every check passes.
    pub fn superuser(subject_id: SubjectId, resolved_at: DateTime<Utc>) -> Self {
        Self {
            subject_id,
            is_superuser: true,
            permission_codes: HashSet::new(),
            resource_grants: Vec::new(),
            role_code: None,
            role_chain: Vec::new(),
            resolved_at,
        }
    }

    /// Whether the subject holds the permission code.
    pub fn has_permission(&self, code: &str) -> bool {
        self.is_superuser || self.permission_codes.contains(code)
    }

    /// The grant in effect for the resource instance at `now`, if any.
    pub fn effective_grant(
        &self,
        resource_type: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> Option<&ResourceGrant> {
        self.resource_grants
            .iter()
            .find(|g| g.matches(resource_type, resource_id) && g.is_effective_at(now))
    }

    /// Effective access to one resource instance at `now`.
    pub fn resource_access(
        &self,
        resource_type: &str,
        resource_id: &str,
        now: DateTime<Utc>,
    ) -> ResourceAccess {
        if self.is_superuser {
            return ResourceAccess::all();
        }
        self.effective_grant(resource_type, resource_id, now)
            .map(ResourceGrant::access)
            .unwrap_or_else(ResourceAccess::none)
    }

    /// Whether the subject may perform `operation` on the resource instance at `now`.
    pub fn can(
        &self,
        resource_type: &str,
        resource_id: &str,
        operation: &Operation,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_superuser {
            return true;
        }
        self.effective_grant(resource_type, resource_id, now)
            .is_some_and(|grant| grant.allows(operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_permission_code_splits_resource_and_operation() {
        let code = PermissionCode::parse("report:export").unwrap();
        assert_eq!(code.resource(), "report");
        assert_eq!(code.operation(), "export");
        assert_eq!(code.to_string(), "report:export");
    }

    #[test]
    fn test_permission_code_rejects_malformed_values() {
        for bad in ["", "report", ":read", "report:", "a:b:c"] {
            assert!(PermissionCode::parse(bad).is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn test_operation_parse_is_case_insensitive_with_custom_fallback() {
        assert_eq!(Operation::parse("READ").unwrap(), Operation::Read);
        assert_eq!(
            Operation::parse("Export").unwrap(),
            Operation::Custom("export".to_string())
        );
        assert!(Operation::parse("  ").is_err());
    }

    #[test]
    fn test_level_semantics() {
        assert!(PermissionLevel::Read.allows(&Operation::Read));
        assert!(!PermissionLevel::Read.allows(&Operation::Update));

        assert!(PermissionLevel::Write.allows(&Operation::Update));
        assert!(!PermissionLevel::Write.allows(&Operation::Delete));

        assert!(PermissionLevel::Admin.allows(&Operation::Manage));
        assert!(!PermissionLevel::Admin.allows(&Operation::Custom("export".into())));

        assert!(PermissionLevel::Owner.allows(&Operation::Custom("export".into())));
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(PermissionLevel::Read < PermissionLevel::Write);
        assert!(PermissionLevel::Admin < PermissionLevel::Owner);
    }

    #[test]
    fn test_explicit_operations_extend_level() {
        let mut grant = ResourceGrant::new("project", "42", PermissionLevel::Read);
        grant.operations = Some(HashSet::from([Operation::Custom("export".into())]));

        assert!(grant.allows(&Operation::Read));
        assert!(grant.allows(&Operation::Custom("export".into())));
        assert!(!grant.allows(&Operation::Delete));
    }

    #[test]
    fn test_expired_and_inactive_grants_are_not_effective() {
        let now = Utc::now();

        let mut expired = ResourceGrant::new("project", "42", PermissionLevel::Owner);
        expired.expires_at = Some(now - Duration::seconds(1));
        assert!(!expired.is_effective_at(now));

        let mut inactive = ResourceGrant::new("project", "42", PermissionLevel::Owner);
        inactive.is_active = false;
        assert!(!inactive.is_effective_at(now));

        let mut future = ResourceGrant::new("project", "42", PermissionLevel::Read);
        future.expires_at = Some(now + Duration::hours(1));
        assert!(future.is_effective_at(now));
    }

    #[test]
    fn test_superuser_passes_everything() {
        let now = Utc::now();
        let perms = SubjectPermissions::superuser(1, now);
        assert!(perms.has_permission("anything:at_all"));
        assert!(perms.can("project", "1", &Operation::Delete, now));
        assert!(perms.resource_access("project", "1", now).all);
    }

    #[test]
    fn test_resource_access_matches_can() {
        let now = Utc::now();
        let perms = SubjectPermissions {
            subject_id: 1,
            is_superuser: false,
            permission_codes: HashSet::new(),
            resource_grants: vec![ResourceGrant::new("project", "42", PermissionLevel::Write)],
            role_code: None,
            role_chain: vec![],
            resolved_at: now,
        };

        let access = perms.resource_access("project", "42", now);
        for op in [
            Operation::Create,
            Operation::Read,
            Operation::Update,
            Operation::Delete,
            Operation::Manage,
        ] {
            assert_eq!(access.allows(&op), perms.can("project", "42", &op, now));
        }
        assert!(!perms.can("project", "43", &Operation::Read, now));
    }

    #[test]
    fn test_subject_permissions_serde_round_trip_keeps_operations() {
        let mut grant = ResourceGrant::new("project", "42", PermissionLevel::Read);
        grant.operations = Some(HashSet::from([Operation::Custom("export".into())]));
        let perms = SubjectPermissions {
            subject_id: 7,
            is_superuser: false,
            permission_codes: HashSet::from(["report:read".to_string()]),
            resource_grants: vec![grant],
            role_code: Some("analyst".into()),
            role_chain: vec![10],
            resolved_at: Utc::now(),
        };

        let json = serde_json::to_string(&perms).unwrap();
        assert!(json.contains("\"export\""));
        let back: SubjectPermissions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, perms);
    }
}
