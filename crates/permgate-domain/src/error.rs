//! Domain error types for permission resolution.

use thiserror::Error;

/// Domain-specific errors for permission resolution.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    /// Subject does not exist in the permission store.
    #[error("subject not found: {subject_id}")]
    SubjectNotFound { subject_id: i64 },

    /// Role does not exist in the permission store.
    #[error("role not found: {role_id}")]
    RoleNotFound { role_id: i64 },

    /// Error during permission resolution (store unreachable, malformed data).
    #[error("resolver error: {message}")]
    ResolverError { message: String },

    /// Timeout during resolution.
    #[error("timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Invalid permission code format.
    #[error("invalid permission code: {value}")]
    InvalidPermissionCode { value: String },

    /// Invalid operation name.
    #[error("invalid operation: {value}")]
    InvalidOperation { value: String },

    /// Invalid permission level.
    #[error("invalid permission level: {value}")]
    InvalidPermissionLevel { value: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
