//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Subject not found.
    #[error("subject not found: {subject_id}")]
    SubjectNotFound { subject_id: i64 },

    /// Role not found.
    #[error("role not found: {role_id}")]
    RoleNotFound { role_id: i64 },

    /// Permission not found.
    #[error("permission not found: {permission_id}")]
    PermissionNotFound { permission_id: i64 },

    /// Resource grant not found.
    #[error("resource grant not found: subject {subject_id} on {resource_type}:{resource_id}")]
    GrantNotFound {
        subject_id: i64,
        resource_type: String,
        resource_id: String,
    },

    /// Permission code already taken by another permission.
    #[error("duplicate permission code: {code}")]
    DuplicatePermissionCode { code: String },

    /// Database connection error.
    #[error("database connection error: {message}")]
    ConnectionError { message: String },

    /// Database query error.
    #[error("database query error: {message}")]
    QueryError { message: String },

    /// Invalid input error.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Serialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    InternalError { message: String },
}

impl StorageError {
    /// Returns true for "row does not exist" errors, as opposed to backend failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::SubjectNotFound { .. }
                | StorageError::RoleNotFound { .. }
                | StorageError::PermissionNotFound { .. }
                | StorageError::GrantNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError {
            message: err.to_string(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
