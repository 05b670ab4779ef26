//! permgate-storage: Permission Store abstraction layer
//!
//! This crate provides the storage abstraction for permgate, including:
//! - `DataStore` trait exposing the joined subject/role lookups the resolver needs
//! - Stored record types for permissions, roles, subjects and resource grants
//! - In-memory implementation for testing and single-node deployments
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              permgate-storage               │
//! ├─────────────────────────────────────────────┤
//! │  traits.rs   - DataStore trait + records    │
//! │  memory.rs   - In-memory implementation     │
//! │  error.rs    - StorageError                 │
//! └─────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use error::{StorageError, StorageResult};
pub use memory::{MemoryDataStore, SeedData};
pub use traits::{
    DataStore, PermissionId, RoleId, RoleRecord, StoredPermission, StoredResourceGrant,
    StoredRole, StoredSubject, SubjectId, SubjectRecord,
};
