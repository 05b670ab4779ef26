//! permgate-domain: Core permission resolution logic
//!
//! This crate contains the core authorization logic including:
//! - Typed permission model (codes, operations, levels, resource grants)
//! - Query resolver that expands role and permission hierarchies
//! - Permission cache with per-tier TTLs and a circuit-broken backing store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               permgate-domain               │
//! ├─────────────────────────────────────────────┤
//! │  model/      - Typed permission model       │
//! │  resolver/   - Hierarchy resolution engine  │
//! │  cache/      - Subject/role/resource cache  │
//! └─────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod model;
pub mod resolver;

// Re-export commonly used types at the crate root
pub use cache::{CacheStats, CacheTtls, Generation, PermissionCache, PermissionCacheConfig};
pub use error::{DomainError, DomainResult};
pub use model::{
    Operation, PermissionCode, PermissionLevel, PermissionId, ResourceAccess, ResourceGrant,
    RoleId, SubjectId, SubjectPermissions,
};
pub use resolver::{Consistency, PermissionSource, QueryResolver, ResolverConfig};
