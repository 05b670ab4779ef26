//! Batch checker with cache-aware evaluation modes.
//!
//! This handler answers point checks and batch checks (many subjects times
//! many permission codes and resource checks), optimizing throughput through:
//!
//! 1. **Intra-batch deduplication**: repeated subjects, codes and resource
//!    checks are evaluated once
//! 2. **Singleflight**: concurrent cache misses for the same subject share
//!    one resolution
//! 3. **Cache integration**: FAST and BALANCED answer from the permission
//!    cache and write misses back in the background
//!
//! # Critical Permissions
//!
//! Codes matching the critical prefix list (`admin:`, `system:`,
//! `security:`) or the exact critical codes (`user:delete`, `data:delete`)
//! are never answered from the cache in BALANCED mode or in point checks.
//! A resource check is critical when `resource_type:operation` is.

mod handler;
mod singleflight;
mod types;

pub use handler::BatchChecker;
pub use types::{
    BatchCheckConfig, BatchCheckError, BatchCheckRequest, BatchCheckResponse, BatchCheckResult,
    CheckMode, CheckStrategy, CriticalPermissions, PointCheck, ResourceCheck,
    DEFAULT_MAX_PERMISSIONS, DEFAULT_MAX_SUBJECTS,
};
