//! Tests for the query resolver module.
//!
//! Organized by functionality:
//! - Direct permissions and permission-tree expansion
//! - Role inheritance
//! - Safety features (cycles, dangling references, timeouts, concurrency)
//! - Resource grants
//! - Role tier of the cache and consistency preference

mod mocks;
