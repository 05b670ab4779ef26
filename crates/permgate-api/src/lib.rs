//! permgate-api: Adapters, observability and operability endpoints
//!
//! This crate provides the outer layer around the check service:
//! - `DataStore` to `PermissionSource` adapter
//! - Structured logging and Prometheus metrics setup
//! - `/health` and `/metrics` HTTP routes via Axum
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                permgate-api                 │
//! ├─────────────────────────────────────────────┤
//! │  adapters.rs     - Storage to resolver      │
//! │  observability/  - Logging and metrics      │
//! │  router.rs       - Operability routes       │
//! └─────────────────────────────────────────────┘
//! ```

pub mod adapters;
pub mod observability;
pub mod router;

pub use adapters::DataStorePermissionSource;
pub use router::create_router;
