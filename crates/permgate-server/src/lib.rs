//! permgate-server: Checking, preloading and monitoring services
//!
//! This crate contains the performance layer around permission resolution:
//! - Batch checker with FAST/ACCURATE/BALANCED modes and singleflight
//! - Adaptive preloader with a priority queue and access-pattern prediction
//! - Performance monitor with windowed statistics, trends and alerts
//! - Configuration management with hot reload
//! - `AuthzService`, the facade wiring all of the above together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               permgate-server               │
//! ├─────────────────────────────────────────────┤
//! │  config.rs   - Configuration management     │
//! │  handlers/   - Request handlers             │
//! │    batch/         - Point and batch checks  │
//! │  preload/    - Cache warming worker         │
//! │  monitor/    - Query telemetry              │
//! │  service.rs  - Component wiring             │
//! └─────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod handlers;
pub mod monitor;
pub mod preload;
pub mod service;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use config::{ConfigLoadError, ServerConfig};
pub use service::{AuthzService, ServiceStats};
