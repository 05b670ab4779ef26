//! Observability infrastructure for permgate.
//!
//! This module provides:
//! - Prometheus metrics recorder and `/metrics` endpoint
//! - Structured logging configuration

mod logging;
mod metrics;

pub use logging::{create_json_layer, init_logging, parse_log_level, LoggingConfig};
pub use metrics::{init_metrics, metrics_handler, MetricsError, MetricsState};
