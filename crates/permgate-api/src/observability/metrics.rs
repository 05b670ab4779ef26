//! Prometheus metrics infrastructure.
//!
//! Components record through the `metrics` facade; this module installs the
//! `metrics-exporter-prometheus` recorder and serves its text exposition.
//!
//! # Metrics Exposed
//!
//! - `permgate_check_duration_seconds` - Check latency by kind (point, resource, batch)
//! - `permgate_batch_check_duration_seconds` - Batch checker latency by mode
//! - `permgate_resolve_duration_seconds` - Resolver latency
//! - `permgate_cache_{hits,misses,writes}_total` - Cache traffic by tier
//! - `permgate_cache_errors_total` / `permgate_cache_circuit_opened_total` - Cache store health
//! - `permgate_preload_requests_total` - Preload requests by outcome
//! - `permgate_preload_queue_depth` - Pending preload requests
//! - `permgate_preload_duration_seconds` - Preload processing time

use std::sync::Arc;

use axum::{extract::State, http::header::CONTENT_TYPE, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Shared state containing the Prometheus handle for metrics rendering.
#[derive(Clone)]
pub struct MetricsState {
    handle: Arc<PrometheusHandle>,
}

impl MetricsState {
    pub fn new(handle: PrometheusHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Renders the current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Error type for metrics initialization.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: recorder already installed")]
    AlreadyInstalled,
}

/// Installs the process-wide Prometheus recorder.
///
/// Must run once at startup, before any component records.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics() -> Result<MetricsState, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|_| MetricsError::AlreadyInstalled)?;

    register_default_metrics();

    Ok(MetricsState::new(handle))
}

fn register_default_metrics() {
    metrics::describe_histogram!(
        "permgate_check_duration_seconds",
        "Authorization check duration in seconds, by kind"
    );
    metrics::describe_histogram!(
        "permgate_batch_check_duration_seconds",
        "Batch checker duration in seconds, by mode"
    );
    metrics::describe_histogram!(
        "permgate_resolve_duration_seconds",
        "Subject resolution duration in seconds"
    );

    metrics::describe_counter!(
        "permgate_preload_requests_total",
        "Preload requests by outcome (accepted, evicted, rejected, done, failed)"
    );
    metrics::describe_gauge!(
        "permgate_preload_queue_depth",
        "Number of preload requests waiting in the queue"
    );
    metrics::describe_histogram!(
        "permgate_preload_duration_seconds",
        "Preload request processing time in seconds"
    );

    permgate_domain::cache::register_cache_metrics();
}

/// Prometheus exposition format content type.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Handler for the `/metrics` endpoint.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], state.render())
}
