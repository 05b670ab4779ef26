//! Operability routes.
//!
//! Checks are consumed in-process through [`AuthzService`]; the HTTP surface
//! is limited to liveness and Prometheus scraping.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use permgate_domain::PermissionSource;
use permgate_server::AuthzService;

use crate::observability::{metrics_handler, MetricsState};

/// Default path of the Prometheus endpoint.
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Builds the router.
///
/// `/metrics` is mounted at `metrics_path` only when a [`MetricsState`] is
/// given (metrics may be disabled in configuration).
pub fn create_router<S>(
    service: Arc<AuthzService<S>>,
    metrics: Option<(MetricsState, &str)>,
) -> Router
where
    S: PermissionSource + 'static,
{
    let router = Router::new()
        .route("/health", get(health_check::<S>))
        .with_state(service);

    match metrics {
        Some((state, path)) => router.merge(
            Router::new()
                .route(path, get(metrics_handler))
                .with_state(state),
        ),
        None => router,
    }
}

/// Liveness check; also reports the cache circuit and preload backlog.
async fn health_check<S>(State(service): State<Arc<AuthzService<S>>>) -> impl IntoResponse
where
    S: PermissionSource + 'static,
{
    let cache = service.cache().stats();
    let preload = service.preloader().stats();
    Json(serde_json::json!({
        "status": "ok",
        "cache": {
            "enabled": service.cache().is_enabled(),
            "circuit": cache.circuit_state,
            "hit_rate": cache.hit_rate(),
        },
        "preload": {
            "queue_len": preload.queue_len,
            "tracked_subjects": preload.tracked_subjects,
        },
    }))
}
