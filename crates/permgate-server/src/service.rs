//! Authorization service facade.
//!
//! Wires the resolver, cache, batch checker, preloader and performance
//! monitor together and is the single entry point for callers. Every check
//! is timed into the monitor and fed to the preloader's access history.

use std::sync::Arc;
use std::time::{Duration, Instant};

use permgate_domain::resolver::{PermissionSource, QueryResolver, ResolverStats};
use permgate_domain::{
    CacheStats, DomainResult, Operation, PermissionCache, RoleId, SubjectId,
};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::handlers::batch::{
    BatchCheckRequest, BatchCheckResponse, BatchCheckResult, BatchChecker,
};
use crate::monitor::{
    Alert, MonitorExport, PerformanceMonitor, PerformanceStats, QueryMetric, QueryType, TrendPoint,
};
use crate::preload::{PreloadCandidate, PreloadResult, PreloadStats, PreloadStatus, Preloader};

/// Counters of every component at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub resolver: ResolverStats,
    pub preload: PreloadStats,
    /// Performance over the last hour.
    pub performance: PerformanceStats,
}

/// Entry point for authorization checks and administration.
pub struct AuthzService<S>
where
    S: PermissionSource + 'static,
{
    resolver: Arc<QueryResolver<S>>,
    cache: Arc<PermissionCache>,
    checker: BatchChecker<S>,
    preloader: Arc<Preloader<S>>,
    monitor: Arc<PerformanceMonitor>,
}

impl<S> std::fmt::Debug for AuthzService<S>
where
    S: PermissionSource + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzService")
            .field("checker", &self.checker)
            .field("preloader", &self.preloader)
            .finish()
    }
}

impl<S> AuthzService<S>
where
    S: PermissionSource + 'static,
{
    /// Builds every component from configuration.
    ///
    /// The resolver reuses the cache's role tier for latency-minimizing
    /// resolutions.
    pub fn new(source: Arc<S>, config: &ServerConfig) -> Self {
        let cache = Arc::new(PermissionCache::new(config.cache.to_cache_config()));
        let resolver_config = config
            .resolver
            .to_resolver_config()
            .with_role_cache(Arc::clone(&cache));
        let resolver = Arc::new(QueryResolver::with_config(source, resolver_config));
        Self::from_parts(resolver, cache, config)
    }

    /// Builds the service around an existing resolver and cache.
    pub fn from_parts(
        resolver: Arc<QueryResolver<S>>,
        cache: Arc<PermissionCache>,
        config: &ServerConfig,
    ) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.to_monitor_config()));
        let preloader = Preloader::new(
            Arc::clone(&resolver),
            Arc::clone(&cache),
            config.preload.to_preload_config(),
        );
        preloader.attach_monitor(Arc::clone(&monitor));
        let checker = BatchChecker::new(Arc::clone(&resolver), Arc::clone(&cache))
            .with_config(config.batch.to_batch_config())
            .with_preloader(Arc::clone(&preloader));

        Self {
            resolver,
            cache,
            checker,
            preloader,
            monitor,
        }
    }

    /// Starts the preloader's background tasks.
    pub fn start(&self) {
        self.preloader.start();
    }

    /// Stops background work; in-flight preloads may be abandoned.
    pub async fn shutdown(&self) {
        self.preloader.shutdown().await;
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &Arc<QueryResolver<S>> {
        &self.resolver
    }

    pub fn checker(&self) -> &BatchChecker<S> {
        &self.checker
    }

    pub fn preloader(&self) -> &Arc<Preloader<S>> {
        &self.preloader
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    /// Whether the subject holds the permission code.
    ///
    /// An error means the answer is unknown, not denied.
    pub async fn check_permission(&self, subject_id: SubjectId, code: &str) -> DomainResult<bool> {
        let start = Instant::now();
        let result = self.checker.check_permission(subject_id, code).await;
        let elapsed = start.elapsed();

        let metric = QueryMetric::new(QueryType::PermissionCheck, elapsed)
            .with_subject(subject_id)
            .with_permission(code);
        let metric = match &result {
            Ok(check) => metric.with_cache_hit(check.cache_hit),
            Err(e) => metric.with_error(e.to_string()),
        };
        self.observe(metric);
        self.preloader.record_access(&[subject_id], &[code.to_string()]);

        result.map(|check| check.allowed)
    }

    /// Whether the subject may perform `operation` on one resource instance.
    pub async fn check_resource_operation(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
        operation: &Operation,
    ) -> DomainResult<bool> {
        let start = Instant::now();
        let result = self
            .checker
            .check_resource_operation(subject_id, resource_type, resource_id, operation)
            .await;
        let elapsed = start.elapsed();

        let metric = QueryMetric::new(QueryType::ResourceCheck, elapsed)
            .with_subject(subject_id)
            .with_resource_type(resource_type)
            .with_permission(format!("{resource_type}:{}", operation.as_str()));
        let metric = match &result {
            Ok(check) => metric.with_cache_hit(check.cache_hit),
            Err(e) => metric.with_error(e.to_string()),
        };
        self.observe(metric);
        self.preloader.record_access(&[subject_id], &[]);

        result.map(|check| check.allowed)
    }

    /// Runs a batch check. Per-subject failures are in the response.
    pub async fn batch_check(
        &self,
        request: BatchCheckRequest,
    ) -> BatchCheckResult<BatchCheckResponse> {
        let subjects = request.subject_ids.clone();
        let codes = request.permission_codes.clone();

        let start = Instant::now();
        let result = self.checker.batch_check(request).await;
        let elapsed = start.elapsed();

        let mut metric = QueryMetric::new(QueryType::BatchCheck, elapsed);
        if let [subject_id] = subjects.as_slice() {
            metric = metric.with_subject(*subject_id);
        }
        let metric = match &result {
            Ok(response) if response.failures.is_empty() => {
                metric.with_cache_hit(response.cache_hit_rate >= 1.0)
            }
            Ok(response) => metric
                .with_cache_hit(response.cache_hit_rate >= 1.0)
                .with_error(format!("{} subject(s) failed", response.failures.len())),
            Err(e) => metric.with_error(e.to_string()),
        };
        self.observe(metric);

        if result.is_ok() {
            self.preloader.record_access(&subjects, &codes);
        }
        result
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn invalidate_user(&self, subject_id: SubjectId) {
        let start = Instant::now();
        self.cache.invalidate(subject_id).await;
        self.observe(QueryMetric::new(QueryType::Invalidation, start.elapsed()).with_subject(subject_id));
        info!(subject_id, "subject invalidated");
    }

    #[instrument(skip(self))]
    pub async fn invalidate_role(&self, role_id: RoleId) {
        let start = Instant::now();
        self.cache.invalidate_role(role_id).await;
        self.observe(QueryMetric::new(QueryType::Invalidation, start.elapsed()));
    }

    #[instrument(skip(self))]
    pub async fn invalidate_all(&self) {
        let start = Instant::now();
        self.cache.invalidate_all().await;
        self.observe(QueryMetric::new(QueryType::Invalidation, start.elapsed()));
    }

    /// Queues subjects for warming. Empty `codes` warm every permission.
    pub fn request_preload(
        &self,
        subject_ids: Vec<SubjectId>,
        codes: Vec<String>,
        priority: u8,
        requester: &str,
    ) -> PreloadResult<Uuid> {
        self.preloader
            .request_preload(subject_ids, codes, priority, requester)
    }

    pub fn preload_status(&self, id: Uuid) -> Option<PreloadStatus> {
        self.preloader.status(id)
    }

    pub fn predict_candidates(&self) -> Vec<PreloadCandidate> {
        self.preloader.analyze_access_patterns()
    }

    pub fn auto_preload(&self) -> PreloadResult<Vec<Uuid>> {
        self.preloader.auto_preload()
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn stats(&self, query_type: Option<QueryType>, window_minutes: u64) -> PerformanceStats {
        self.monitor.stats(query_type, window_minutes)
    }

    pub fn component_stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats(),
            resolver: self.resolver.stats(),
            preload: self.preloader.stats(),
            performance: self.monitor.stats(None, 60),
        }
    }

    pub fn slow_queries(&self, threshold: Option<Duration>, limit: usize) -> Vec<QueryMetric> {
        self.monitor.slow_queries(threshold, limit)
    }

    pub fn trends(&self, hours: u64, interval_minutes: u64) -> Vec<TrendPoint> {
        self.monitor.trends(hours, interval_minutes)
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.monitor.alerts()
    }

    pub fn reset(&self) {
        self.monitor.reset();
    }

    pub fn export(&self) -> MonitorExport {
        self.monitor.export()
    }

    /// Pushes the reloadable sections of `config` into every component.
    ///
    /// Resolver concurrency and timeout, server and storage settings take
    /// effect only on restart.
    pub fn apply_settings(&self, config: &ServerConfig) {
        self.cache.update_config(config.cache.to_cache_config());
        self.checker.update_config(config.batch.to_batch_config());
        self.preloader.update_config(config.preload.to_preload_config());
        self.monitor.update_config(config.monitor.to_monitor_config());
        info!("applied reloaded settings");
    }

    fn observe(&self, metric: QueryMetric) {
        metrics::histogram!(
            "permgate_check_duration_seconds",
            "kind" => metric.query_type.as_str()
        )
        .record(metric.execution_time.as_secs_f64());
        self.monitor.record(metric);
    }
}
