//! Batch checker implementation.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use permgate_domain::resolver::{Consistency, PermissionSource, QueryResolver};
use permgate_domain::cache::Generation;
use permgate_domain::{
    DomainResult, Operation, PermissionCache, SubjectId, SubjectPermissions,
};
use tracing::{debug, instrument, warn};

use super::singleflight::{Singleflight, SingleflightGuard, SingleflightSlot};
use super::types::{
    BatchCheckConfig, BatchCheckError, BatchCheckRequest, BatchCheckResponse, BatchCheckResult,
    CheckMode, CheckStrategy, PointCheck, ResourceCheck,
};
use crate::preload::Preloader;

/// Priority used when a batch check asks for missing subjects to be warmed.
const PRELOAD_PRIORITY: u8 = 1;

type Resolution = DomainResult<SubjectPermissions>;

/// A resolution and the cache generation captured before it read the store.
type Stamped = (Generation, Resolution);

/// Answers point and batch authorization questions.
///
/// Chooses between the permission cache and the query resolver per request
/// mode, and schedules resolver work per request strategy:
///
/// | mode     | cache | resolver                                          |
/// |----------|-------|---------------------------------------------------|
/// | FAST     | yes   | misses only, written back in the background       |
/// | ACCURATE | no    | every subject, higher consistency                 |
/// | BALANCED | yes   | misses, then critical checks re-resolved strictly |
///
/// Concurrent misses for the same subject share one resolution through a
/// singleflight. Every resolution carries the cache [`Generation`] captured
/// before it started, so a result overtaken by an invalidation is neither
/// written back nor handed to callers that arrive after the invalidation.
pub struct BatchChecker<S>
where
    S: PermissionSource + 'static,
{
    resolver: Arc<QueryResolver<S>>,
    cache: Arc<PermissionCache>,
    preloader: Option<Arc<Preloader<S>>>,
    config: RwLock<BatchCheckConfig>,
    singleflight: Singleflight<SubjectId, Stamped>,
}

impl<S> std::fmt::Debug for BatchChecker<S>
where
    S: PermissionSource + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchChecker")
            .field("config", &*self.config.read())
            .field("in_flight", &self.singleflight.in_flight())
            .finish()
    }
}

impl<S> BatchChecker<S>
where
    S: PermissionSource + 'static,
{
    /// Creates a checker with default configuration and no preloader.
    pub fn new(resolver: Arc<QueryResolver<S>>, cache: Arc<PermissionCache>) -> Self {
        Self {
            resolver,
            cache,
            preloader: None,
            config: RwLock::new(BatchCheckConfig::default()),
            singleflight: Singleflight::new(),
        }
    }

    pub fn with_config(self, config: BatchCheckConfig) -> Self {
        *self.config.write() = config;
        self
    }

    /// Enables `preload_missing` requests.
    pub fn with_preloader(mut self, preloader: Arc<Preloader<S>>) -> Self {
        self.preloader = Some(preloader);
        self
    }

    pub fn config(&self) -> BatchCheckConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: BatchCheckConfig) {
        *self.config.write() = config;
    }

    /// Whether the permission code is always checked authoritatively.
    pub fn is_critical(&self, code: &str) -> bool {
        self.config.read().critical.is_critical(code)
    }

    /// Validates a batch check request against the configured caps.
    pub fn validate(&self, request: &BatchCheckRequest) -> BatchCheckResult<()> {
        validate_request(request, &self.config.read())
    }

    // ------------------------------------------------------------------
    // Point checks
    // ------------------------------------------------------------------

    /// Whether the subject holds the permission code.
    ///
    /// Critical codes are resolved with higher consistency; everything else
    /// is answered from the cache when possible.
    #[instrument(skip(self))]
    pub async fn check_permission(
        &self,
        subject_id: SubjectId,
        code: &str,
    ) -> DomainResult<PointCheck> {
        if self.is_critical(code) {
            let (generation, result) = self
                .resolve_fresh(subject_id, Consistency::HigherConsistency)
                .await;
            let perms = result?;
            let allowed = perms.has_permission(code);
            self.write_back(vec![(generation, perms)]);
            return Ok(PointCheck {
                allowed,
                cache_hit: false,
            });
        }

        if let Some(perms) = self.cache.get(subject_id).await {
            return Ok(PointCheck {
                allowed: perms.has_permission(code),
                cache_hit: true,
            });
        }

        let (generation, result) = self.resolve_shared(subject_id).await;
        let perms = result?;
        let allowed = perms.has_permission(code);
        self.write_back(vec![(generation, perms)]);
        Ok(PointCheck {
            allowed,
            cache_hit: false,
        })
    }

    /// Whether the subject may perform `operation` on one resource instance.
    #[instrument(skip(self, operation), fields(operation = operation.as_str()))]
    pub async fn check_resource_operation(
        &self,
        subject_id: SubjectId,
        resource_type: &str,
        resource_id: &str,
        operation: &Operation,
    ) -> DomainResult<PointCheck> {
        let critical = self
            .config
            .read()
            .critical
            .is_critical_resource(resource_type, operation);
        if critical {
            let allowed = self
                .resolver
                .resolve_resource_operation(subject_id, resource_type, resource_id, operation)
                .await?;
            return Ok(PointCheck {
                allowed,
                cache_hit: false,
            });
        }

        let read_at = self.cache.generation();
        if let Some(access) = self
            .cache
            .get_resource_ops(subject_id, resource_type, resource_id)
            .await
        {
            return Ok(PointCheck {
                allowed: access.allows(operation),
                cache_hit: true,
            });
        }

        let (perms, generation, cache_hit) = match self.cache.get(subject_id).await {
            Some(perms) => (perms, read_at, true),
            None => {
                let (generation, result) = self.resolve_shared(subject_id).await;
                let perms = result?;
                self.write_back(vec![(generation, perms.clone())]);
                (perms, generation, false)
            }
        };

        let now = Utc::now();
        let access = perms.resource_access(resource_type, resource_id, now);
        let allowed = access.allows(operation);

        // Never let a cached access outlive the grant it came from
        let mut ttl = self.cache.config().ttls.resource;
        if let Some(expires_at) = perms
            .effective_grant(resource_type, resource_id, now)
            .and_then(|grant| grant.expires_at)
        {
            ttl = ttl.min((expires_at - now).to_std().unwrap_or(Duration::ZERO));
        }

        let cache = Arc::clone(&self.cache);
        let resource_type = resource_type.to_string();
        let resource_id = resource_id.to_string();
        tokio::spawn(async move {
            cache
                .put_resource_ops_with_ttl(
                    subject_id,
                    &resource_type,
                    &resource_id,
                    &access,
                    generation,
                    ttl,
                )
                .await;
        });

        Ok(PointCheck { allowed, cache_hit })
    }

    // ------------------------------------------------------------------
    // Batch checks
    // ------------------------------------------------------------------

    /// Executes a batch check request.
    ///
    /// Validation errors reject the whole request before any work starts.
    /// Resolution errors are reported per subject in
    /// [`BatchCheckResponse::failures`].
    #[instrument(
        skip(self, request),
        fields(
            subjects = request.subject_ids.len(),
            codes = request.permission_codes.len(),
            mode = ?request.mode,
            strategy = ?request.strategy,
        )
    )]
    pub async fn batch_check(
        &self,
        request: BatchCheckRequest,
    ) -> BatchCheckResult<BatchCheckResponse> {
        let start = Instant::now();
        let config = self.config.read().clone();
        validate_request(&request, &config)?;

        let subjects = dedupe(&request.subject_ids);
        let codes = dedupe(&request.permission_codes);
        let checks = dedupe(&request.resource_checks);
        let total_checks = subjects.len() * (codes.len() + checks.len());

        let mut response = BatchCheckResponse::default();

        match request.mode {
            CheckMode::Accurate => {
                let resolved = self
                    .resolve_subjects(
                        &subjects,
                        Consistency::HigherConsistency,
                        request.strategy,
                        total_checks,
                        &config,
                    )
                    .await;
                apply_resolutions(&mut response, unstamp(resolved), &codes, &checks);
            }
            CheckMode::Fast | CheckMode::Balanced => {
                if request.preload_missing {
                    self.preload_missing(&subjects, &codes, &config).await;
                }

                response.cache_hit_rate = self
                    .fast_pass(
                        &mut response,
                        &subjects,
                        &codes,
                        &checks,
                        request.strategy,
                        total_checks,
                        &config,
                    )
                    .await;

                if request.mode == CheckMode::Balanced {
                    self.recheck_critical(
                        &mut response,
                        &subjects,
                        &codes,
                        &checks,
                        request.strategy,
                        &config,
                    )
                    .await;
                }
            }
        }

        response.execution_time = start.elapsed();
        metrics::histogram!("permgate_batch_check_duration_seconds", "mode" => mode_label(request.mode))
            .record(response.execution_time.as_secs_f64());
        debug!(
            failures = response.failures.len(),
            cache_hit_rate = response.cache_hit_rate,
            elapsed_ms = response.execution_time.as_millis() as u64,
            "batch check complete"
        );

        Ok(response)
    }

    /// Answers every pair from the cache, resolving subjects that miss.
    ///
    /// Returns the cache hit rate of the pass.
    #[allow(clippy::too_many_arguments)]
    async fn fast_pass(
        &self,
        response: &mut BatchCheckResponse,
        subjects: &[SubjectId],
        codes: &[String],
        checks: &[ResourceCheck],
        strategy: CheckStrategy,
        total_checks: usize,
        config: &BatchCheckConfig,
    ) -> f64 {
        let lookups = join_all(subjects.iter().map(|id| self.cache.get(*id))).await;

        let mut resolved: HashMap<SubjectId, Resolution> = HashMap::with_capacity(subjects.len());
        let mut missing = Vec::new();
        for (id, cached) in subjects.iter().zip(lookups) {
            match cached {
                Some(perms) => {
                    resolved.insert(*id, Ok(perms));
                }
                None => missing.push(*id),
            }
        }
        let hits = resolved.len();

        if !missing.is_empty() {
            debug!(missing = missing.len(), "resolving cache misses");
            let fresh = self
                .resolve_subjects(
                    &missing,
                    Consistency::MinimizeLatency,
                    strategy,
                    total_checks,
                    config,
                )
                .await;
            self.write_back(
                fresh
                    .values()
                    .filter_map(|(generation, result)| {
                        result.as_ref().ok().map(|perms| (*generation, perms.clone()))
                    })
                    .collect(),
            );
            resolved.extend(unstamp(fresh));
        }

        apply_resolutions(response, resolved, codes, checks);

        if subjects.is_empty() {
            0.0
        } else {
            hits as f64 / subjects.len() as f64
        }
    }

    /// Overwrites critical answers with strictly-resolved ones.
    async fn recheck_critical(
        &self,
        response: &mut BatchCheckResponse,
        subjects: &[SubjectId],
        codes: &[String],
        checks: &[ResourceCheck],
        strategy: CheckStrategy,
        config: &BatchCheckConfig,
    ) {
        let critical_codes: Vec<String> = codes
            .iter()
            .filter(|code| config.critical.is_critical(code))
            .cloned()
            .collect();
        let critical_checks: Vec<ResourceCheck> = checks
            .iter()
            .filter(|check| {
                config
                    .critical
                    .is_critical_resource(&check.resource_type, &check.operation)
            })
            .cloned()
            .collect();

        if critical_codes.is_empty() && critical_checks.is_empty() {
            return;
        }

        debug!(
            codes = critical_codes.len(),
            resource_checks = critical_checks.len(),
            "re-checking critical permissions"
        );

        let total = subjects.len() * (critical_codes.len() + critical_checks.len());
        let resolved = self
            .resolve_subjects(
                subjects,
                Consistency::HigherConsistency,
                strategy,
                total,
                config,
            )
            .await;

        for (subject_id, (_, result)) in resolved {
            match result {
                Ok(perms) => {
                    let (allowed, resource_allowed) =
                        evaluate(&perms, &critical_codes, &critical_checks);
                    if !allowed.is_empty() {
                        response
                            .permissions
                            .entry(subject_id)
                            .or_default()
                            .extend(allowed);
                    }
                    if !resource_allowed.is_empty() {
                        response
                            .resource_operations
                            .entry(subject_id)
                            .or_default()
                            .extend(resource_allowed);
                    }
                }
                Err(e) => {
                    // A stale cached answer must not stand in for a failed critical check
                    if let Some(answers) = response.permissions.get_mut(&subject_id) {
                        for code in &critical_codes {
                            answers.remove(code);
                        }
                    }
                    if let Some(answers) = response.resource_operations.get_mut(&subject_id) {
                        for check in &critical_checks {
                            answers.remove(check);
                        }
                    }
                    response
                        .failures
                        .entry(subject_id)
                        .or_insert_with(|| e.to_string());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Resolution scheduling
    // ------------------------------------------------------------------

    async fn resolve_subjects(
        &self,
        subjects: &[SubjectId],
        consistency: Consistency,
        strategy: CheckStrategy,
        total_checks: usize,
        config: &BatchCheckConfig,
    ) -> HashMap<SubjectId, Stamped> {
        match strategy {
            CheckStrategy::BatchOptimized => {
                let generation = self.cache.generation();
                self.resolver
                    .resolve_many(subjects, consistency)
                    .await
                    .into_iter()
                    .map(|(id, result)| (id, (generation, result)))
                    .collect()
            }
            CheckStrategy::Parallel if total_checks > config.parallel_threshold => {
                stream::iter(subjects.iter().copied())
                    .map(|id| async move { (id, self.resolve_one(id, consistency).await) })
                    .buffer_unordered(config.max_workers.max(1))
                    .collect()
                    .await
            }
            CheckStrategy::Parallel | CheckStrategy::Sequential => {
                let mut results = HashMap::with_capacity(subjects.len());
                for id in subjects {
                    results.insert(*id, self.resolve_one(*id, consistency).await);
                }
                results
            }
        }
    }

    async fn resolve_one(&self, subject_id: SubjectId, consistency: Consistency) -> Stamped {
        match consistency {
            Consistency::MinimizeLatency => self.resolve_shared(subject_id).await,
            Consistency::HigherConsistency => self.resolve_fresh(subject_id, consistency).await,
        }
    }

    /// Resolves one subject, sharing the work with concurrent callers.
    async fn resolve_shared(&self, subject_id: SubjectId) -> Stamped {
        match self.singleflight.acquire(subject_id) {
            SingleflightSlot::Follower(mut receiver) => match receiver.recv().await {
                Ok((generation, Ok(perms))) if !self.cache.is_current(generation, &perms) => {
                    debug!(subject_id, "shared resolution overtaken by invalidation");
                    self.resolve_fresh(subject_id, Consistency::MinimizeLatency)
                        .await
                }
                Ok(stamped) => stamped,
                // Leader went away without a result; take over
                Err(_) => Box::pin(self.resolve_shared(subject_id)).await,
            },
            SingleflightSlot::Leader(sender) => {
                let guard = SingleflightGuard::new(&self.singleflight, subject_id);
                let stamped = self
                    .resolve_fresh(subject_id, Consistency::MinimizeLatency)
                    .await;
                let _ = sender.send(stamped.clone());
                guard.complete();
                stamped
            }
        }
    }

    async fn resolve_fresh(&self, subject_id: SubjectId, consistency: Consistency) -> Stamped {
        let generation = self.cache.generation();
        let result = self
            .resolver
            .resolve_subject_permissions(subject_id, consistency)
            .await;
        (generation, result)
    }

    /// Writes resolved sets to the cache without blocking the caller.
    ///
    /// The cache drops any set whose generation predates an invalidation.
    fn write_back(&self, resolved: Vec<(Generation, SubjectPermissions)>) {
        if resolved.is_empty() || !self.cache.is_enabled() {
            return;
        }
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            for (generation, perms) in &resolved {
                cache.put(perms, *generation).await;
            }
        });
    }

    /// Asks the preloader to warm uncached subjects and waits a bounded time.
    async fn preload_missing(
        &self,
        subjects: &[SubjectId],
        codes: &[String],
        config: &BatchCheckConfig,
    ) {
        let Some(preloader) = &self.preloader else {
            return;
        };

        let mut missing = Vec::new();
        for id in subjects {
            if !self.cache.contains(*id).await {
                missing.push(*id);
            }
        }
        if missing.is_empty() {
            return;
        }

        let request_id = match preloader.request_preload(
            missing,
            codes.to_vec(),
            PRELOAD_PRIORITY,
            "batch_check",
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "could not queue preload for batch check");
                return;
            }
        };

        let deadline = Instant::now() + config.preload_wait;
        loop {
            // A status already trimmed from retention has finished
            if preloader
                .status(request_id)
                .map_or(true, |status| status.state.is_terminal())
            {
                break;
            }
            if Instant::now() >= deadline {
                debug!(%request_id, "preload wait timed out, proceeding");
                break;
            }
            tokio::time::sleep(config.preload_poll_interval).await;
        }
    }
}

fn validate_request(request: &BatchCheckRequest, config: &BatchCheckConfig) -> BatchCheckResult<()> {
    if request.subject_ids.is_empty() {
        return Err(BatchCheckError::EmptySubjects);
    }
    if request.permission_codes.is_empty() && request.resource_checks.is_empty() {
        return Err(BatchCheckError::NothingToCheck);
    }
    if request.subject_ids.len() > config.max_subjects {
        return Err(BatchCheckError::TooManySubjects {
            count: request.subject_ids.len(),
            max: config.max_subjects,
        });
    }
    if request.permission_codes.len() > config.max_permissions {
        return Err(BatchCheckError::TooManyPermissions {
            count: request.permission_codes.len(),
            max: config.max_permissions,
        });
    }
    Ok(())
}

/// Removes duplicates, keeping first-seen order.
fn dedupe<T: Clone + Eq + Hash>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(*item))
        .cloned()
        .collect()
}

fn evaluate(
    perms: &SubjectPermissions,
    codes: &[String],
    checks: &[ResourceCheck],
) -> (HashMap<String, bool>, HashMap<ResourceCheck, bool>) {
    let now = Utc::now();
    let allowed = codes
        .iter()
        .map(|code| (code.clone(), perms.has_permission(code)))
        .collect();
    let resource_allowed = checks
        .iter()
        .map(|check| {
            (
                check.clone(),
                perms.can(
                    &check.resource_type,
                    &check.resource_id,
                    &check.operation,
                    now,
                ),
            )
        })
        .collect();
    (allowed, resource_allowed)
}

fn apply_resolutions(
    response: &mut BatchCheckResponse,
    resolved: HashMap<SubjectId, Resolution>,
    codes: &[String],
    checks: &[ResourceCheck],
) {
    for (subject_id, result) in resolved {
        match result {
            Ok(perms) => {
                let (allowed, resource_allowed) = evaluate(&perms, codes, checks);
                if !codes.is_empty() {
                    response.permissions.insert(subject_id, allowed);
                }
                if !checks.is_empty() {
                    response
                        .resource_operations
                        .insert(subject_id, resource_allowed);
                }
            }
            Err(e) => {
                response.failures.insert(subject_id, e.to_string());
            }
        }
    }
}

fn unstamp(resolved: HashMap<SubjectId, Stamped>) -> HashMap<SubjectId, Resolution> {
    resolved
        .into_iter()
        .map(|(id, (_, result))| (id, result))
        .collect()
}

fn mode_label(mode: CheckMode) -> &'static str {
    match mode {
        CheckMode::Fast => "fast",
        CheckMode::Accurate => "accurate",
        CheckMode::Balanced => "balanced",
    }
}
