//! Adaptive cache preloader.
//!
//! Explicit requests land in a capacity-bounded priority queue drained by a
//! single background worker. Each processed request feeds an access history
//! that is periodically mined for subjects worth warming ahead of demand.
//!
//! ```text
//!  request_preload ──► PriorityQueue ──► worker ──► resolver ──► cache
//!                                          │
//!  record_access ──────────────────────────┴──► AccessPatternTracker
//!                                                      │
//!  auto_preload ◄── analyze_access_patterns ◄──────────┘
//! ```

mod patterns;
mod queue;
mod types;

pub use patterns::AccessPatternTracker;
pub use types::{
    PreloadCandidate, PreloadConfig, PreloadError, PreloadRequest, PreloadResult, PreloadState,
    PreloadStats, PreloadStatus, AUTO_REQUESTER, PRIORITY_AUTO, PRIORITY_HIGHEST, PRIORITY_LOWEST,
};

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use permgate_domain::resolver::{Consistency, PermissionSource, QueryResolver};
use permgate_domain::{PermissionCache, SubjectId};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::monitor::{PerformanceMonitor, QueryMetric, QueryType};
use queue::{PriorityQueue, PushOutcome};

/// How often the auto-preload loop re-reads its interval while disabled.
const AUTO_IDLE_POLL: Duration = Duration::from_secs(1);

/// Warms the permission cache on request and from observed access patterns.
pub struct Preloader<S>
where
    S: PermissionSource + 'static,
{
    resolver: Arc<QueryResolver<S>>,
    cache: Arc<PermissionCache>,
    config: RwLock<PreloadConfig>,
    queue: Mutex<PriorityQueue>,
    notify: Notify,
    statuses: DashMap<Uuid, PreloadStatus>,
    /// Terminal request ids, oldest first, for status retention.
    finished: Mutex<VecDeque<Uuid>>,
    patterns: AccessPatternTracker,
    stats: Mutex<PreloadStats>,
    monitor: OnceLock<Arc<PerformanceMonitor>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> std::fmt::Debug for Preloader<S>
where
    S: PermissionSource + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preloader")
            .field("config", &*self.config.read())
            .field("queue_len", &self.queue.lock().len())
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S> Preloader<S>
where
    S: PermissionSource + 'static,
{
    pub fn new(
        resolver: Arc<QueryResolver<S>>,
        cache: Arc<PermissionCache>,
        config: PreloadConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            resolver,
            cache,
            queue: Mutex::new(PriorityQueue::new(config.queue_capacity)),
            config: RwLock::new(config),
            notify: Notify::new(),
            statuses: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            patterns: AccessPatternTracker::new(),
            stats: Mutex::new(PreloadStats::default()),
            monitor: OnceLock::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the queue worker and the auto-preload loop.
    pub fn start(self: &Arc<Self>) {
        let worker = tokio::spawn(Arc::clone(self).run_worker(self.shutdown_tx.subscribe()));
        let auto = tokio::spawn(Arc::clone(self).run_auto_preload(self.shutdown_tx.subscribe()));
        let mut tasks = self.tasks.lock();
        tasks.push(worker);
        tasks.push(auto);
        info!("preloader started");
    }

    /// Reports processed requests to the performance monitor. First call wins.
    pub fn attach_monitor(&self, monitor: Arc<PerformanceMonitor>) {
        let _ = self.monitor.set(monitor);
    }

    pub fn config(&self) -> PreloadConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: PreloadConfig) {
        self.queue.lock().set_capacity(config.queue_capacity);
        *self.config.write() = config;
    }

    /// Queues subjects to be warmed.
    ///
    /// Duplicate subject ids are collapsed. When the queue is full the
    /// request displaces the least urgent queued request if it is strictly
    /// more urgent, and is rejected otherwise.
    pub fn request_preload(
        &self,
        subject_ids: Vec<SubjectId>,
        permission_codes: Vec<String>,
        priority: u8,
        requester: &str,
    ) -> PreloadResult<Uuid> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PreloadError::ShuttingDown);
        }
        if subject_ids.is_empty() {
            return Err(PreloadError::EmptyRequest);
        }
        if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&priority) {
            return Err(PreloadError::InvalidPriority { priority });
        }

        let mut seen = HashSet::with_capacity(subject_ids.len());
        let subject_ids: Vec<SubjectId> =
            subject_ids.into_iter().filter(|id| seen.insert(*id)).collect();

        let request = PreloadRequest {
            id: Uuid::new_v4(),
            subject_ids,
            permission_codes,
            priority,
            requester: requester.to_string(),
            submitted_at: Utc::now(),
        };
        let id = request.id;
        self.statuses.insert(id, PreloadStatus::queued(&request));

        let (outcome, depth, capacity) = {
            let mut queue = self.queue.lock();
            let outcome = queue.push(request);
            (outcome, queue.len(), self.config.read().queue_capacity)
        };
        metrics::gauge!("permgate_preload_queue_depth").set(depth as f64);

        match outcome {
            PushOutcome::Rejected(request) => {
                self.statuses.remove(&request.id);
                self.stats.lock().rejected_requests += 1;
                metrics::counter!("permgate_preload_requests_total", "outcome" => "rejected")
                    .increment(1);
                warn!(
                    requester = %request.requester,
                    priority,
                    capacity,
                    "preload queue full, request rejected"
                );
                return Err(PreloadError::QueueFull { capacity });
            }
            PushOutcome::Evicted(evicted) => {
                self.stats.lock().evicted_requests += 1;
                warn!(
                    evicted = %evicted.id,
                    evicted_priority = evicted.priority,
                    priority,
                    "preload queue full, displaced a less urgent request"
                );
                self.finish(evicted.id, |status| {
                    status.state = PreloadState::Failed;
                    status.error = Some("evicted by a more urgent request".to_string());
                });
            }
            PushOutcome::Accepted => {}
        }

        self.stats.lock().total_requests += 1;
        metrics::counter!("permgate_preload_requests_total", "outcome" => "accepted").increment(1);
        debug!(%id, priority, requester, "preload request queued");
        self.notify.notify_one();
        Ok(id)
    }

    /// Current status of a request, if it is still retained.
    pub fn status(&self, id: Uuid) -> Option<PreloadStatus> {
        self.statuses.get(&id).map(|status| status.clone())
    }

    /// Feeds live traffic into the access history.
    pub fn record_access(&self, subject_ids: &[SubjectId], permission_codes: &[String]) {
        let config = self.config.read().clone();
        self.patterns
            .record_at(subject_ids, permission_codes, Utc::now(), &config);
    }

    /// Ranks subjects likely to be accessed soon.
    pub fn analyze_access_patterns(&self) -> Vec<PreloadCandidate> {
        let config = self.config.read().clone();
        self.patterns.analyze_at(Utc::now(), &config)
    }

    /// Queues the current candidates in batches at medium priority.
    ///
    /// Stops at the first rejected batch; returns the ids of queued requests.
    pub fn auto_preload(&self) -> PreloadResult<Vec<Uuid>> {
        let candidates = self.analyze_access_patterns();
        if candidates.is_empty() {
            debug!("no preload candidates");
            return Ok(Vec::new());
        }

        let batch_size = self.config.read().batch_size.max(1);
        let subjects: Vec<SubjectId> = candidates.iter().map(|c| c.subject_id).collect();
        let mut queued = Vec::new();
        for chunk in subjects.chunks(batch_size) {
            match self.request_preload(chunk.to_vec(), Vec::new(), PRIORITY_AUTO, AUTO_REQUESTER) {
                Ok(id) => queued.push(id),
                Err(e) if queued.is_empty() => return Err(e),
                Err(e) => {
                    warn!(error = %e, queued = queued.len(), "auto preload stopped early");
                    break;
                }
            }
        }

        info!(
            candidates = candidates.len(),
            requests = queued.len(),
            "auto preload queued"
        );
        Ok(queued)
    }

    pub fn stats(&self) -> PreloadStats {
        let mut stats = self.stats.lock().clone();
        stats.queue_len = self.queue.lock().len();
        stats.tracked_subjects = self.patterns.tracked_subjects();
        stats
    }

    /// Stops accepting work and joins the background tasks.
    ///
    /// Tasks still running after `shutdown_timeout` are aborted; a request
    /// abandoned mid-flight is simply never cached.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        self.notify.notify_one();

        let timeout = self.config.read().shutdown_timeout;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(?timeout, "preloader task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("preloader stopped");
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = {
                let mut queue = self.queue.lock();
                let next = queue.pop();
                metrics::gauge!("permgate_preload_queue_depth").set(queue.len() as f64);
                next
            };
            match next {
                Some(request) => self.process(request).await,
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        debug!("preload worker exited");
    }

    async fn run_auto_preload(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.config.read().auto_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval.unwrap_or(AUTO_IDLE_POLL)) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if interval.is_some() {
                if let Err(e) = self.auto_preload() {
                    warn!(error = %e, "auto preload failed");
                }
            }
        }
    }

    async fn process(&self, request: PreloadRequest) {
        let start = Instant::now();
        if let Some(mut status) = self.statuses.get_mut(&request.id) {
            status.state = PreloadState::Processing;
            status.started_at = Some(Utc::now());
        }

        let mut missing = Vec::new();
        for id in &request.subject_ids {
            if !self.cache.contains(*id).await {
                missing.push(*id);
            }
        }
        let already_cached = request.subject_ids.len() - missing.len();

        let mut preloaded = 0;
        let mut errors = Vec::new();
        if !missing.is_empty() {
            let generation = self.cache.generation();
            let resolved = self
                .resolver
                .resolve_many(&missing, Consistency::MinimizeLatency)
                .await;
            for (subject_id, result) in resolved {
                match result {
                    Ok(perms) => {
                        self.cache.put(&perms, generation).await;
                        preloaded += 1;
                    }
                    Err(e) => errors.push(format!("subject {subject_id}: {e}")),
                }
            }
        }

        let elapsed = start.elapsed();
        let failed = !errors.is_empty();
        {
            let mut stats = self.stats.lock();
            if failed {
                stats.failed_requests += 1;
            } else {
                stats.completed_requests += 1;
            }
            stats.subjects_preloaded += preloaded as u64;
            stats.cache_hits += already_cached as u64;
            stats.cache_misses += missing.len() as u64;
            let processed = (stats.completed_requests + stats.failed_requests) as f64;
            let ms = elapsed.as_secs_f64() * 1000.0;
            stats.average_duration_ms += (ms - stats.average_duration_ms) / processed;
        }

        self.record_access(&request.subject_ids, &request.permission_codes);

        let outcome = if failed { "failed" } else { "done" };
        metrics::counter!("permgate_preload_requests_total", "outcome" => outcome).increment(1);
        metrics::histogram!("permgate_preload_duration_seconds").record(elapsed.as_secs_f64());
        if let Some(monitor) = self.monitor.get() {
            let mut metric = QueryMetric::new(QueryType::Preload, elapsed)
                .with_cache_hit(missing.is_empty());
            if let [subject_id] = request.subject_ids.as_slice() {
                metric = metric.with_subject(*subject_id);
            }
            if failed {
                metric = metric.with_error(errors.join("; "));
            }
            monitor.record(metric);
        }
        if failed {
            warn!(
                id = %request.id,
                failures = errors.len(),
                preloaded,
                "preload request finished with errors"
            );
        } else {
            info!(
                id = %request.id,
                requester = %request.requester,
                preloaded,
                already_cached,
                elapsed_ms = elapsed.as_millis() as u64,
                "preload request done"
            );
        }

        self.finish(request.id, |status| {
            status.state = if failed {
                PreloadState::Failed
            } else {
                PreloadState::Done
            };
            status.preloaded = preloaded;
            status.already_cached = already_cached;
            if failed {
                status.error = Some(errors.join("; "));
            }
        });
    }

    /// Moves a request to a terminal state and trims retained statuses.
    fn finish(&self, id: Uuid, update: impl FnOnce(&mut PreloadStatus)) {
        if let Some(mut status) = self.statuses.get_mut(&id) {
            update(&mut status);
            status.finished_at = Some(Utc::now());
        }

        let retention = self.config.read().status_retention;
        let mut finished = self.finished.lock();
        finished.push_back(id);
        while finished.len() > retention {
            if let Some(old) = finished.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}
