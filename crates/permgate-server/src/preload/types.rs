//! Data types for the preloader.

use std::time::Duration;

use chrono::{DateTime, Utc};
use permgate_domain::SubjectId;
use serde::Serialize;
use uuid::Uuid;

/// Most urgent priority.
pub const PRIORITY_HIGHEST: u8 = 1;
/// Least urgent priority.
pub const PRIORITY_LOWEST: u8 = 5;
/// Priority of requests generated from access patterns.
pub const PRIORITY_AUTO: u8 = 3;
/// Requester tag of requests generated from access patterns.
pub const AUTO_REQUESTER: &str = "auto_pattern";

/// Preloader configuration. Hot-reloadable except `shutdown_timeout`.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadConfig {
    pub queue_capacity: usize,
    /// Sliding window of the access history.
    pub window: Duration,
    pub min_access_count: usize,
    pub score_threshold: f64,
    pub max_candidates: usize,
    /// Subjects per auto-preload request.
    pub batch_size: usize,
    /// Period of the auto-preload loop; `None` disables it.
    pub auto_interval: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub max_records_per_key: usize,
    /// Finished request statuses kept for lookup.
    pub status_retention: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            window: Duration::from_secs(3600),
            min_access_count: 3,
            score_threshold: 0.3,
            max_candidates: 50,
            batch_size: 50,
            auto_interval: None,
            shutdown_timeout: Duration::from_secs(5),
            max_records_per_key: 1000,
            status_retention: 10_000,
        }
    }
}

/// A queued request to warm the cache.
#[derive(Debug, Clone, Serialize)]
pub struct PreloadRequest {
    pub id: Uuid,
    pub subject_ids: Vec<SubjectId>,
    pub permission_codes: Vec<String>,
    /// 1 (most urgent) to 5.
    pub priority: u8,
    pub requester: String,
    pub submitted_at: DateTime<Utc>,
}

/// Lifecycle of a preload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreloadState {
    Queued,
    Processing,
    Done,
    Failed,
}

impl PreloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PreloadState::Done | PreloadState::Failed)
    }
}

/// Observable status of one request.
#[derive(Debug, Clone, Serialize)]
pub struct PreloadStatus {
    pub id: Uuid,
    pub state: PreloadState,
    pub requester: String,
    pub priority: u8,
    pub subject_count: usize,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Subjects resolved and written to the cache.
    pub preloaded: usize,
    /// Subjects that were already cached.
    pub already_cached: usize,
    pub error: Option<String>,
}

impl PreloadStatus {
    pub(crate) fn queued(request: &PreloadRequest) -> Self {
        Self {
            id: request.id,
            state: PreloadState::Queued,
            requester: request.requester.clone(),
            priority: request.priority,
            subject_count: request.subject_ids.len(),
            submitted_at: request.submitted_at,
            started_at: None,
            finished_at: None,
            preloaded: 0,
            already_cached: 0,
            error: None,
        }
    }
}

/// A subject predicted to be accessed soon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadCandidate {
    pub subject_id: SubjectId,
    pub score: f64,
    pub frequency: f64,
    pub regularity: f64,
    pub recency: f64,
    pub access_count: usize,
}

/// Preloader counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PreloadStats {
    /// Requests accepted into the queue.
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    /// Submissions refused because the queue was full.
    pub rejected_requests: u64,
    /// Queued requests displaced by more urgent ones.
    pub evicted_requests: u64,
    pub subjects_preloaded: u64,
    /// Requested subjects that were already cached.
    pub cache_hits: u64,
    /// Requested subjects that had to be resolved.
    pub cache_misses: u64,
    /// Running average of request processing time.
    pub average_duration_ms: f64,
    pub queue_len: usize,
    pub tracked_subjects: usize,
}

/// Errors returned when submitting preload work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PreloadError {
    #[error("preload request must name at least one subject")]
    EmptyRequest,

    #[error("priority {priority} is outside 1..=5")]
    InvalidPriority { priority: u8 },

    #[error("preload queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("preloader is shutting down")]
    ShuttingDown,
}

/// Result type for preloader operations.
pub type PreloadResult<T> = Result<T, PreloadError>;
