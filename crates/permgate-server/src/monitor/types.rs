//! Monitor data types.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use permgate_domain::SubjectId;
use serde::Serialize;

/// Kind of operation a metric describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    PermissionCheck,
    ResourceCheck,
    BatchCheck,
    Preload,
    Invalidation,
}

impl QueryType {
    pub const ALL: [QueryType; 5] = [
        QueryType::PermissionCheck,
        QueryType::ResourceCheck,
        QueryType::BatchCheck,
        QueryType::Preload,
        QueryType::Invalidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::PermissionCheck => "permission_check",
            QueryType::ResourceCheck => "resource_check",
            QueryType::BatchCheck => "batch_check",
            QueryType::Preload => "preload",
            QueryType::Invalidation => "invalidation",
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetric {
    pub query_type: QueryType,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    pub timestamp: DateTime<Utc>,
    pub subject_id: Option<SubjectId>,
    pub permission_code: Option<String>,
    pub resource_type: Option<String>,
    pub cache_hit: bool,
    pub error: Option<String>,
}

impl QueryMetric {
    /// A successful, uncached metric stamped now.
    pub fn new(query_type: QueryType, execution_time: Duration) -> Self {
        Self {
            query_type,
            execution_time,
            timestamp: Utc::now(),
            subject_id: None,
            permission_code: None,
            resource_type: None,
            cache_hit: false,
            error: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_subject(mut self, subject_id: SubjectId) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn with_permission(mut self, code: impl Into<String>) -> Self {
        self.permission_code = Some(code.into());
        self
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Statistics over the metrics of one window. Times are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub query_type: Option<QueryType>,
    pub window_minutes: u64,
    pub count: usize,
    pub avg_execution_time: f64,
    pub min_execution_time: f64,
    pub max_execution_time: f64,
    pub p95_execution_time: f64,
    pub p99_execution_time: f64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub queries_per_second: f64,
    pub slow_query_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowAverage,
    HighErrorRate,
    LowCacheHitRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold breach. Alerts are informational and never block requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    /// `None` for the global evaluation.
    pub query_type: Option<QueryType>,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

/// Aggregates of one trend bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub bucket_start: DateTime<Utc>,
    pub count: usize,
    pub avg_execution_time: f64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
}

/// Monitor thresholds and capacity. All hot-reloadable.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub history_capacity: usize,
    pub slow_query_threshold: Duration,
    pub error_rate_threshold: f64,
    pub cache_hit_rate_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
            slow_query_threshold: Duration::from_secs(1),
            error_rate_threshold: 0.05,
            cache_hit_rate_threshold: 0.70,
        }
    }
}

/// Snapshot of everything the monitor knows, for offline analysis.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorExport {
    pub exported_at: DateTime<Utc>,
    pub history_len: usize,
    pub overall: PerformanceStats,
    pub by_type: BTreeMap<QueryType, PerformanceStats>,
    pub alerts: Vec<Alert>,
    pub slow_queries: Vec<QueryMetric>,
    pub trends: Vec<TrendPoint>,
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
