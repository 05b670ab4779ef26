//! Data types for batch check operations.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use permgate_domain::{Operation, SubjectId};
use serde::{Deserialize, Serialize};

/// Default cap on subjects per batch request.
pub const DEFAULT_MAX_SUBJECTS: usize = 100;

/// Default cap on permission codes per batch request.
pub const DEFAULT_MAX_PERMISSIONS: usize = 50;

/// How much staleness a check tolerates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// Answer from the cache; resolve only what misses.
    Fast,
    /// Skip the cache and resolve every subject authoritatively.
    Accurate,
    /// Fast, then re-check critical permissions authoritatively.
    #[default]
    Balanced,
}

/// How resolution work is scheduled. Orthogonal to [`CheckMode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStrategy {
    /// One batched resolver call for every subject that needs resolving.
    #[default]
    BatchOptimized,
    /// Fan out per-subject resolutions once the batch is large enough.
    Parallel,
    /// One subject at a time, in request order.
    Sequential,
}

/// A check against one resource instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceCheck {
    pub resource_type: String,
    pub resource_id: String,
    pub operation: Operation,
}

impl ResourceCheck {
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            operation,
        }
    }
}

/// Request for batch permission checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchCheckRequest {
    pub subject_ids: Vec<SubjectId>,
    #[serde(default)]
    pub permission_codes: Vec<String>,
    #[serde(default)]
    pub resource_checks: Vec<ResourceCheck>,
    #[serde(default)]
    pub mode: CheckMode,
    #[serde(default)]
    pub strategy: CheckStrategy,
    /// Warm subjects missing from the cache before checking.
    #[serde(default)]
    pub preload_missing: bool,
}

impl BatchCheckRequest {
    /// Creates a balanced, batch-optimized request.
    pub fn new(subject_ids: Vec<SubjectId>, permission_codes: Vec<String>) -> Self {
        Self {
            subject_ids,
            permission_codes,
            ..Default::default()
        }
    }

    pub fn with_resource_checks(mut self, checks: Vec<ResourceCheck>) -> Self {
        self.resource_checks = checks;
        self
    }

    pub fn with_mode(mut self, mode: CheckMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_strategy(mut self, strategy: CheckStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_preload_missing(mut self, preload_missing: bool) -> Self {
        self.preload_missing = preload_missing;
        self
    }

    /// Number of (subject, check) pairs this request asks for.
    pub fn total_checks(&self) -> usize {
        self.subject_ids.len() * (self.permission_codes.len() + self.resource_checks.len())
    }
}

/// Response from a batch check operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchCheckResponse {
    /// subject -> permission code -> allowed.
    pub permissions: HashMap<SubjectId, HashMap<String, bool>>,
    /// subject -> resource check -> allowed.
    ///
    /// Serialized per subject as a list of checks with an `allowed` flag.
    #[serde(serialize_with = "resource_answers::serialize")]
    pub resource_operations: HashMap<SubjectId, HashMap<ResourceCheck, bool>>,
    /// Subjects whose answers could not be computed, with the reason.
    ///
    /// A failed subject has no entries in the maps above for the checks
    /// that failed; absence means "unknown", never "deny".
    pub failures: HashMap<SubjectId, String>,
    #[serde(with = "duration_secs")]
    pub execution_time: Duration,
    /// Cache hits over cache lookups; 0.0 when the cache was not consulted.
    pub cache_hit_rate: f64,
}

impl BatchCheckResponse {
    pub fn allowed(&self, subject_id: SubjectId, code: &str) -> Option<bool> {
        self.permissions.get(&subject_id)?.get(code).copied()
    }

    pub fn resource_allowed(&self, subject_id: SubjectId, check: &ResourceCheck) -> Option<bool> {
        self.resource_operations
            .get(&subject_id)?
            .get(check)
            .copied()
    }
}

mod resource_answers {
    use std::collections::HashMap;

    use permgate_domain::SubjectId;
    use serde::ser::{SerializeMap, Serializer};
    use serde::Serialize;

    use super::ResourceCheck;

    #[derive(Serialize)]
    struct Answer<'a> {
        #[serde(flatten)]
        check: &'a ResourceCheck,
        allowed: bool,
    }

    pub fn serialize<S: Serializer>(
        value: &HashMap<SubjectId, HashMap<ResourceCheck, bool>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (subject_id, answers) in value {
            let answers: Vec<Answer<'_>> = answers
                .iter()
                .map(|(check, allowed)| Answer {
                    check,
                    allowed: *allowed,
                })
                .collect();
            map.serialize_entry(subject_id, &answers)?;
        }
        map.end()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

/// Permission codes that must never be answered from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalPermissions {
    prefixes: Vec<String>,
    codes: HashSet<String>,
}

impl Default for CriticalPermissions {
    fn default() -> Self {
        Self::new(
            vec![
                "admin:".to_string(),
                "system:".to_string(),
                "security:".to_string(),
            ],
            ["user:delete", "data:delete"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

impl CriticalPermissions {
    pub fn new(prefixes: Vec<String>, codes: HashSet<String>) -> Self {
        Self { prefixes, codes }
    }

    pub fn is_critical(&self, code: &str) -> bool {
        self.codes.contains(code) || self.prefixes.iter().any(|p| code.starts_with(p.as_str()))
    }

    /// A resource check is critical when `type:operation` is a critical code.
    pub fn is_critical_resource(&self, resource_type: &str, operation: &Operation) -> bool {
        self.is_critical(&format!("{resource_type}:{}", operation.as_str()))
    }
}

/// Batch checker configuration. Hot-reloadable.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCheckConfig {
    pub max_subjects: usize,
    pub max_permissions: usize,
    /// Total checks above which [`CheckStrategy::Parallel`] fans out.
    pub parallel_threshold: usize,
    /// Concurrent resolutions when fanning out.
    pub max_workers: usize,
    pub critical: CriticalPermissions,
    /// Longest wait for a preload requested with `preload_missing`.
    pub preload_wait: Duration,
    pub preload_poll_interval: Duration,
}

impl Default for BatchCheckConfig {
    fn default() -> Self {
        Self {
            max_subjects: DEFAULT_MAX_SUBJECTS,
            max_permissions: DEFAULT_MAX_PERMISSIONS,
            parallel_threshold: 20,
            max_workers: 16,
            critical: CriticalPermissions::default(),
            preload_wait: Duration::from_secs(5),
            preload_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Errors that can occur during batch check operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchCheckError {
    /// The request names no subjects.
    #[error("subject list cannot be empty")]
    EmptySubjects,

    /// The request has neither permission codes nor resource checks.
    #[error("request must contain permission codes or resource checks")]
    NothingToCheck,

    #[error("subject count {count} exceeds maximum allowed {max}")]
    TooManySubjects { count: usize, max: usize },

    #[error("permission code count {count} exceeds maximum allowed {max}")]
    TooManyPermissions { count: usize, max: usize },
}

/// Result type for batch check operations.
pub type BatchCheckResult<T> = Result<T, BatchCheckError>;

/// Outcome of a point check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointCheck {
    pub allowed: bool,
    /// Whether the answer came from the cache.
    pub cache_hit: bool,
}
