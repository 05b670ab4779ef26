//! Configuration management for the permgate server.
//!
//! This module provides configuration loading with multiple sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults. This follows the 12-factor app pattern.
//!
//! # Hot Reload
//!
//! The `cache`, `batch`, `preload` and `monitor` sections can be changed at
//! runtime through `AuthzService::apply_settings`. The remaining sections
//! are read once at startup.
//!
//! # Example
//!
//! ```ignore
//! use permgate_server::config::ServerConfig;
//!
//! // Load from file with env overrides
//! let config = ServerConfig::load("permgate.yaml")?;
//!
//! // Or load from environment only
//! let config = ServerConfig::from_env()?;
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use permgate_domain::cache::{CacheTtls, PermissionCacheConfig};
use permgate_domain::resolver::ResolverConfig;
use serde::{Deserialize, Serialize};

use crate::handlers::batch::{BatchCheckConfig, CriticalPermissions};
use crate::monitor::MonitorConfig;
use crate::preload::PreloadConfig;

/// Server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsSettings,

    /// Query resolver settings
    #[serde(default)]
    pub resolver: ResolverSettings,

    /// Permission cache settings
    #[serde(default)]
    pub cache: CacheSettings,

    /// Batch checker settings
    #[serde(default)]
    pub batch: BatchSettings,

    /// Preloader settings
    #[serde(default)]
    pub preload: PreloadSettings,

    /// Performance monitor settings
    #[serde(default)]
    pub monitor: MonitorSettings,
}

/// Server network settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerSettings {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Permission store settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// Storage backend type. Only "memory" is built in.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Optional JSON seed file loaded into the memory backend at startup.
    pub seed_path: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            seed_path: None,
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricsSettings {
    /// Enable metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Query resolver settings. Read at startup only.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResolverSettings {
    /// Maximum concurrent subject resolutions against the store.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Timeout of one subject resolution, in seconds.
    #[serde(default = "default_resolve_timeout")]
    pub timeout_secs: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_resolve_timeout(),
        }
    }
}

fn default_max_concurrency() -> usize {
    16
}

fn default_resolve_timeout() -> u64 {
    30
}

impl ResolverSettings {
    /// Resolver configuration without a role cache attached.
    pub fn to_resolver_config(&self) -> ResolverConfig {
        ResolverConfig::default()
            .with_max_concurrency(self.max_concurrency)
            .with_timeout(Duration::from_secs(self.timeout_secs))
    }
}

/// Permission cache settings.
///
/// Environment variables: `PERMGATE_CACHE__SUBJECT_TTL_SECS=300`,
/// `PERMGATE_CACHE__ENABLED=false`, ...
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_subject_ttl")]
    pub subject_ttl_secs: u64,

    #[serde(default = "default_role_ttl")]
    pub role_ttl_secs: u64,

    #[serde(default = "default_resource_ttl")]
    pub resource_ttl_secs: u64,

    /// Entry capacity of the in-process store. Read at startup only.
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,

    /// Consecutive store failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before a trial call.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            subject_ttl_secs: default_subject_ttl(),
            role_ttl_secs: default_role_ttl(),
            resource_ttl_secs: default_resource_ttl(),
            max_capacity: default_cache_capacity(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_subject_ttl() -> u64 {
    900
}

fn default_role_ttl() -> u64 {
    1800
}

fn default_resource_ttl() -> u64 {
    600
}

fn default_cache_capacity() -> u64 {
    100_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    30
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> PermissionCacheConfig {
        PermissionCacheConfig::default()
            .with_enabled(self.enabled)
            .with_ttls(CacheTtls {
                subject: Duration::from_secs(self.subject_ttl_secs),
                role: Duration::from_secs(self.role_ttl_secs),
                resource: Duration::from_secs(self.resource_ttl_secs),
            })
            .with_circuit_breaker(
                self.failure_threshold,
                Duration::from_secs(self.cooldown_secs),
            )
            .with_max_capacity(self.max_capacity)
    }
}

/// Batch checker settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatchSettings {
    #[serde(default = "default_max_subjects")]
    pub max_subjects: usize,

    #[serde(default = "default_max_permissions")]
    pub max_permissions: usize,

    /// Total checks above which the PARALLEL strategy fans out.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,

    /// Concurrent resolutions under the PARALLEL strategy.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Permission-code prefixes that are always checked authoritatively.
    #[serde(default = "default_critical_prefixes")]
    pub critical_prefixes: Vec<String>,

    /// Exact permission codes that are always checked authoritatively.
    #[serde(default = "default_critical_codes")]
    pub critical_codes: Vec<String>,

    /// Longest wait for a preload requested by a batch check, in milliseconds.
    #[serde(default = "default_preload_wait")]
    pub preload_wait_ms: u64,

    #[serde(default = "default_preload_poll")]
    pub preload_poll_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_subjects: default_max_subjects(),
            max_permissions: default_max_permissions(),
            parallel_threshold: default_parallel_threshold(),
            max_workers: default_max_workers(),
            critical_prefixes: default_critical_prefixes(),
            critical_codes: default_critical_codes(),
            preload_wait_ms: default_preload_wait(),
            preload_poll_interval_ms: default_preload_poll(),
        }
    }
}

fn default_max_subjects() -> usize {
    100
}

fn default_max_permissions() -> usize {
    50
}

fn default_parallel_threshold() -> usize {
    20
}

fn default_max_workers() -> usize {
    16
}

fn default_critical_prefixes() -> Vec<String> {
    ["admin:", "system:", "security:"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_critical_codes() -> Vec<String> {
    ["user:delete", "data:delete"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_preload_wait() -> u64 {
    5_000
}

fn default_preload_poll() -> u64 {
    100
}

impl BatchSettings {
    pub fn to_batch_config(&self) -> BatchCheckConfig {
        BatchCheckConfig {
            max_subjects: self.max_subjects,
            max_permissions: self.max_permissions,
            parallel_threshold: self.parallel_threshold,
            max_workers: self.max_workers,
            critical: CriticalPermissions::new(
                self.critical_prefixes.clone(),
                self.critical_codes.iter().cloned().collect::<HashSet<_>>(),
            ),
            preload_wait: Duration::from_millis(self.preload_wait_ms),
            preload_poll_interval: Duration::from_millis(self.preload_poll_interval_ms),
        }
    }
}

/// Preloader settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PreloadSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Sliding window of the access history, in seconds.
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Accesses within the window before a subject is scored.
    #[serde(default = "default_min_access_count")]
    pub min_access_count: usize,

    /// Score a subject must exceed to become a candidate.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,

    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Subjects per auto-preload request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Period of the auto-preload loop in seconds; 0 disables it.
    #[serde(default)]
    pub auto_interval_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Timestamps kept per subject or permission code.
    #[serde(default = "default_max_records")]
    pub max_records_per_key: usize,
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            window_secs: default_window(),
            min_access_count: default_min_access_count(),
            score_threshold: default_score_threshold(),
            max_candidates: default_max_candidates(),
            batch_size: default_batch_size(),
            auto_interval_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_records_per_key: default_max_records(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_window() -> u64 {
    3600
}

fn default_min_access_count() -> usize {
    3
}

fn default_score_threshold() -> f64 {
    0.3
}

fn default_max_candidates() -> usize {
    50
}

fn default_batch_size() -> usize {
    50
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_max_records() -> usize {
    1000
}

impl PreloadSettings {
    pub fn to_preload_config(&self) -> PreloadConfig {
        PreloadConfig {
            queue_capacity: self.queue_capacity,
            window: Duration::from_secs(self.window_secs),
            min_access_count: self.min_access_count,
            score_threshold: self.score_threshold,
            max_candidates: self.max_candidates,
            batch_size: self.batch_size,
            auto_interval: (self.auto_interval_secs > 0)
                .then(|| Duration::from_secs(self.auto_interval_secs)),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            max_records_per_key: self.max_records_per_key,
            ..PreloadConfig::default()
        }
    }
}

/// Performance monitor settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MonitorSettings {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default = "default_slow_query_threshold")]
    pub slow_query_threshold_secs: f64,

    /// Error rate above which an alert is raised (0.0-1.0).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// Cache hit rate below which an alert is raised (0.0-1.0).
    #[serde(default = "default_hit_rate_threshold")]
    pub cache_hit_rate_threshold: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            slow_query_threshold_secs: default_slow_query_threshold(),
            error_rate_threshold: default_error_rate_threshold(),
            cache_hit_rate_threshold: default_hit_rate_threshold(),
        }
    }
}

fn default_history_capacity() -> usize {
    10_000
}

fn default_slow_query_threshold() -> f64 {
    1.0
}

fn default_error_rate_threshold() -> f64 {
    0.05
}

fn default_hit_rate_threshold() -> f64 {
    0.70
}

impl MonitorSettings {
    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            history_capacity: self.history_capacity,
            slow_query_threshold: Duration::from_secs_f64(self.slow_query_threshold_secs),
            error_rate_threshold: self.error_rate_threshold,
            cache_hit_rate_threshold: self.cache_hit_rate_threshold,
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

fn invalid(message: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        message: message.into(),
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `PERMGATE_` and use `__` as separator.
    /// For example:
    /// - `PERMGATE_SERVER__PORT=9090` overrides `server.port`
    /// - `PERMGATE_CACHE__SUBJECT_TTL_SECS=60` overrides `cache.subject_ttl_secs`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            // PERMGATE_SERVER__PORT -> server.port
            .add_source(
                Environment::with_prefix("PERMGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Load configuration from environment variables only.
    ///
    /// Uses default values and allows overrides via PERMGATE_ prefixed env vars.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(
                Environment::with_prefix("PERMGATE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Validate the configuration.
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.server.port == 0 {
            return Err(invalid("server.port must be greater than 0"));
        }

        let valid_backends = ["memory"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(invalid(format!(
                "storage.backend must be one of: {:?}, got: {}",
                valid_backends, self.storage.backend
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of: {:?}, got: {}",
                valid_levels, self.logging.level
            )));
        }

        if self.resolver.max_concurrency == 0 {
            return Err(invalid("resolver.max_concurrency must be greater than 0"));
        }
        if self.resolver.timeout_secs == 0 {
            return Err(invalid("resolver.timeout_secs must be greater than 0"));
        }

        if self.cache.max_capacity == 0 {
            return Err(invalid("cache.max_capacity must be greater than 0"));
        }
        if self.cache.failure_threshold == 0 {
            return Err(invalid("cache.failure_threshold must be greater than 0"));
        }

        if self.batch.max_subjects == 0 || self.batch.max_permissions == 0 {
            return Err(invalid(
                "batch.max_subjects and batch.max_permissions must be greater than 0",
            ));
        }
        if self.batch.max_workers == 0 {
            return Err(invalid("batch.max_workers must be greater than 0"));
        }
        if self.batch.preload_poll_interval_ms == 0 {
            return Err(invalid("batch.preload_poll_interval_ms must be greater than 0"));
        }
        if self
            .batch
            .critical_prefixes
            .iter()
            .chain(&self.batch.critical_codes)
            .any(|entry| entry.trim().is_empty())
        {
            return Err(invalid(
                "batch.critical_prefixes and batch.critical_codes must not contain empty entries",
            ));
        }

        if self.preload.queue_capacity == 0 {
            return Err(invalid("preload.queue_capacity must be greater than 0"));
        }
        if self.preload.window_secs == 0 {
            return Err(invalid("preload.window_secs must be greater than 0"));
        }
        if self.preload.batch_size == 0 {
            return Err(invalid("preload.batch_size must be greater than 0"));
        }
        if self.preload.max_records_per_key == 0 {
            return Err(invalid("preload.max_records_per_key must be greater than 0"));
        }
        if !self.preload.score_threshold.is_finite() || self.preload.score_threshold < 0.0 {
            return Err(invalid(
                "preload.score_threshold must be a non-negative number",
            ));
        }

        if self.monitor.history_capacity == 0 {
            return Err(invalid("monitor.history_capacity must be greater than 0"));
        }
        if !self.monitor.slow_query_threshold_secs.is_finite()
            || self.monitor.slow_query_threshold_secs <= 0.0
        {
            return Err(invalid(
                "monitor.slow_query_threshold_secs must be greater than 0",
            ));
        }
        for (name, value) in [
            ("monitor.error_rate_threshold", self.monitor.error_rate_threshold),
            (
                "monitor.cache_hit_rate_threshold",
                self.monitor.cache_hit_rate_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!(
                    "{name} must be between 0.0 and 1.0, got: {value}"
                )));
            }
        }

        Ok(())
    }
}
