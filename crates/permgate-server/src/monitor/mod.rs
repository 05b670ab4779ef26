//! Performance monitor.
//!
//! Keeps a bounded FIFO of [`QueryMetric`]s recorded by the service facade
//! and derives windowed statistics, slow query listings, trend series and
//! threshold alerts from it. Recording is a short critical section; all
//! aggregation runs on a snapshot taken under the lock.

mod alerts;
mod stats;
mod types;

pub use stats::{nearest_rank, MAX_TREND_BUCKETS, MAX_WINDOW_MINUTES};
pub use types::{
    Alert, AlertKind, AlertSeverity, MonitorConfig, MonitorExport, PerformanceStats, QueryMetric,
    QueryType, TrendPoint,
};

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::info;

/// Window used for the statistics embedded in alerts and exports.
const DEFAULT_WINDOW_MINUTES: u64 = 60;
/// Slow queries included in an export.
const EXPORT_SLOW_QUERY_LIMIT: usize = 100;

/// Bounded in-memory telemetry sink.
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: RwLock<MonitorConfig>,
    history: Mutex<VecDeque<QueryMetric>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.config.read().clone()
    }

    /// Replaces thresholds and capacity; a smaller capacity drops the oldest records.
    pub fn update_config(&self, config: MonitorConfig) {
        let capacity = config.history_capacity.max(1);
        *self.config.write() = config;
        let mut history = self.history.lock();
        while history.len() > capacity {
            history.pop_front();
        }
    }

    /// Appends a metric, evicting the oldest once full.
    pub fn record(&self, metric: QueryMetric) {
        let capacity = self.config.read().history_capacity.max(1);
        let mut history = self.history.lock();
        if history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(metric);
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    /// Statistics over the last `window_minutes`, optionally for one query type.
    pub fn stats(&self, query_type: Option<QueryType>, window_minutes: u64) -> PerformanceStats {
        self.stats_at(query_type, window_minutes, Utc::now())
    }

    pub fn stats_at(
        &self,
        query_type: Option<QueryType>,
        window_minutes: u64,
        now: DateTime<Utc>,
    ) -> PerformanceStats {
        let window_minutes = window_minutes.min(MAX_WINDOW_MINUTES);
        let slow = self.config.read().slow_query_threshold;
        let snapshot = self.window(now, window_minutes);
        let selected: Vec<&QueryMetric> = snapshot
            .iter()
            .filter(|m| query_type.map_or(true, |t| m.query_type == t))
            .collect();
        stats::compute(&selected, query_type, window_minutes, slow)
    }

    /// Metrics slower than `threshold` (the configured one when `None`),
    /// slowest first.
    pub fn slow_queries(&self, threshold: Option<Duration>, limit: usize) -> Vec<QueryMetric> {
        let threshold = threshold.unwrap_or(self.config.read().slow_query_threshold);
        let mut slow: Vec<QueryMetric> = self
            .history
            .lock()
            .iter()
            .filter(|m| m.execution_time > threshold)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.execution_time.cmp(&a.execution_time));
        slow.truncate(limit);
        slow
    }

    /// Per-interval aggregates over the last `hours`.
    pub fn trends(&self, hours: u64, interval_minutes: u64) -> Vec<TrendPoint> {
        let now = Utc::now();
        let snapshot: Vec<QueryMetric> = self.history.lock().iter().cloned().collect();
        let refs: Vec<&QueryMetric> = snapshot.iter().collect();
        stats::trends(&refs, now, hours, interval_minutes)
    }

    /// Alerts over the last hour, globally and per query type.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts_at(Utc::now())
    }

    pub fn alerts_at(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let config = self.config.read().clone();
        let mut alerts = alerts::evaluate(
            &self.stats_at(None, DEFAULT_WINDOW_MINUTES, now),
            &config,
        );
        for query_type in QueryType::ALL {
            alerts.extend(alerts::evaluate(
                &self.stats_at(Some(query_type), DEFAULT_WINDOW_MINUTES, now),
                &config,
            ));
        }
        alerts
    }

    /// Drops the whole history.
    pub fn reset(&self) {
        let dropped = {
            let mut history = self.history.lock();
            let dropped = history.len();
            history.clear();
            dropped
        };
        info!(dropped, "performance history reset");
    }

    /// Snapshot of statistics, alerts, slow queries and trends.
    pub fn export(&self) -> MonitorExport {
        let now = Utc::now();
        let by_type: BTreeMap<QueryType, PerformanceStats> = QueryType::ALL
            .into_iter()
            .map(|t| (t, self.stats_at(Some(t), DEFAULT_WINDOW_MINUTES, now)))
            .filter(|(_, stats)| stats.count > 0)
            .collect();

        MonitorExport {
            exported_at: now,
            history_len: self.len(),
            overall: self.stats_at(None, DEFAULT_WINDOW_MINUTES, now),
            by_type,
            alerts: self.alerts_at(now),
            slow_queries: self.slow_queries(None, EXPORT_SLOW_QUERY_LIMIT),
            trends: self.trends(24, 60),
        }
    }

    /// Metrics with timestamps in `[now - window, now]`.
    fn window(&self, now: DateTime<Utc>, window_minutes: u64) -> Vec<QueryMetric> {
        let start = stats::window_start(now, window_minutes);
        self.history
            .lock()
            .iter()
            .filter(|m| m.timestamp >= start && m.timestamp <= now)
            .cloned()
            .collect()
    }
}
