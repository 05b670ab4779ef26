//! Threshold alert evaluation.

use super::types::{Alert, AlertKind, AlertSeverity, MonitorConfig, PerformanceStats};

/// Alerts raised by one set of statistics.
///
/// A breach is critical when it is at least twice as far past the threshold
/// as the threshold itself allows (double the slow or error limit, half the
/// hit rate floor).
pub fn evaluate(stats: &PerformanceStats, config: &MonitorConfig) -> Vec<Alert> {
    if stats.count == 0 {
        return Vec::new();
    }

    let scope = stats
        .query_type
        .map(|t| t.as_str())
        .unwrap_or("all queries");
    let mut alerts = Vec::new();

    let slow = config.slow_query_threshold.as_secs_f64();
    if stats.avg_execution_time > slow {
        alerts.push(Alert {
            kind: AlertKind::SlowAverage,
            severity: severity(stats.avg_execution_time >= slow * 2.0),
            query_type: stats.query_type,
            value: stats.avg_execution_time,
            threshold: slow,
            message: format!(
                "{scope}: average execution time {:.3}s exceeds {:.3}s",
                stats.avg_execution_time, slow
            ),
        });
    }

    if stats.error_rate > config.error_rate_threshold {
        alerts.push(Alert {
            kind: AlertKind::HighErrorRate,
            severity: severity(stats.error_rate >= config.error_rate_threshold * 2.0),
            query_type: stats.query_type,
            value: stats.error_rate,
            threshold: config.error_rate_threshold,
            message: format!(
                "{scope}: error rate {:.1}% exceeds {:.1}%",
                stats.error_rate * 100.0,
                config.error_rate_threshold * 100.0
            ),
        });
    }

    if stats.cache_hit_rate < config.cache_hit_rate_threshold {
        alerts.push(Alert {
            kind: AlertKind::LowCacheHitRate,
            severity: severity(stats.cache_hit_rate <= config.cache_hit_rate_threshold / 2.0),
            query_type: stats.query_type,
            value: stats.cache_hit_rate,
            threshold: config.cache_hit_rate_threshold,
            message: format!(
                "{scope}: cache hit rate {:.1}% below {:.1}%",
                stats.cache_hit_rate * 100.0,
                config.cache_hit_rate_threshold * 100.0
            ),
        });
    }

    alerts
}

fn severity(critical: bool) -> AlertSeverity {
    if critical {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::types::QueryType;

    fn healthy() -> PerformanceStats {
        PerformanceStats {
            count: 100,
            avg_execution_time: 0.01,
            cache_hit_rate: 0.95,
            error_rate: 0.0,
            ..PerformanceStats::default()
        }
    }

    #[test]
    fn test_healthy_stats_raise_nothing() {
        assert!(evaluate(&healthy(), &MonitorConfig::default()).is_empty());
    }

    #[test]
    fn test_empty_window_raises_nothing() {
        let stats = PerformanceStats::default();
        assert!(evaluate(&stats, &MonitorConfig::default()).is_empty());
    }

    #[test]
    fn test_each_threshold_raises_its_alert() {
        let stats = PerformanceStats {
            query_type: Some(QueryType::BatchCheck),
            avg_execution_time: 1.5,
            error_rate: 0.06,
            cache_hit_rate: 0.5,
            ..healthy()
        };

        let alerts = evaluate(&stats, &MonitorConfig::default());

        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::SlowAverage,
                AlertKind::HighErrorRate,
                AlertKind::LowCacheHitRate
            ]
        );
        assert!(alerts
            .iter()
            .all(|a| a.severity == AlertSeverity::Warning));
        assert!(alerts[0].message.starts_with("batch_check"));
    }

    #[test]
    fn test_far_breach_is_critical() {
        let stats = PerformanceStats {
            error_rate: 0.25,
            ..healthy()
        };

        let alerts = evaluate(&stats, &MonitorConfig::default());

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }
}
