//! Windowed statistics and trend bucketing.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::types::{PerformanceStats, QueryMetric, QueryType, TrendPoint};

/// Longest trailing window accepted by windowed reads, about ten years.
/// Longer requests are clamped to it.
pub const MAX_WINDOW_MINUTES: u64 = 10 * 366 * 24 * 60;

/// Most slots a trend series is split into; the interval widens to fit.
pub const MAX_TREND_BUCKETS: u64 = 10_000;

/// Start of the trailing window of `minutes` ending at `now`.
pub fn window_start(now: DateTime<Utc>, minutes: u64) -> DateTime<Utc> {
    ChronoDuration::try_minutes(minutes.min(MAX_WINDOW_MINUTES) as i64)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Nearest-rank percentile of ascending `sorted` values.
///
/// The rank is `ceil(p/100 * n)`, 1-based. Returns 0.0 for no data.
pub fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Aggregates the given metrics.
pub fn compute(
    metrics: &[&QueryMetric],
    query_type: Option<QueryType>,
    window_minutes: u64,
    slow_threshold: Duration,
) -> PerformanceStats {
    let mut stats = PerformanceStats {
        query_type,
        window_minutes,
        count: metrics.len(),
        ..PerformanceStats::default()
    };
    if metrics.is_empty() {
        return stats;
    }

    let mut times: Vec<f64> = metrics
        .iter()
        .map(|m| m.execution_time.as_secs_f64())
        .collect();
    times.sort_by(f64::total_cmp);

    let n = times.len() as f64;
    stats.avg_execution_time = times.iter().sum::<f64>() / n;
    stats.min_execution_time = times[0];
    stats.max_execution_time = times[times.len() - 1];
    stats.p95_execution_time = nearest_rank(&times, 95.0);
    stats.p99_execution_time = nearest_rank(&times, 99.0);

    stats.cache_hit_rate = metrics.iter().filter(|m| m.cache_hit).count() as f64 / n;
    stats.error_rate = metrics.iter().filter(|m| m.is_error()).count() as f64 / n;
    stats.slow_query_count = metrics
        .iter()
        .filter(|m| m.execution_time > slow_threshold)
        .count();

    let first = metrics.iter().map(|m| m.timestamp).min();
    let last = metrics.iter().map(|m| m.timestamp).max();
    let span = match (first, last) {
        (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1000.0,
        _ => 0.0,
    };
    stats.queries_per_second = n / span.max(1.0);

    stats
}

/// Buckets metrics of the last `hours` into `interval_minutes` slots.
///
/// Every slot is reported, oldest first, including empty ones. The span is
/// clamped to [`MAX_WINDOW_MINUTES`] and the interval to the span, then
/// widened so there are at most [`MAX_TREND_BUCKETS`] slots.
pub fn trends(
    metrics: &[&QueryMetric],
    now: DateTime<Utc>,
    hours: u64,
    interval_minutes: u64,
) -> Vec<TrendPoint> {
    let span_minutes = hours.max(1).saturating_mul(60).min(MAX_WINDOW_MINUTES);
    let interval_minutes = interval_minutes
        .clamp(1, span_minutes)
        .max(span_minutes.div_ceil(MAX_TREND_BUCKETS));
    let start = window_start(now, span_minutes);
    // Bounded by MAX_WINDOW_MINUTES, well inside the TimeDelta range
    let interval = ChronoDuration::minutes(interval_minutes as i64);
    let buckets = (span_minutes / interval_minutes).max(1) as usize;

    let mut grouped: Vec<Vec<&QueryMetric>> = vec![Vec::new(); buckets];
    for metric in metrics {
        if metric.timestamp < start || metric.timestamp > now {
            continue;
        }
        let offset = (metric.timestamp - start).num_seconds() / interval.num_seconds();
        let index = (offset as usize).min(buckets - 1);
        grouped[index].push(*metric);
    }

    grouped
        .into_iter()
        .enumerate()
        .map(|(i, bucket)| {
            let count = bucket.len();
            let rate = |pred: fn(&QueryMetric) -> bool| {
                if count == 0 {
                    0.0
                } else {
                    bucket.iter().filter(|m| pred(m)).count() as f64 / count as f64
                }
            };
            TrendPoint {
                bucket_start: start + interval * i as i32,
                count,
                avg_execution_time: if count == 0 {
                    0.0
                } else {
                    bucket
                        .iter()
                        .map(|m| m.execution_time.as_secs_f64())
                        .sum::<f64>()
                        / count as f64
                },
                cache_hit_rate: rate(|m| m.cache_hit),
                error_rate: rate(QueryMetric::is_error),
            }
        })
        .collect()
}
