//! Sliding-window access history and preload candidate scoring.

use std::collections::VecDeque;
use std::hash::Hash;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use permgate_domain::SubjectId;

use super::types::{PreloadCandidate, PreloadConfig};

const FREQUENCY_WEIGHT: f64 = 0.4;
const REGULARITY_WEIGHT: f64 = 0.3;
const RECENCY_WEIGHT: f64 = 0.3;

/// Per-subject and per-permission-code access timestamps.
///
/// Timestamps older than the window are trimmed on every write and ignored
/// on every read; each key keeps at most `max_records_per_key` entries.
#[derive(Debug, Default)]
pub struct AccessPatternTracker {
    subjects: DashMap<SubjectId, VecDeque<DateTime<Utc>>>,
    codes: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl AccessPatternTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one access for each subject and code at `at`.
    pub fn record_at(
        &self,
        subject_ids: &[SubjectId],
        codes: &[String],
        at: DateTime<Utc>,
        config: &PreloadConfig,
    ) {
        let cutoff = cutoff(at, config);
        for id in subject_ids {
            push(&self.subjects, *id, at, cutoff, config.max_records_per_key);
        }
        for code in codes {
            push(&self.codes, code.clone(), at, cutoff, config.max_records_per_key);
        }
    }

    /// Number of subjects with any recorded access.
    pub fn tracked_subjects(&self) -> usize {
        self.subjects.len()
    }

    /// Accesses of a permission code inside the window ending at `now`.
    pub fn code_access_count(&self, code: &str, now: DateTime<Utc>, config: &PreloadConfig) -> usize {
        let cutoff = cutoff(now, config);
        self.codes
            .get(code)
            .map(|entries| entries.iter().filter(|t| **t >= cutoff && **t <= now).count())
            .unwrap_or(0)
    }

    /// Scores every subject with enough recent accesses.
    ///
    /// Returns candidates scoring above the threshold, best first, capped at
    /// `max_candidates`. Keys whose history fell entirely out of the window
    /// are dropped.
    pub fn analyze_at(&self, now: DateTime<Utc>, config: &PreloadConfig) -> Vec<PreloadCandidate> {
        let cutoff = cutoff(now, config);
        let window_secs = config.window.as_secs_f64().max(1.0);

        self.subjects.retain(|_, entries| {
            trim(entries, cutoff);
            !entries.is_empty()
        });
        self.codes.retain(|_, entries| {
            trim(entries, cutoff);
            !entries.is_empty()
        });

        let mut candidates: Vec<PreloadCandidate> = self
            .subjects
            .iter()
            .filter_map(|entry| {
                let times: Vec<DateTime<Utc>> =
                    entry.value().iter().copied().filter(|t| *t <= now).collect();
                if times.len() < config.min_access_count.max(1) {
                    return None;
                }
                let candidate = score(*entry.key(), &times, now, window_secs);
                (candidate.score > config.score_threshold).then_some(candidate)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.subject_id.cmp(&b.subject_id))
        });
        candidates.truncate(config.max_candidates);
        candidates
    }

    pub fn clear(&self) {
        self.subjects.clear();
        self.codes.clear();
    }
}

fn cutoff(now: DateTime<Utc>, config: &PreloadConfig) -> DateTime<Utc> {
    let window = ChronoDuration::from_std(config.window).unwrap_or(ChronoDuration::MAX);
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn push<K: Eq + Hash>(
    map: &DashMap<K, VecDeque<DateTime<Utc>>>,
    key: K,
    at: DateTime<Utc>,
    cutoff: DateTime<Utc>,
    max_records: usize,
) {
    let mut entries = map.entry(key).or_default();
    entries.push_back(at);
    trim(&mut entries, cutoff);
    while entries.len() > max_records.max(1) {
        entries.pop_front();
    }
}

fn trim(entries: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while entries.front().is_some_and(|t| *t < cutoff) {
        entries.pop_front();
    }
}

/// `0.4·frequency + 0.3·regularity + 0.3·recency` over sorted timestamps.
fn score(
    subject_id: SubjectId,
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
    window_secs: f64,
) -> PreloadCandidate {
    let mut sorted = times.to_vec();
    sorted.sort();

    let frequency = sorted.len() as f64 / window_secs;

    let intervals: Vec<f64> = sorted
        .windows(2)
        .map(|pair| seconds_between(pair[0], pair[1]))
        .collect();
    let regularity = 1.0 / (population_stddev(&intervals) + 1.0);

    let last = sorted.last().copied().unwrap_or(now);
    let recency = 1.0 / (seconds_between(last, now) + 1.0);

    PreloadCandidate {
        subject_id,
        score: FREQUENCY_WEIGHT * frequency
            + REGULARITY_WEIGHT * regularity
            + RECENCY_WEIGHT * recency,
        frequency,
        regularity,
        recency,
        access_count: sorted.len(),
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PreloadConfig {
        PreloadConfig::default()
    }

    fn at(now: DateTime<Utc>, secs_ago: i64) -> DateTime<Utc> {
        now - ChronoDuration::seconds(secs_ago)
    }

    #[test]
    fn test_regular_recent_history_outscores_sparse_old_history() {
        // Arrange
        let tracker = AccessPatternTracker::new();
        let config = config();
        let now = Utc::now();

        for i in 0..10 {
            tracker.record_at(&[1], &[], at(now, 1 + i * 60), &config);
        }
        for secs_ago in [3500, 3100, 2000] {
            tracker.record_at(&[2], &[], at(now, secs_ago), &config);
        }

        // Act
        let relaxed = PreloadConfig {
            score_threshold: 0.0,
            ..config
        };
        let candidates = tracker.analyze_at(now, &relaxed);

        // Assert
        let regular = candidates.iter().find(|c| c.subject_id == 1).unwrap();
        let sparse = candidates.iter().find(|c| c.subject_id == 2).unwrap();
        assert!(regular.score > sparse.score);
        assert_eq!(candidates[0].subject_id, 1);
        assert!((regular.regularity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_follows_weighted_formula() {
        let tracker = AccessPatternTracker::new();
        let config = config();
        let now = Utc::now();
        // Intervals 10s and 30s: population stddev 10
        for secs_ago in [40, 30, 0] {
            tracker.record_at(&[7], &[], at(now, secs_ago), &config);
        }

        let relaxed = PreloadConfig {
            score_threshold: 0.0,
            ..config
        };
        let candidate = tracker.analyze_at(now, &relaxed).remove(0);

        let frequency = 3.0 / 3600.0;
        let regularity = 1.0 / 11.0;
        let recency = 1.0;
        assert!((candidate.frequency - frequency).abs() < 1e-9);
        assert!((candidate.regularity - regularity).abs() < 1e-9);
        assert!((candidate.recency - recency).abs() < 1e-9);
        assert!(
            (candidate.score - (0.4 * frequency + 0.3 * regularity + 0.3 * recency)).abs() < 1e-9
        );
    }

    #[test]
    fn test_subjects_below_min_access_count_are_skipped() {
        let tracker = AccessPatternTracker::new();
        let config = config();
        let now = Utc::now();
        tracker.record_at(&[1], &[], at(now, 2), &config);
        tracker.record_at(&[1], &[], at(now, 1), &config);

        assert!(tracker.analyze_at(now, &config).is_empty());
    }

    #[test]
    fn test_threshold_filters_and_cap_truncates() {
        let tracker = AccessPatternTracker::new();
        let config = PreloadConfig {
            max_candidates: 2,
            ..config()
        };
        let now = Utc::now();
        for id in 1..=4 {
            for i in 0..3 {
                tracker.record_at(&[id], &[], at(now, i * 10), &config);
            }
        }
        // Old, irregular history scores below the default threshold
        for secs_ago in [3590, 3000, 1000] {
            tracker.record_at(&[99], &[], at(now, secs_ago), &config);
        }

        let candidates = tracker.analyze_at(now, &config);

        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c.score > config.score_threshold));
        assert!(candidates.iter().all(|c| c.subject_id != 99));
    }

    #[test]
    fn test_entries_outside_window_are_discarded() {
        let tracker = AccessPatternTracker::new();
        let config = config();
        let now = Utc::now();
        for secs_ago in [7200, 7100, 7000] {
            tracker.record_at(&[5], &["report:read".to_string()], at(now, secs_ago), &config);
        }

        let relaxed = PreloadConfig {
            score_threshold: 0.0,
            ..config.clone()
        };
        assert!(tracker.analyze_at(now, &relaxed).is_empty());
        assert_eq!(tracker.tracked_subjects(), 0);
        assert_eq!(tracker.code_access_count("report:read", now, &config), 0);
    }

    #[test]
    fn test_records_per_key_are_capped() {
        let tracker = AccessPatternTracker::new();
        let config = PreloadConfig {
            max_records_per_key: 5,
            ..config()
        };
        let now = Utc::now();
        for i in 0..20 {
            tracker.record_at(&[3], &["doc:read".to_string()], at(now, 100 - i), &config);
        }

        assert_eq!(tracker.code_access_count("doc:read", now, &config), 5);
        let relaxed = PreloadConfig {
            score_threshold: 0.0,
            ..config
        };
        assert_eq!(tracker.analyze_at(now, &relaxed)[0].access_count, 5);
    }
}
