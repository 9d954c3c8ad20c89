//! Cumulative counter reconciliation
//!
//! The monitoring backend reports per-minute averages. Kubelet stats want
//! monotonically increasing totals, so every poll folds the samples newer
//! than the last one seen into a running total kept per pod UID.

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::models::MetricValue;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Seconds covered by one backend sample
const SAMPLE_INTERVAL_SECS: f64 = 60.0;

/// Entries of pods not polled for this long are dropped
pub const CUMULATIVE_USAGE_TTL_MINUTES: i64 = 30;

/// Running total and the timestamp of the newest sample folded into it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CumulativeValue {
    pub last_update: Option<DateTime<Utc>>,
    pub value: u64,
}

/// Fold `samples` into `cumulative` and return the new total.
///
/// A gap of more than one sample interval between the last folded sample and
/// the oldest new one resets the total: usage across an unobserved gap is
/// never estimated. Samples at or before `last_update` are ignored, so
/// re-delivering a series is a no-op.
pub fn accumulate(cumulative: &mut CumulativeValue, samples: &[MetricValue], multiplier: f64) -> u64 {
    let mut samples: Vec<(DateTime<Utc>, f64)> = samples
        .iter()
        .filter_map(|s| s.average.map(|avg| (s.time_stamp, avg)))
        .collect();
    samples.sort_by_key(|(ts, _)| *ts);

    let Some((oldest, _)) = samples.first() else {
        return cumulative.value;
    };

    if let Some(last) = cumulative.last_update {
        if *oldest - last > Duration::minutes(1) {
            debug!(
                last_update = %last,
                oldest_sample = %oldest,
                "Gap in samples, resetting cumulative value"
            );
            *cumulative = CumulativeValue::default();
        }
    }

    for (ts, avg) in samples {
        if cumulative.last_update.map_or(true, |last| ts > last) {
            let delta = (avg * SAMPLE_INTERVAL_SECS * multiplier).max(0.0).round() as u64;
            cumulative.value = cumulative.value.saturating_add(delta);
            cumulative.last_update = Some(ts);
        }
    }

    cumulative.value
}

/// Cumulative counters of one pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodCumulativeUsage {
    pub network_rx: CumulativeValue,
    pub network_tx: CumulativeValue,
    /// CPU core-nanoseconds by container name
    pub container_cpu: HashMap<String, CumulativeValue>,
}

/// Per-pod cumulative counters, keyed by pod UID
pub struct CumulativeUsageTracker {
    cache: TtlCache<String, PodCumulativeUsage>,
}

impl CumulativeUsageTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: TtlCache::new(
                "cumulative_usage",
                Duration::minutes(CUMULATIVE_USAGE_TTL_MINUTES),
                clock,
            ),
        }
    }

    /// Run `update` against the pod's counters and persist the result
    pub fn update<R>(&self, uid: &str, update: impl FnOnce(&mut PodCumulativeUsage) -> R) -> R {
        let mut usage = self.cache.get(&uid.to_string()).unwrap_or_default();
        let result = update(&mut usage);
        self.cache.set(uid.to_string(), usage);
        result
    }

    pub fn get(&self, uid: &str) -> Option<PodCumulativeUsage> {
        self.cache.get(&uid.to_string())
    }

    /// Forget pods whose counters were not updated within the TTL
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    const CPU_MULTIPLIER: f64 = 1_000_000.0;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn sample(at: DateTime<Utc>, average: f64) -> MetricValue {
        MetricValue {
            time_stamp: at,
            average: Some(average),
        }
    }

    #[test]
    fn test_first_poll_sums_series() {
        let mut value = CumulativeValue::default();
        let samples = vec![
            sample(t0(), 10.0),
            sample(t0() + Duration::minutes(1), 20.0),
        ];
        assert_eq!(accumulate(&mut value, &samples, CPU_MULTIPLIER), 30 * 60 * 1_000_000);
        assert_eq!(value.last_update, Some(t0() + Duration::minutes(1)));
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let mut value = CumulativeValue::default();
        let samples = vec![sample(t0(), 10.0)];

        let first = accumulate(&mut value, &samples, CPU_MULTIPLIER);
        let second = accumulate(&mut value, &samples, CPU_MULTIPLIER);
        assert_eq!(first, second);
        assert_eq!(second, 10 * 1_000_000 * 60);
    }

    #[test]
    fn test_contiguous_polls_accumulate() {
        let mut value = CumulativeValue::default();
        accumulate(&mut value, &[sample(t0(), 10.0)], CPU_MULTIPLIER);
        let total = accumulate(
            &mut value,
            &[sample(t0() + Duration::minutes(1), 10.0)],
            CPU_MULTIPLIER,
        );
        assert_eq!(total, 2 * 10 * 1_000_000 * 60);
    }

    #[test]
    fn test_overlapping_window_counts_new_samples_only() {
        let mut value = CumulativeValue::default();
        accumulate(&mut value, &[sample(t0(), 10.0)], CPU_MULTIPLIER);
        let total = accumulate(
            &mut value,
            &[
                sample(t0(), 10.0),
                sample(t0() + Duration::minutes(1), 5.0),
            ],
            CPU_MULTIPLIER,
        );
        assert_eq!(total, 15 * 1_000_000 * 60);
    }

    #[test]
    fn test_gap_resets_to_own_window() {
        let mut value = CumulativeValue::default();
        accumulate(&mut value, &[sample(t0(), 10.0)], CPU_MULTIPLIER);
        let total = accumulate(
            &mut value,
            &[sample(t0() + Duration::minutes(2), 10.0)],
            CPU_MULTIPLIER,
        );
        assert_eq!(total, 10 * 1_000_000 * 60);
    }

    #[test]
    fn test_unsorted_and_empty_samples() {
        let mut value = CumulativeValue::default();
        let samples = vec![
            sample(t0() + Duration::minutes(1), 2.0),
            MetricValue {
                time_stamp: t0() + Duration::minutes(2),
                average: None,
            },
            sample(t0(), 1.0),
        ];
        assert_eq!(accumulate(&mut value, &samples, 1.0), 180);
        assert_eq!(value.last_update, Some(t0() + Duration::minutes(1)));

        // nothing new leaves the total untouched
        assert_eq!(accumulate(&mut value, &[], 1.0), 180);
    }

    #[test]
    fn test_tracker_persists_and_expires() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = CumulativeUsageTracker::new(clock.clone());

        let total = tracker.update("uid-1", |usage| {
            let cpu = usage.container_cpu.entry("web".to_string()).or_default();
            accumulate(cpu, &[sample(t0(), 1.0)], CPU_MULTIPLIER)
        });
        assert_eq!(total, 60 * 1_000_000);
        assert_eq!(
            tracker.get("uid-1").unwrap().container_cpu["web"].value,
            60 * 1_000_000
        );

        clock.advance(Duration::minutes(31));
        assert!(tracker.get("uid-1").is_none());
    }

    #[test]
    fn test_departed_pods_are_purged() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = CumulativeUsageTracker::new(clock.clone());
        for i in 0..100 {
            tracker.update(&format!("uid-{i}"), |usage| usage.network_rx.value += 1);
        }

        for _ in 0..10 {
            clock.advance(Duration::minutes(10));
            tracker.update("alive", |usage| usage.network_rx.value += 1);
        }

        assert_eq!(tracker.purge_expired(), 100);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get("alive").unwrap().network_rx.value, 10);
    }
}
