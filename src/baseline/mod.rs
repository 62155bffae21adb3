//! Rolling baseline statistics over historical snapshots.
//!
//! The accessor recomputes per-metric aggregates (mean, population std-dev,
//! min, max, median) over a trailing window and caches the result with a
//! short TTL so repeated calls inside one detection cycle, or from ad-hoc
//! analysis requests, do not hit the store again.

use crate::storage::{self, Pool};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("insufficient baseline data: need {needed} snapshots, have {have}")]
    InsufficientData { needed: u64, have: u64 },
    #[error("baseline store unavailable: {0}")]
    Store(String),
}

/// Aggregates for one metric over the baseline window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub sample_count: u64,
}

/// Rolling statistical summary of historical snapshots, the "normal"
/// reference the pre-filter compares against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineStatistics {
    pub metrics: HashMap<String, MetricStats>,
    pub window_days: u32,
    pub snapshot_count: u64,
    pub computed_at: DateTime<Utc>,
    /// Set when this value was served from cache after a recompute failure.
    #[serde(default)]
    pub stale: bool,
}

impl BaselineStatistics {
    pub fn metric(&self, name: &str) -> Option<&MetricStats> {
        self.metrics.get(name)
    }
}

/// Clock seam so cache TTL checks are testable with a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct BaselineAccessor {
    pool: Pool,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    min_samples: u64,
    cache: Mutex<Option<BaselineStatistics>>,
}

impl BaselineAccessor {
    pub fn new(pool: Pool, ttl_secs: u64, min_samples: u64) -> Self {
        Self::with_clock(pool, ttl_secs, min_samples, Arc::new(SystemClock))
    }

    pub fn with_clock(
        pool: Pool,
        ttl_secs: u64,
        min_samples: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            clock,
            ttl: Duration::seconds(ttl_secs as i64),
            min_samples,
            cache: Mutex::new(None),
        }
    }

    /// Fetch baseline statistics for the trailing window, recomputing when
    /// the cache is cold, expired, computed over a different window, or
    /// `force_refresh` is set.
    ///
    /// If the store is unreachable on recompute, the last good cached value
    /// is returned flagged `stale`; the call only fails outright when there
    /// is no cache to fall back on.
    pub fn get(
        &self,
        window_days: u32,
        force_refresh: bool,
    ) -> Result<BaselineStatistics, BaselineError> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().unwrap();

        if !force_refresh {
            if let Some(cached) = cache.as_ref() {
                let fresh = now - cached.computed_at < self.ttl;
                if fresh && cached.window_days == window_days && !cached.stale {
                    debug!(window_days, "Baseline served from cache");
                    return Ok(cached.clone());
                }
            }
        }

        match self.recompute(window_days, now) {
            Ok(stats) => {
                *cache = Some(stats.clone());
                Ok(stats)
            }
            Err(BaselineError::InsufficientData { needed, have }) => {
                // Not a store failure -- never mask a warm-up period with
                // a stale cache.
                Err(BaselineError::InsufficientData { needed, have })
            }
            Err(BaselineError::Store(e)) => match cache.as_ref() {
                Some(cached) => {
                    warn!(error = %e, "Baseline recompute failed, serving stale cache");
                    let mut stale = cached.clone();
                    stale.stale = true;
                    Ok(stale)
                }
                None => Err(BaselineError::Store(e)),
            },
        }
    }

    fn recompute(
        &self,
        window_days: u32,
        now: DateTime<Utc>,
    ) -> Result<BaselineStatistics, BaselineError> {
        let since = now - Duration::days(window_days as i64);
        let snapshots = storage::snapshots_since(&self.pool, since)
            .map_err(|e| BaselineError::Store(e.to_string()))?;

        let snapshot_count = snapshots.len() as u64;
        if snapshot_count < self.min_samples {
            return Err(BaselineError::InsufficientData {
                needed: self.min_samples,
                have: snapshot_count,
            });
        }

        let mut series: HashMap<String, Vec<f64>> = HashMap::new();
        for snap in &snapshots {
            for (name, value) in &snap.metrics {
                series.entry(name.clone()).or_default().push(*value);
            }
        }

        let mut metrics = HashMap::new();
        for (name, values) in series {
            metrics.insert(name, compute_stats(&values));
        }

        debug!(window_days, snapshot_count, "Baseline recomputed");
        Ok(BaselineStatistics {
            metrics,
            window_days,
            snapshot_count,
            computed_at: now,
            stale: false,
        })
    }
}

/// Mean, population standard deviation, min, max, median for one series.
fn compute_stats(values: &[f64]) -> MetricStats {
    if values.is_empty() {
        return MetricStats::default();
    }

    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = if count % 2 == 1 {
        sorted[count / 2]
    } else {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    };

    MetricStats {
        mean,
        std_dev: variance.sqrt(),
        min: sorted[0],
        max: sorted[count - 1],
        median,
        sample_count: count as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::temp_pool;
    use crate::storage::{insert_snapshot, Snapshot};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Manual clock: shared seconds-since-epoch offset from a fixed origin.
    struct ManualClock {
        origin: DateTime<Utc>,
        offset_secs: AtomicI64,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                origin: Utc::now(),
                offset_secs: AtomicI64::new(0),
            }
        }

        fn advance(&self, secs: i64) {
            self.offset_secs.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.origin + Duration::seconds(self.offset_secs.load(Ordering::SeqCst))
        }
    }

    fn seed_snapshots(pool: &Pool, n: usize, tvl: impl Fn(usize) -> f64) {
        let base = Utc::now() - Duration::hours(2);
        for i in 0..n {
            let mut metrics = HashMap::new();
            metrics.insert("total_value_locked".to_string(), tvl(i));
            metrics.insert("gas_price".to_string(), 40.0);
            insert_snapshot(
                pool,
                &Snapshot {
                    taken_at: base + Duration::minutes(i as i64 * 5),
                    source: "rpc".to_string(),
                    success: true,
                    metrics,
                },
            )
            .unwrap();
        }
    }

    #[test]
    fn test_compute_stats_population() {
        let s = compute_stats(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(s.mean, 3.0);
        // Population variance of 1..5 is 2.0
        assert!((s.std_dev - 2.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 5.0);
        assert_eq!(s.median, 3.0);
        assert_eq!(s.sample_count, 5);

        let even = compute_stats(&[4.0, 1.0, 3.0, 2.0]);
        assert_eq!(even.median, 2.5);
    }

    #[test]
    fn test_insufficient_data_floor() {
        let (_dir, pool) = temp_pool();
        seed_snapshots(&pool, 8, |_| 1_000_000.0);

        let accessor = BaselineAccessor::new(pool, 300, 12);
        match accessor.get(7, false) {
            Err(BaselineError::InsufficientData { needed, have }) => {
                assert_eq!(needed, 12);
                assert_eq!(have, 8);
            }
            other => panic!("expected InsufficientData, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let (_dir, pool) = temp_pool();
        seed_snapshots(&pool, 20, |i| 1_000_000.0 + i as f64 * 100.0);

        let clock = Arc::new(ManualClock::new());
        let accessor = BaselineAccessor::with_clock(pool.clone(), 300, 12, clock.clone());

        let first = accessor.get(7, false).unwrap();

        // New data lands, but within the TTL the cached statistics come back
        // bit-identical with no second aggregation pass.
        seed_snapshots(&pool, 5, |_| 9_999_999.0);
        clock.advance(60);
        let second = accessor.get(7, false).unwrap();
        assert_eq!(first.snapshot_count, second.snapshot_count);
        assert_eq!(
            first.metric("total_value_locked").unwrap().mean,
            second.metric("total_value_locked").unwrap().mean
        );
        assert_eq!(first.computed_at, second.computed_at);

        // Past the TTL the recompute picks the new rows up.
        clock.advance(301);
        let third = accessor.get(7, false).unwrap();
        assert!(third.snapshot_count > first.snapshot_count);
    }

    #[test]
    fn test_force_refresh_bypasses_cache() {
        let (_dir, pool) = temp_pool();
        seed_snapshots(&pool, 15, |_| 1_000_000.0);

        let accessor = BaselineAccessor::new(pool.clone(), 300, 12);
        let first = accessor.get(7, false).unwrap();
        seed_snapshots(&pool, 5, |_| 1_000_000.0);

        let refreshed = accessor.get(7, true).unwrap();
        assert_eq!(first.snapshot_count, 15);
        assert_eq!(refreshed.snapshot_count, 20);
    }

    #[test]
    fn test_stale_fallback_on_store_failure() {
        let (_dir, pool) = temp_pool();
        seed_snapshots(&pool, 15, |_| 1_000_000.0);

        let accessor = BaselineAccessor::new(pool.clone(), 300, 12);
        let first = accessor.get(7, false).unwrap();
        assert!(!first.stale);

        // Break the store out from under the accessor.
        pool.get()
            .unwrap()
            .execute_batch("DROP TABLE snapshots")
            .unwrap();

        let fallback = accessor.get(7, true).unwrap();
        assert!(fallback.stale);
        assert_eq!(fallback.snapshot_count, first.snapshot_count);
    }

    #[test]
    fn test_no_cache_no_fallback() {
        let (_dir, pool) = temp_pool();
        pool.get()
            .unwrap()
            .execute_batch("DROP TABLE snapshots")
            .unwrap();

        let accessor = BaselineAccessor::new(pool, 300, 12);
        assert!(matches!(
            accessor.get(7, false),
            Err(BaselineError::Store(_))
        ));
    }
}
