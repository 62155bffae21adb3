//! Stateless pre-filter: one snapshot + one baseline -> one trigger.
//!
//! Pure function, no I/O. The orchestrator owns persistence and escalation;
//! this module only grades the current state.

use crate::baseline::BaselineStatistics;
use crate::config::Thresholds;
use crate::detect::{Severity, Trigger, TriggerEvidence};
use crate::storage::{SentimentSummary, Snapshot};
use std::collections::HashSet;
use uuid::Uuid;

/// Z = (current - mean) / std_dev, defined as 0 when the baseline is flat.
pub fn z_score(current: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        0.0
    } else {
        (current - mean) / std_dev
    }
}

/// Evaluate the current snapshot against the baseline and produce a trigger.
///
/// Rules run in priority order: z-score metrics, the peg ratio (absolute
/// deviation from the 1.0 target, baseline-independent), gas price (fixed
/// congestion bands), sentiment (when a summary is supplied), then a
/// correlation bonus when evidence spans two or more distinct metrics.
pub fn evaluate(
    thresholds: &Thresholds,
    snapshot: &Snapshot,
    baseline: &BaselineStatistics,
    sentiment: Option<&SentimentSummary>,
) -> Trigger {
    let mut evidence = Vec::new();

    // 1. Magnitude metrics, graded by z-score
    for metric in &thresholds.z_metrics {
        let (Some(current), Some(stats)) = (snapshot.metric(metric), baseline.metric(metric))
        else {
            continue;
        };
        let z = z_score(current, stats.mean, stats.std_dev);
        let severity = if z.abs() >= thresholds.z_critical {
            Some(Severity::Critical)
        } else if z.abs() >= thresholds.z_high {
            Some(Severity::High)
        } else if z.abs() >= thresholds.z_medium {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            evidence.push(TriggerEvidence {
                metric: metric.clone(),
                severity,
                current_value: current,
                baseline_value: stats.mean,
                z_score: Some(z),
                reason: format!(
                    "{} at {:.2} deviates {:.1} sigma from baseline mean {:.2}",
                    metric, current, z, stats.mean
                ),
            });
        }
    }

    // 2. Peg ratio: a hard deviation from the theoretical target matters
    //    even if it is "normal" historically.
    if let Some(current) = snapshot.metric(&thresholds.peg_metric) {
        let deviation = (current - 1.0).abs();
        let severity = if deviation >= thresholds.peg_critical {
            Some(Severity::Critical)
        } else if deviation >= thresholds.peg_high {
            Some(Severity::High)
        } else if deviation >= thresholds.peg_medium {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            evidence.push(TriggerEvidence {
                metric: thresholds.peg_metric.clone(),
                severity,
                current_value: current,
                baseline_value: 1.0,
                z_score: None,
                reason: format!(
                    "peg ratio {:.6} is {:.2}% off the 1.0 target",
                    current,
                    deviation * 100.0
                ),
            });
        }
    }

    // 3. Gas price: fixed bands regardless of baseline
    if let Some(current) = snapshot.metric(&thresholds.gas_metric) {
        let severity = if current >= thresholds.gas_critical {
            Some(Severity::Critical)
        } else if current >= thresholds.gas_high {
            Some(Severity::High)
        } else if current >= thresholds.gas_medium {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            let baseline_value = baseline
                .metric(&thresholds.gas_metric)
                .map(|s| s.mean)
                .unwrap_or(0.0);
            evidence.push(TriggerEvidence {
                metric: thresholds.gas_metric.clone(),
                severity,
                current_value: current,
                baseline_value,
                z_score: None,
                reason: format!("gas price {:.0} crosses congestion band", current),
            });
        }
    }

    // 4. Sentiment, when the collector has a recent summary
    if let Some(s) = sentiment {
        let severity = if s.negative_share >= thresholds.sentiment_negative_share_high
            || s.avg_score <= thresholds.sentiment_score_high
        {
            Some(Severity::High)
        } else if s.negative_share >= thresholds.sentiment_negative_share_medium
            || s.avg_score <= thresholds.sentiment_score_medium
        {
            Some(Severity::Medium)
        } else {
            None
        };
        if let Some(severity) = severity {
            evidence.push(TriggerEvidence {
                metric: "sentiment".to_string(),
                severity,
                current_value: s.avg_score,
                baseline_value: 0.0,
                z_score: None,
                reason: format!(
                    "sentiment mean {:.2} with {:.0}% negative across {} samples",
                    s.avg_score,
                    s.negative_share * 100.0,
                    s.total_samples
                ),
            });
        }
    }

    // 5. Correlation bonus: multi-signal co-movement outranks any single
    //    metric's own tier. Requires two distinct trigger metrics.
    let distinct: HashSet<&str> = evidence.iter().map(|e| e.metric.as_str()).collect();
    let correlation_fired = distinct.len() >= 2;
    if correlation_fired {
        let involved: Vec<&str> = {
            let mut v: Vec<&str> = distinct.iter().copied().collect();
            v.sort_unstable();
            v
        };
        evidence.push(TriggerEvidence {
            metric: "correlation".to_string(),
            severity: Severity::High,
            current_value: distinct.len() as f64,
            baseline_value: 0.0,
            z_score: None,
            reason: format!("correlated anomalies across {}", involved.join(", ")),
        });
    }

    let max_severity = evidence.iter().map(|e| e.severity).max();
    let is_anomalous = !evidence.is_empty();
    let escalation_recommended =
        is_anomalous && (max_severity >= Some(Severity::High) || correlation_fired);

    Trigger {
        id: Uuid::new_v4(),
        created_at: snapshot.taken_at,
        is_anomalous,
        escalation_recommended,
        evidence,
        max_severity,
        baseline: baseline.clone(),
        finding_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::MetricStats;
    use chrono::Utc;
    use std::collections::HashMap;

    fn baseline_with(entries: &[(&str, f64, f64)]) -> BaselineStatistics {
        let mut metrics = HashMap::new();
        for (name, mean, std_dev) in entries {
            metrics.insert(
                name.to_string(),
                MetricStats {
                    mean: *mean,
                    std_dev: *std_dev,
                    min: mean - std_dev,
                    max: mean + std_dev,
                    median: *mean,
                    sample_count: 100,
                },
            );
        }
        BaselineStatistics {
            metrics,
            window_days: 7,
            snapshot_count: 100,
            computed_at: Utc::now(),
            stale: false,
        }
    }

    fn snapshot_with(entries: &[(&str, f64)]) -> Snapshot {
        Snapshot {
            taken_at: Utc::now(),
            source: "rpc".to_string(),
            success: true,
            metrics: entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    #[test]
    fn test_peg_critical_band() {
        // Peg 0.987 is 1.3% off target: CRITICAL regardless of the tight
        // historical baseline.
        let baseline = baseline_with(&[("peg_ratio", 1.0, 0.00005)]);
        let snapshot = snapshot_with(&[("peg_ratio", 0.987)]);

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        assert!(trigger.is_anomalous);
        assert!(trigger.escalation_recommended);
        assert_eq!(trigger.max_severity, Some(Severity::Critical));
        let peg = trigger
            .evidence
            .iter()
            .find(|e| e.metric == "peg_ratio")
            .unwrap();
        assert_eq!(peg.severity, Severity::Critical);
        assert_eq!(peg.z_score, None);
    }

    #[test]
    fn test_tvl_z_score_high_band() {
        let baseline = baseline_with(&[("total_value_locked", 1_000_000.0, 50_000.0)]);
        let snapshot = snapshot_with(&[("total_value_locked", 1_140_000.0)]);

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        assert_eq!(trigger.evidence.len(), 1);
        let tvl = &trigger.evidence[0];
        assert!((tvl.z_score.unwrap() - 2.8).abs() < 1e-9);
        assert_eq!(tvl.severity, Severity::High);
        assert!(trigger.escalation_recommended);
    }

    #[test]
    fn test_calm_cycle_still_produces_trigger() {
        let baseline = baseline_with(&[
            ("total_value_locked", 1_000_000.0, 50_000.0),
            ("peg_ratio", 1.0, 0.0001),
            ("gas_price", 40.0, 10.0),
        ]);
        let snapshot = snapshot_with(&[
            ("total_value_locked", 1_020_000.0), // z = 0.4
            ("peg_ratio", 1.0002),
            ("gas_price", 5.0),
        ]);

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        assert!(!trigger.is_anomalous);
        assert!(!trigger.escalation_recommended);
        assert!(trigger.evidence.is_empty());
        assert_eq!(trigger.max_severity, None);
    }

    #[test]
    fn test_correlation_bonus_overrides_medium() {
        // Two independent MEDIUMs on distinct metrics: the correlation bonus
        // fires at HIGH and becomes the reported max severity.
        let baseline = baseline_with(&[("queue_size", 100.0, 20.0)]);
        let snapshot = snapshot_with(&[
            ("queue_size", 144.0), // z = 2.2 -> MEDIUM
            ("peg_ratio", 1.004),  // 0.4% -> MEDIUM
        ]);

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        let correlation = trigger
            .evidence
            .iter()
            .find(|e| e.metric == "correlation")
            .expect("correlation bonus");
        assert_eq!(correlation.severity, Severity::High);
        assert_eq!(trigger.max_severity, Some(Severity::High));
        assert!(trigger.escalation_recommended);
    }

    #[test]
    fn test_single_medium_does_not_escalate() {
        let baseline = baseline_with(&[("queue_size", 100.0, 20.0)]);
        let snapshot = snapshot_with(&[("queue_size", 144.0)]); // z = 2.2

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        assert!(trigger.is_anomalous);
        assert_eq!(trigger.max_severity, Some(Severity::Medium));
        assert!(!trigger.escalation_recommended);
    }

    #[test]
    fn test_flat_baseline_z_is_zero() {
        let baseline = baseline_with(&[("withdrawal_count", 10.0, 0.0)]);
        let snapshot = snapshot_with(&[("withdrawal_count", 500.0)]);

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        // std_dev = 0 defines z = 0: no division by zero, no trigger
        assert!(trigger.evidence.is_empty());
        assert_eq!(z_score(500.0, 10.0, 0.0), 0.0);
    }

    #[test]
    fn test_negative_z_score_triggers_on_magnitude() {
        // A drain is as anomalous as a spike: |z| drives the band.
        let baseline = baseline_with(&[("total_value_locked", 1_000_000.0, 50_000.0)]);
        let snapshot = snapshot_with(&[("total_value_locked", 820_000.0)]); // z = -3.6

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        assert_eq!(trigger.max_severity, Some(Severity::Critical));
        assert!(trigger.evidence[0].z_score.unwrap() < 0.0);
    }

    #[test]
    fn test_sentiment_bands() {
        let baseline = baseline_with(&[]);
        let snapshot = snapshot_with(&[]);
        let summary = SentimentSummary {
            avg_score: -0.2,
            negative_share: 0.65,
            total_samples: 40,
        };

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, Some(&summary));
        let s = trigger.evidence.iter().find(|e| e.metric == "sentiment").unwrap();
        assert_eq!(s.severity, Severity::High);
        assert!(trigger.escalation_recommended);
    }

    #[test]
    fn test_gas_alone_counts_toward_correlation() {
        // Threshold-only metrics still count as distinct trigger metrics
        // for the correlation bonus.
        let baseline = baseline_with(&[("queue_size", 100.0, 20.0)]);
        let snapshot = snapshot_with(&[
            ("gas_price", 200.0),  // MEDIUM band
            ("queue_size", 144.0), // MEDIUM band
        ]);

        let trigger = evaluate(&thresholds(), &snapshot, &baseline, None);
        assert!(trigger.evidence.iter().any(|e| e.metric == "correlation"));
        assert!(trigger.escalation_recommended);
    }

    #[test]
    fn test_escalation_implies_anomalous() {
        // Property: for any evaluated trigger, escalation_recommended
        // implies is_anomalous.
        let baselines = [
            baseline_with(&[("total_value_locked", 1_000_000.0, 50_000.0)]),
            baseline_with(&[("queue_size", 100.0, 0.0)]),
            baseline_with(&[]),
        ];
        let snapshots = [
            snapshot_with(&[("total_value_locked", 1_500_000.0)]),
            snapshot_with(&[("peg_ratio", 0.95), ("gas_price", 600.0)]),
            snapshot_with(&[]),
        ];
        for baseline in &baselines {
            for snapshot in &snapshots {
                let t = evaluate(&thresholds(), snapshot, baseline, None);
                assert!(!t.escalation_recommended || t.is_anomalous);
                // max_severity reflects the highest tier across all evidence
                if let Some(max) = t.max_severity {
                    assert!(t.evidence.iter().all(|e| e.severity <= max));
                    assert!(t.evidence.iter().any(|e| e.severity == max));
                }
            }
        }
    }
}
