//! Context document assembly for the reasoning service.

use crate::baseline::BaselineStatistics;
use crate::detect::Trigger;
use crate::storage::Snapshot;
use std::fmt::Write;

/// Build the single structured prompt for one escalation: domain preamble,
/// baseline summary, trigger evidence, and a bounded window of recent raw
/// samples (`cap` newest, never the full history).
pub fn build_context(
    trigger: &Trigger,
    history: &[Snapshot],
    baseline: &BaselineStatistics,
    cap: usize,
) -> String {
    let mut doc = String::new();

    doc.push_str(
        "You are an on-call analyst for a DeFi protocol monitoring system. \
         The cheap statistical pre-filter flagged the current state as anomalous. \
         Investigate the evidence below and report distinct anomalies.\n\n",
    );

    let _ = writeln!(
        doc,
        "## Baseline ({} days, {} snapshots{})",
        baseline.window_days,
        baseline.snapshot_count,
        if baseline.stale { ", STALE" } else { "" }
    );
    let mut names: Vec<&String> = baseline.metrics.keys().collect();
    names.sort();
    for name in names {
        let s = &baseline.metrics[name];
        let _ = writeln!(
            doc,
            "- {}: mean={:.4} std={:.4} min={:.4} max={:.4} median={:.4} n={}",
            name, s.mean, s.std_dev, s.min, s.max, s.median, s.sample_count
        );
    }

    let _ = writeln!(
        doc,
        "\n## Trigger evidence (max severity: {})",
        trigger
            .max_severity
            .map(|s| s.as_str())
            .unwrap_or("none")
    );
    for e in &trigger.evidence {
        let z = e
            .z_score
            .map(|z| format!(" z={:.2}", z))
            .unwrap_or_default();
        let _ = writeln!(
            doc,
            "- [{}] {}: current={:.4} baseline={:.4}{} -- {}",
            e.severity, e.metric, e.current_value, e.baseline_value, z, e.reason
        );
    }

    let _ = writeln!(doc, "\n## Recent samples (newest first, capped at {})", cap);
    for snap in history.iter().take(cap) {
        let mut parts: Vec<String> = snap
            .metrics
            .iter()
            .map(|(k, v)| format!("{}={:.4}", k, v))
            .collect();
        parts.sort();
        let _ = writeln!(doc, "- {} {}", snap.taken_at.to_rfc3339(), parts.join(" "));
    }

    doc.push_str(
        "\nRespond with a single JSON object:\n\
         {\"summary\": \"...\", \"findings\": [{\"type\": \"...\", \"severity\": \
         \"LOW|MEDIUM|HIGH|CRITICAL\", \"confidence\": 0.0, \"title\": \"...\", \
         \"description\": \"...\", \"affected_metrics\": [\"...\"], \
         \"recommendation\": \"...\", \"correlation_notes\": \"...\"}]}\n\
         Report zero findings if the evidence does not support a real anomaly.\n",
    );

    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::MetricStats;
    use crate::detect::{Severity, TriggerEvidence};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_context_caps_history() {
        let mut metrics = HashMap::new();
        metrics.insert(
            "gas_price".to_string(),
            MetricStats {
                mean: 40.0,
                std_dev: 5.0,
                min: 30.0,
                max: 55.0,
                median: 40.0,
                sample_count: 100,
            },
        );
        let baseline = BaselineStatistics {
            metrics,
            window_days: 7,
            snapshot_count: 100,
            computed_at: Utc::now(),
            stale: false,
        };
        let trigger = Trigger {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            is_anomalous: true,
            escalation_recommended: true,
            evidence: vec![TriggerEvidence {
                metric: "gas_price".to_string(),
                severity: Severity::High,
                current_value: 320.0,
                baseline_value: 40.0,
                z_score: None,
                reason: "gas price 320 crosses congestion band".to_string(),
            }],
            max_severity: Some(Severity::High),
            baseline: baseline.clone(),
            finding_id: None,
        };
        let history: Vec<Snapshot> = (0..40)
            .map(|i| Snapshot {
                taken_at: Utc::now() - chrono::Duration::minutes(i * 5),
                source: "rpc".to_string(),
                success: true,
                metrics: [("gas_price".to_string(), 40.0)].into_iter().collect(),
            })
            .collect();

        let doc = build_context(&trigger, &history, &baseline, 15);
        // One line per sample under the cap, not the full history
        assert_eq!(doc.matches("gas_price=40.0000").count(), 15);
        assert!(doc.contains("max severity: HIGH"));
        assert!(doc.contains("congestion band"));
        assert!(doc.contains("\"findings\""));
    }
}
