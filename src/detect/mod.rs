//! Anomaly detection core -- pre-filter, orchestrator, shared types.

pub mod engine;
pub mod prefilter;

use crate::baseline::BaselineStatistics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity tiers for trigger evidence and findings.
/// Derived `Ord` gives the total order LOW < MEDIUM < HIGH < CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Parse a severity label from untrusted text.
    /// Unknown or malformed labels coerce to MEDIUM rather than failing.
    pub fn parse_lenient(s: &str) -> Severity {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" | "INFO" => Severity::Low,
            "MEDIUM" | "MODERATE" | "WARNING" => Severity::Medium,
            "HIGH" => Severity::High,
            "CRITICAL" | "SEVERE" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One abnormal observation inside a trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvidence {
    pub metric: String,
    pub severity: Severity,
    pub current_value: f64,
    pub baseline_value: f64,
    pub z_score: Option<f64>,
    pub reason: String,
}

/// Per-cycle pre-filter verdict. Persisted verbatim every cycle, anomalous
/// or not -- trigger history is itself a diagnostic artifact. The only
/// post-hoc mutation is attaching `finding_id` once an escalation produced
/// findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub is_anomalous: bool,
    pub escalation_recommended: bool,
    pub evidence: Vec<TriggerEvidence>,
    pub max_severity: Option<Severity>,
    /// The baseline the pre-filter compared against, embedded for audit.
    pub baseline: BaselineStatistics,
    pub finding_id: Option<Uuid>,
}

/// Lifecycle state of a finding. The engine only ever creates `Active`
/// findings; transitions happen elsewhere in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Active,
    Resolved,
    FalsePositive,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Active => "active",
            FindingStatus::Resolved => "resolved",
            FindingStatus::FalsePositive => "false_positive",
        }
    }

    pub fn parse(s: &str) -> FindingStatus {
        match s {
            "resolved" => FindingStatus::Resolved,
            "false_positive" => FindingStatus::FalsePositive,
            _ => FindingStatus::Active,
        }
    }
}

/// A validated anomaly description produced by deep analysis.
/// Always traces back to exactly one trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub finding_type: String,
    pub severity: Severity,
    /// Confidence in [0, 1]; out-of-range provider values are clamped.
    pub confidence: f64,
    pub title: String,
    pub description: String,
    pub affected_metrics: Vec<String>,
    pub recommendation: Option<String>,
    pub correlation_notes: Option<String>,
    pub status: FindingStatus,
}
