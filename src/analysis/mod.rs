//! Deep analysis -- escalate a trigger to the external reasoning service.
//!
//! The service boundary is untrusted: responses may arrive fenced in
//! markdown, wrapped in prose, or structurally malformed. Candidates are
//! validated one by one; a bad candidate is rejected with a reason while
//! the rest of the batch survives.

pub mod context;
pub mod provider;

use crate::baseline::BaselineStatistics;
use crate::config::AnalysisConfig;
use crate::detect::{Finding, FindingStatus, Severity, Trigger};
use crate::storage::{self, Pool, Snapshot};
use chrono::Utc;
use self::provider::ReasoningProvider;
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("reasoning service exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("reasoning service returned an unusable response")]
    UnusableResponse,
}

/// Per-candidate validation outcome.
pub enum Validated {
    Accepted(Box<Finding>),
    Rejected { reason: String },
}

pub struct DeepAnalysisEngine {
    pool: Pool,
    provider: Arc<dyn ReasoningProvider>,
    max_attempts: u32,
    base_delay: Duration,
    recent_samples: usize,
}

impl DeepAnalysisEngine {
    pub fn new(pool: Pool, provider: Arc<dyn ReasoningProvider>, cfg: &AnalysisConfig) -> Self {
        Self {
            pool,
            provider,
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            recent_samples: cfg.recent_samples,
        }
    }

    /// Run one escalation: build the context document, call the service with
    /// bounded retries, validate the candidates, persist the survivors, and
    /// link the first finding back onto the trigger.
    pub async fn analyze(
        &self,
        trigger: &Trigger,
        history: &[Snapshot],
        baseline: &BaselineStatistics,
    ) -> Result<Vec<Finding>, AnalysisError> {
        let prompt = context::build_context(trigger, history, baseline, self.recent_samples);
        let raw = self.call_with_retry(trigger.id, &prompt).await?;

        let value = extract_json(&raw).ok_or(AnalysisError::UnusableResponse)?;
        let candidates = match findings_array(&value) {
            Some(c) => c,
            None => {
                warn!(trigger = %trigger.id, "Response parsed but carried no findings array");
                return Err(AnalysisError::UnusableResponse);
            }
        };

        let now = Utc::now();
        let mut findings = Vec::new();
        for (idx, candidate) in candidates.iter().enumerate() {
            match validate_candidate(candidate, trigger, now) {
                Validated::Accepted(finding) => {
                    // Best effort per candidate: one failed write should not
                    // discard the rest of the batch.
                    match storage::persist_finding(&self.pool, &finding) {
                        Ok(_) => findings.push(*finding),
                        Err(e) => {
                            warn!(trigger = %trigger.id, index = idx, error = %e,
                                "Failed to persist finding")
                        }
                    }
                }
                Validated::Rejected { reason } => {
                    warn!(trigger = %trigger.id, index = idx, %reason, "Rejected candidate finding");
                }
            }
        }

        if let Some(first) = findings.first() {
            if let Err(e) = storage::link_finding_to_trigger(&self.pool, trigger.id, first.id) {
                warn!(trigger = %trigger.id, error = %e, "Failed to link finding to trigger");
            }
        }

        info!(
            trigger = %trigger.id,
            accepted = findings.len(),
            candidates = candidates.len(),
            "Deep analysis complete"
        );
        Ok(findings)
    }

    /// Explicit retry loop with attempt counter and exponential backoff.
    async fn call_with_retry(
        &self,
        trigger_id: Uuid,
        prompt: &str,
    ) -> Result<String, AnalysisError> {
        let mut delay = self.base_delay;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.provider.complete(prompt).await {
                Ok(raw) => {
                    debug!(trigger = %trigger_id, attempt, "Reasoning call succeeded");
                    return Ok(raw);
                }
                Err(e) => {
                    warn!(trigger = %trigger_id, attempt, error = %e, "Reasoning call failed");
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        let jitter_ms = rand::thread_rng()
                            .gen_range(0..=(delay.as_millis() as u64 / 4).max(1));
                        tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(AnalysisError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}

/// Pull the first JSON document out of a possibly decorated payload
/// (markdown fences, surrounding prose, raw JSON all tolerated).
fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// The findings array, whether the payload is `{"findings": [...]}` or a
/// bare array.
fn findings_array(value: &Value) -> Option<Vec<Value>> {
    if let Some(arr) = value.as_array() {
        return Some(arr.clone());
    }
    value.get("findings")?.as_array().cloned()
}

/// Validate one candidate into a finding. Missing required fields reject
/// the candidate; malformed severity coerces to MEDIUM and confidence is
/// clamped into [0, 1].
fn validate_candidate(
    value: &Value,
    trigger: &Trigger,
    detected_at: chrono::DateTime<Utc>,
) -> Validated {
    let Some(obj) = value.as_object() else {
        return Validated::Rejected {
            reason: "candidate is not an object".to_string(),
        };
    };

    let required = |key: &str| -> Option<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let Some(finding_type) = required("type") else {
        return Validated::Rejected {
            reason: "missing required field: type".to_string(),
        };
    };
    let Some(title) = required("title") else {
        return Validated::Rejected {
            reason: "missing required field: title".to_string(),
        };
    };
    let Some(description) = required("description") else {
        return Validated::Rejected {
            reason: "missing required field: description".to_string(),
        };
    };

    let severity = obj
        .get("severity")
        .and_then(|v| v.as_str())
        .map(Severity::parse_lenient)
        .unwrap_or(Severity::Medium);

    let confidence = obj
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    let affected_metrics: Vec<String> = obj
        .get("affected_metrics")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        // Fall back to the metrics the trigger itself implicated
        .unwrap_or_else(|| trigger.evidence.iter().map(|e| e.metric.clone()).collect());

    Validated::Accepted(Box::new(Finding {
        id: Uuid::new_v4(),
        trigger_id: trigger.id,
        detected_at,
        finding_type,
        severity,
        confidence,
        title,
        description,
        affected_metrics,
        recommendation: required("recommendation"),
        correlation_notes: required("correlation_notes"),
        status: FindingStatus::Active,
    }))
}
