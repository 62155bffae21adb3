//! Rate-limited detection orchestrator.
//!
//! One call to `run_cycle` walks the full pipeline: latest snapshot ->
//! baseline -> pre-filter -> trigger persisted -> (rate limit) -> deep
//! analysis -> findings persisted and broadcast. Every path returns a
//! `CycleResult`; a single bad cycle never takes the driver down.

use crate::analysis::provider::ReasoningProvider;
use crate::analysis::DeepAnalysisEngine;
use crate::baseline::{BaselineAccessor, BaselineError, BaselineStatistics};
use crate::config::Config;
use crate::detect::{prefilter, Finding};
use crate::notify::FindingNotifier;
use crate::storage::{self, DetectionStats, Pool};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No snapshot to evaluate yet.
    NoData,
    /// Baseline below the reliability floor -- warm-up, not calm.
    NotReady,
    /// Evaluated clean.
    Calm,
    /// Anomalous but not escalated (below the bar, or analysis failed).
    Anomalous,
    /// Escalation deferred by the rate limit.
    RateLimited,
    /// Deep analysis ran to completion.
    Escalated,
}

/// What one detection cycle actually did, partial successes included.
#[derive(Debug, Serialize)]
pub struct CycleResult {
    pub outcome: CycleOutcome,
    pub escalated: bool,
    pub rate_limited: bool,
    pub trigger_id: Option<Uuid>,
    pub findings: Vec<Finding>,
    pub persistence_error: Option<String>,
    pub analysis_error: Option<String>,
}

impl CycleResult {
    fn bare(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            escalated: false,
            rate_limited: false,
            trigger_id: None,
            findings: Vec::new(),
            persistence_error: None,
            analysis_error: None,
        }
    }
}

/// Cross-cycle memory for the escalation budget. Written only after a
/// successful escalation, in a single assignment under the lock.
#[derive(Debug, Default)]
struct RateLimitState {
    last_escalation_at: Option<DateTime<Utc>>,
}

pub struct DetectionEngine {
    pool: Pool,
    config: Config,
    baseline: BaselineAccessor,
    analysis: DeepAnalysisEngine,
    notifier: FindingNotifier,
    rate_limit: Mutex<RateLimitState>,
}

impl DetectionEngine {
    /// Build the engine, restoring the rate-limit state from the store so a
    /// restart does not reset the escalation budget.
    pub fn new(pool: Pool, config: Config, provider: Arc<dyn ReasoningProvider>) -> Result<Self> {
        let last_escalation_at = storage::load_last_escalation(&pool)?;
        if let Some(at) = last_escalation_at {
            info!(last_escalation_at = %at.to_rfc3339(), "Restored rate-limit state");
        }

        let baseline = BaselineAccessor::new(
            pool.clone(),
            config.baseline.ttl_secs,
            config.baseline.min_samples,
        );
        let analysis = DeepAnalysisEngine::new(pool.clone(), provider, &config.analysis);

        Ok(Self {
            pool,
            config,
            baseline,
            analysis,
            notifier: FindingNotifier::new(64),
            rate_limit: Mutex::new(RateLimitState { last_escalation_at }),
        })
    }

    pub fn notifier(&self) -> &FindingNotifier {
        &self.notifier
    }

    /// Current baseline, for the CLI and API.
    pub fn baseline_stats(
        &self,
        force_refresh: bool,
    ) -> std::result::Result<BaselineStatistics, BaselineError> {
        self.baseline.get(self.config.baseline.window_days, force_refresh)
    }

    pub fn detection_stats(&self, window_hours: u32) -> Result<DetectionStats> {
        storage::detection_stats(&self.pool, window_hours)
    }

    /// Run one detection cycle.
    pub async fn run_cycle(&self) -> CycleResult {
        let snapshot = match storage::latest_snapshot(&self.pool) {
            Ok(Some(s)) => s,
            Ok(None) => {
                info!("No snapshot to evaluate, skipping cycle");
                return CycleResult::bare(CycleOutcome::NoData);
            }
            Err(e) => {
                warn!(error = %e, "Failed to read latest snapshot");
                let mut r = CycleResult::bare(CycleOutcome::NoData);
                r.persistence_error = Some(e.to_string());
                return r;
            }
        };

        let baseline = match self.baseline.get(self.config.baseline.window_days, false) {
            Ok(b) => b,
            Err(BaselineError::InsufficientData { needed, have }) => {
                info!(needed, have, "Baseline not ready, warm-up period");
                return CycleResult::bare(CycleOutcome::NotReady);
            }
            Err(BaselineError::Store(e)) => {
                warn!(error = %e, "Baseline unavailable");
                let mut r = CycleResult::bare(CycleOutcome::NotReady);
                r.persistence_error = Some(e);
                return r;
            }
        };

        let sentiment = storage::sentiment_summary(&self.pool, self.config.thresholds.sentiment_hours)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Sentiment summary unavailable for this cycle");
                None
            });

        let trigger =
            prefilter::evaluate(&self.config.thresholds, &snapshot, &baseline, sentiment.as_ref());

        let mut result = CycleResult::bare(if trigger.is_anomalous {
            CycleOutcome::Anomalous
        } else {
            CycleOutcome::Calm
        });
        result.trigger_id = Some(trigger.id);

        // Trigger persistence happens-before any possible escalation. A
        // failed write is surfaced but does not block escalation.
        if let Err(e) = storage::persist_trigger(&self.pool, &trigger) {
            warn!(trigger = %trigger.id, error = %e,
                "Failed to persist trigger; audit trail may be incomplete");
            result.persistence_error = Some(e.to_string());
        }

        if !trigger.escalation_recommended {
            info!(
                trigger = %trigger.id,
                anomalous = trigger.is_anomalous,
                evidence = trigger.evidence.len(),
                "Cycle complete, no escalation recommended"
            );
            return result;
        }

        // The interval is measured from the last *successful* escalation.
        let now = Utc::now();
        let min_interval =
            chrono::Duration::seconds(self.config.rate_limit.min_interval_secs as i64);
        {
            let state = self.rate_limit.lock().unwrap();
            if let Some(last) = state.last_escalation_at {
                if now - last < min_interval {
                    let wait = (min_interval - (now - last)).num_seconds();
                    info!(trigger = %trigger.id, retry_in_secs = wait, "Escalation rate limited");
                    result.outcome = CycleOutcome::RateLimited;
                    result.rate_limited = true;
                    return result;
                }
            }
        }

        let history = storage::recent_snapshots(&self.pool, self.config.analysis.recent_samples)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Recent history unavailable, escalating without it");
                Vec::new()
            });

        // Overall wall-clock budget, distinct from the retry/backoff bound,
        // so a hung provider cannot stall the driver.
        let budget = Duration::from_secs(self.config.analysis.timeout_secs);
        match tokio::time::timeout(budget, self.analysis.analyze(&trigger, &history, &baseline))
            .await
        {
            Ok(Ok(findings)) => {
                let escalated_at = Utc::now();
                {
                    let mut state = self.rate_limit.lock().unwrap();
                    state.last_escalation_at = Some(escalated_at);
                }
                if let Err(e) = storage::store_last_escalation(&self.pool, escalated_at) {
                    warn!(error = %e, "Failed to persist rate-limit state");
                }
                if let Err(e) = storage::mark_trigger_escalated(&self.pool, trigger.id) {
                    warn!(trigger = %trigger.id, error = %e, "Failed to mark trigger escalated");
                }

                for finding in &findings {
                    self.notifier.notify(finding);
                }

                info!(
                    trigger = %trigger.id,
                    findings = findings.len(),
                    "Escalation complete"
                );
                result.outcome = CycleOutcome::Escalated;
                result.escalated = true;
                result.findings = findings;
            }
            Ok(Err(e)) => {
                // Rate budget intentionally preserved: the next cycle may
                // retry without waiting out a false window.
                warn!(trigger = %trigger.id, error = %e, "Deep analysis failed");
                result.analysis_error = Some(e.to_string());
            }
            Err(_) => {
                warn!(
                    trigger = %trigger.id,
                    budget_secs = self.config.analysis.timeout_secs,
                    "Deep analysis timed out"
                );
                result.analysis_error = Some(format!(
                    "deep analysis timed out after {}s",
                    self.config.analysis.timeout_secs
                ));
            }
        }

        result
    }
}
