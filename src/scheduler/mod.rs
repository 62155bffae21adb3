//! Fixed-interval detection driver.

use crate::detect::engine::{CycleOutcome, DetectionEngine};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Main detection loop. Each tick awaits the full cycle before the next one
/// can start, so cycles never overlap; a slow cycle delays the schedule
/// rather than stacking ticks.
pub async fn run_detection_loop(engine: Arc<DetectionEngine>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "Detection driver started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let result = engine.run_cycle().await;
        match result.outcome {
            CycleOutcome::NoData => info!("Cycle: no data yet"),
            CycleOutcome::NotReady => info!("Cycle: baseline warming up"),
            CycleOutcome::Calm => info!("Cycle: calm"),
            CycleOutcome::Anomalous => info!(
                trigger = ?result.trigger_id,
                analysis_error = ?result.analysis_error,
                "Cycle: anomalous, not escalated"
            ),
            CycleOutcome::RateLimited => {
                info!(trigger = ?result.trigger_id, "Cycle: escalation rate limited")
            }
            CycleOutcome::Escalated => info!(
                trigger = ?result.trigger_id,
                findings = result.findings.len(),
                "Cycle: escalated"
            ),
        }
        if let Some(e) = &result.persistence_error {
            error!(error = %e, "Cycle completed with a persistence error");
        }
    }
}
