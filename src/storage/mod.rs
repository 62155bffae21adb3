//! SQLite storage layer -- schema, queries, migrations.
//!
//! Collectors write `snapshots` and `sentiment_samples` rows from outside the
//! process; the detection engine only ever reads them. Triggers and findings
//! are owned by the engine.

pub mod schema;

use crate::detect::{Finding, FindingStatus, Severity, Trigger, TriggerEvidence};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// One timestamped reading of all tracked metrics, as produced by the
/// external collectors. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub source: String,
    pub success: bool,
    pub metrics: HashMap<String, f64>,
}

impl Snapshot {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Rolling summary of recent social-sentiment samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSummary {
    pub avg_score: f64,
    pub negative_share: f64,
    pub total_samples: u64,
}

/// Operational counters for dashboards, aggregated over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionStats {
    pub anomalous_cycles: u64,
    pub normal_cycles: u64,
    pub escalation_count: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_escalation_at: Option<DateTime<Utc>>,
}

/// Save a collector snapshot. Exposed for the collector boundary and tests.
pub fn insert_snapshot(pool: &Pool, s: &Snapshot) -> Result<()> {
    let conn = pool.get()?;
    let metrics_json = serde_json::to_string(&s.metrics)?;
    conn.execute(
        "INSERT INTO snapshots (source, success, metrics_json, taken_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            s.source,
            s.success as i64,
            metrics_json,
            s.taken_at.to_rfc3339()
        ],
    )
    .context("Failed to insert snapshot")?;
    Ok(())
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn build_snapshot(source: String, success: i64, metrics_json: &str, taken_at: &str) -> Snapshot {
    Snapshot {
        taken_at: parse_ts(taken_at),
        source,
        success: success != 0,
        metrics: serde_json::from_str(metrics_json).unwrap_or_default(),
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Most recent snapshot regardless of success flag, or None if the
/// collectors have not produced anything yet.
pub fn latest_snapshot(pool: &Pool) -> Result<Option<Snapshot>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT source, success, metrics_json, taken_at FROM snapshots
         ORDER BY taken_at DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([], snapshot_from_row)?;
    match rows.next() {
        Some(r) => {
            let (source, success, metrics_json, taken_at) = r?;
            Ok(Some(build_snapshot(source, success, &metrics_json, &taken_at)))
        }
        None => Ok(None),
    }
}

/// All successful snapshots taken at or after `since`, oldest first.
pub fn snapshots_since(pool: &Pool, since: DateTime<Utc>) -> Result<Vec<Snapshot>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT source, success, metrics_json, taken_at FROM snapshots
         WHERE success = 1 AND taken_at >= ?1
         ORDER BY taken_at ASC",
    )?;
    let rows = stmt.query_map(params![since.to_rfc3339()], snapshot_from_row)?;

    let mut out = Vec::new();
    for r in rows {
        let (source, success, metrics_json, taken_at) = r?;
        out.push(build_snapshot(source, success, &metrics_json, &taken_at));
    }
    Ok(out)
}

/// The `count` most recent successful snapshots, newest first.
pub fn recent_snapshots(pool: &Pool, count: usize) -> Result<Vec<Snapshot>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT source, success, metrics_json, taken_at FROM snapshots
         WHERE success = 1
         ORDER BY taken_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([count], snapshot_from_row)?;

    let mut out = Vec::new();
    for r in rows {
        let (source, success, metrics_json, taken_at) = r?;
        out.push(build_snapshot(source, success, &metrics_json, &taken_at));
    }
    Ok(out)
}

/// Save a raw sentiment sample (collector boundary / tests).
pub fn insert_sentiment_sample(
    pool: &Pool,
    score: f64,
    source: &str,
    taken_at: DateTime<Utc>,
) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO sentiment_samples (score, source, taken_at) VALUES (?1, ?2, ?3)",
        params![score, source, taken_at.to_rfc3339()],
    )?;
    Ok(())
}

/// Summarize sentiment samples over the trailing window.
/// Scores below -0.1 count as negative. None when the window is empty.
pub fn sentiment_summary(pool: &Pool, hours: u32) -> Result<Option<SentimentSummary>> {
    let conn = pool.get()?;
    let since = (Utc::now() - chrono::Duration::hours(hours as i64)).to_rfc3339();
    let (total, avg, negative): (u64, Option<f64>, u64) = conn.query_row(
        "SELECT COUNT(*), AVG(score), SUM(CASE WHEN score < -0.1 THEN 1 ELSE 0 END)
         FROM sentiment_samples WHERE taken_at >= ?1",
        params![since],
        |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get(1)?,
                row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
            ))
        },
    )?;

    if total == 0 {
        return Ok(None);
    }
    Ok(Some(SentimentSummary {
        avg_score: avg.unwrap_or(0.0),
        negative_share: negative as f64 / total as f64,
        total_samples: total,
    }))
}

/// Persist a trigger record verbatim. Returns the trigger id.
pub fn persist_trigger(pool: &Pool, t: &Trigger) -> Result<Uuid> {
    let conn = pool.get()?;
    let evidence_json = serde_json::to_string(&t.evidence)?;
    let baseline_json = serde_json::to_string(&t.baseline)?;
    conn.execute(
        "INSERT INTO triggers (id, created_at, is_anomalous, escalation_recommended,
                               max_severity, evidence_json, baseline_json, finding_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            t.id.to_string(),
            t.created_at.to_rfc3339(),
            t.is_anomalous as i64,
            t.escalation_recommended as i64,
            t.max_severity.map(|s| s.as_str()),
            evidence_json,
            baseline_json,
            t.finding_id.map(|id| id.to_string()),
        ],
    )
    .context("Failed to insert trigger")?;
    Ok(t.id)
}

fn trigger_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trigger> {
    let id_str: String = row.get(0)?;
    let created_at: String = row.get(1)?;
    let is_anomalous: i64 = row.get(2)?;
    let escalation_recommended: i64 = row.get(3)?;
    let max_severity: Option<String> = row.get(4)?;
    let evidence_json: String = row.get(5)?;
    let baseline_json: String = row.get(6)?;
    let finding_id: Option<String> = row.get(7)?;

    let evidence: Vec<TriggerEvidence> =
        serde_json::from_str(&evidence_json).unwrap_or_default();
    let baseline = serde_json::from_str(&baseline_json).unwrap_or_default();

    Ok(Trigger {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        is_anomalous: is_anomalous != 0,
        escalation_recommended: escalation_recommended != 0,
        evidence,
        max_severity: max_severity.as_deref().map(Severity::parse_lenient),
        baseline,
        finding_id: finding_id.and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

const TRIGGER_COLS: &str =
    "id, created_at, is_anomalous, escalation_recommended, max_severity,
     evidence_json, baseline_json, finding_id";

pub fn get_trigger(pool: &Pool, id: Uuid) -> Result<Option<Trigger>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {TRIGGER_COLS} FROM triggers WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(params![id.to_string()], trigger_from_row)?;
    match rows.next() {
        Some(r) => Ok(Some(r?)),
        None => Ok(None),
    }
}

pub fn recent_triggers(pool: &Pool, limit: usize) -> Result<Vec<Trigger>> {
    let conn = pool.get()?;
    let sql = format!("SELECT {TRIGGER_COLS} FROM triggers ORDER BY created_at DESC LIMIT ?1");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit], trigger_from_row)?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Persist a validated finding. Returns the finding id.
pub fn persist_finding(pool: &Pool, f: &Finding) -> Result<Uuid> {
    let conn = pool.get()?;
    let affected_json = serde_json::to_string(&f.affected_metrics)?;
    conn.execute(
        "INSERT INTO findings (id, trigger_id, detected_at, finding_type, severity,
                               confidence, title, description, affected_metrics_json,
                               recommendation, correlation_notes, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            f.id.to_string(),
            f.trigger_id.to_string(),
            f.detected_at.to_rfc3339(),
            f.finding_type,
            f.severity.as_str(),
            f.confidence,
            f.title,
            f.description,
            affected_json,
            f.recommendation,
            f.correlation_notes,
            f.status.as_str(),
        ],
    )
    .context("Failed to insert finding")?;
    Ok(f.id)
}

fn finding_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Finding> {
    let id_str: String = row.get(0)?;
    let trigger_str: String = row.get(1)?;
    let detected_at: String = row.get(2)?;
    let severity: String = row.get(4)?;
    let affected_json: String = row.get(8)?;
    let status: String = row.get(11)?;

    Ok(Finding {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        trigger_id: Uuid::parse_str(&trigger_str).unwrap_or_default(),
        detected_at: parse_ts(&detected_at),
        finding_type: row.get(3)?,
        severity: Severity::parse_lenient(&severity),
        confidence: row.get(5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        affected_metrics: serde_json::from_str(&affected_json).unwrap_or_default(),
        recommendation: row.get(9)?,
        correlation_notes: row.get(10)?,
        status: FindingStatus::parse(&status),
    })
}

pub fn recent_findings(pool: &Pool, limit: usize) -> Result<Vec<Finding>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, trigger_id, detected_at, finding_type, severity, confidence,
                title, description, affected_metrics_json, recommendation,
                correlation_notes, status
         FROM findings ORDER BY detected_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], finding_from_row)?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// Attach the back-reference from a trigger to the first finding it produced.
pub fn link_finding_to_trigger(pool: &Pool, trigger_id: Uuid, finding_id: Uuid) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE triggers SET finding_id = ?1 WHERE id = ?2",
        params![finding_id.to_string(), trigger_id.to_string()],
    )?;
    Ok(())
}

/// Record that a trigger's escalation actually ran to completion.
pub fn mark_trigger_escalated(pool: &Pool, trigger_id: Uuid) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE triggers SET escalated = 1 WHERE id = ?1",
        params![trigger_id.to_string()],
    )?;
    Ok(())
}

const META_LAST_ESCALATION: &str = "last_escalation_at";

/// Durable mirror of the rate-limit state so a restart does not forget
/// the escalation budget.
pub fn load_last_escalation(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let conn = pool.get()?;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![META_LAST_ESCALATION],
            |row| row.get(0),
        )
        .ok();
    Ok(value.map(|s| parse_ts(&s)))
}

pub fn store_last_escalation(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO meta (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![META_LAST_ESCALATION, at.to_rfc3339()],
    )?;
    Ok(())
}

/// Aggregate trigger history for operational dashboards.
pub fn detection_stats(pool: &Pool, window_hours: u32) -> Result<DetectionStats> {
    let conn = pool.get()?;
    let since = (Utc::now() - chrono::Duration::hours(window_hours as i64)).to_rfc3339();

    let (anomalous, normal, escalations, last_cycle): (u64, u64, u64, Option<String>) = conn
        .query_row(
            "SELECT
                SUM(CASE WHEN is_anomalous = 1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN is_anomalous = 0 THEN 1 ELSE 0 END),
                SUM(CASE WHEN escalated = 1 THEN 1 ELSE 0 END),
                MAX(created_at)
             FROM triggers WHERE created_at >= ?1",
            params![since],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u64,
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                    row.get(3)?,
                ))
            },
        )?;

    Ok(DetectionStats {
        anomalous_cycles: anomalous,
        normal_cycles: normal,
        escalation_count: escalations,
        last_cycle_at: last_cycle.map(|s| parse_ts(&s)),
        last_escalation_at: load_last_escalation(pool)?,
    })
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Pool over a unique temp file DB, migrated. The TempDir must stay alive
    /// for the duration of the test.
    pub fn temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chainsentry-test.db");
        let pool = open_pool(path.to_str().unwrap()).expect("open pool");
        (dir, pool)
    }
}
