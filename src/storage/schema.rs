//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY,
            source TEXT NOT NULL,
            success INTEGER NOT NULL DEFAULT 1,
            metrics_json TEXT NOT NULL,
            taken_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sentiment_samples (
            id INTEGER PRIMARY KEY,
            score REAL NOT NULL,
            source TEXT NOT NULL,
            taken_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS triggers (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            is_anomalous INTEGER NOT NULL,
            escalation_recommended INTEGER NOT NULL,
            escalated INTEGER NOT NULL DEFAULT 0,
            max_severity TEXT,
            evidence_json TEXT NOT NULL,
            baseline_json TEXT NOT NULL,
            finding_id TEXT
        );

        CREATE TABLE IF NOT EXISTS findings (
            id TEXT PRIMARY KEY,
            trigger_id TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            finding_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            confidence REAL NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            affected_metrics_json TEXT NOT NULL,
            recommendation TEXT,
            correlation_notes TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            FOREIGN KEY (trigger_id) REFERENCES triggers(id)
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_taken ON snapshots(taken_at);
        CREATE INDEX IF NOT EXISTS idx_sentiment_taken ON sentiment_samples(taken_at);
        CREATE INDEX IF NOT EXISTS idx_triggers_created ON triggers(created_at);
        CREATE INDEX IF NOT EXISTS idx_findings_detected ON findings(detected_at);
        CREATE INDEX IF NOT EXISTS idx_findings_trigger ON findings(trigger_id);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM triggers", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM findings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
