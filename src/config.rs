//! Runtime configuration -- thresholds, windows, intervals.
//!
//! Every knob has a default so the daemon runs without a config file;
//! a TOML file overrides individual sections.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub baseline: BaselineConfig,
    pub thresholds: Thresholds,
    pub rate_limit: RateLimitConfig,
    pub analysis: AnalysisConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Trailing window the baseline aggregates over.
    pub window_days: u32,
    /// Cache TTL for computed baselines.
    pub ttl_secs: u64,
    /// Minimum snapshots in the window before the baseline is trusted
    /// (12 = one hour of 5-minute sampling).
    pub min_samples: u64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            ttl_secs: 300,
            min_samples: 12,
        }
    }
}

/// Pre-filter severity bands. Metric names are those the collectors emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Metrics graded by z-score against the baseline.
    pub z_metrics: Vec<String>,
    pub z_medium: f64,
    pub z_high: f64,
    pub z_critical: f64,

    /// Bounded-ratio metric, expected to sit at 1.0. Bands are absolute
    /// deviation from the target, independent of the baseline.
    pub peg_metric: String,
    pub peg_medium: f64,
    pub peg_high: f64,
    pub peg_critical: f64,

    /// Absolute-threshold metric: congestion is congestion, baseline or not.
    pub gas_metric: String,
    pub gas_medium: f64,
    pub gas_high: f64,
    pub gas_critical: f64,

    pub sentiment_hours: u32,
    pub sentiment_negative_share_medium: f64,
    pub sentiment_negative_share_high: f64,
    pub sentiment_score_medium: f64,
    pub sentiment_score_high: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            z_metrics: vec![
                "total_value_locked".to_string(),
                "queue_size".to_string(),
                "withdrawal_count".to_string(),
            ],
            z_medium: 2.0,
            z_high: 2.5,
            z_critical: 3.0,
            peg_metric: "peg_ratio".to_string(),
            peg_medium: 0.003,
            peg_high: 0.005,
            peg_critical: 0.01,
            gas_metric: "gas_price".to_string(),
            gas_medium: 150.0,
            gas_high: 300.0,
            gas_critical: 500.0,
            sentiment_hours: 6,
            sentiment_negative_share_medium: 0.4,
            sentiment_negative_share_high: 0.6,
            sentiment_score_medium: -0.3,
            sentiment_score_high: -0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum seconds between successful escalations.
    pub min_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key; never stored in the file.
    pub api_key_env: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Overall wall-clock budget for one escalation, retries included.
    pub timeout_secs: u64,
    /// Cap on raw samples included in the context document.
    pub recent_samples: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "CHAINSENTRY_API_KEY".to_string(),
            max_attempts: 3,
            base_delay_ms: 500,
            timeout_secs: 120,
            recent_samples: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Detection cycle interval.
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields defaults; a present but
    /// malformed file is a hard error.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.baseline.min_samples, 12);
        assert_eq!(c.rate_limit.min_interval_secs, 3600);
        assert!(c.thresholds.z_critical > c.thresholds.z_high);
        assert!(c.thresholds.z_high > c.thresholds.z_medium);
        assert!(c.thresholds.peg_critical > c.thresholds.peg_high);
        assert!(c.thresholds.z_metrics.contains(&"queue_size".to_string()));
    }

    #[test]
    fn test_partial_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chainsentry.toml");
        std::fs::write(
            &path,
            "[rate_limit]\nmin_interval_secs = 120\n\n[thresholds]\ngas_critical = 900.0\n",
        )
        .unwrap();

        let c = Config::load(&path).unwrap();
        assert_eq!(c.rate_limit.min_interval_secs, 120);
        assert_eq!(c.thresholds.gas_critical, 900.0);
        // Untouched sections keep defaults
        assert_eq!(c.baseline.window_days, 7);
        assert_eq!(c.analysis.max_attempts, 3);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let c = Config::load(Path::new("/nonexistent/chainsentry.toml")).unwrap();
        assert_eq!(c.scheduler.interval_secs, 300);
    }

    #[test]
    fn test_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "rate_limit = \"not a table\"").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
