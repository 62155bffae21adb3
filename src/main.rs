use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "chainsentry",
    about = "Rate-limited anomaly detection and escalation for protocol metrics",
    version,
    long_about = None
)]
struct Cli {
    /// SQLite database path
    #[arg(long, default_value = "data/chainsentry.db", global = true)]
    db: String,

    /// Config file (TOML); defaults apply when missing
    #[arg(long, default_value = "chainsentry.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (detection driver + API server)
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run a single detection cycle and print the result
    Cycle {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show detection statistics for the trailing window
    Stats {
        /// Window in hours
        #[arg(long, default_value = "24")]
        hours: u32,
    },

    /// Show the current baseline statistics
    Baseline {
        /// Bypass the cache and recompute
        #[arg(long)]
        refresh: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind } => {
            tracing::info!(%bind, "Starting ChainSentry daemon");
            chainsentry::serve(&bind, &cli.db, &cli.config).await?;
        }
        Commands::Cycle { json } => {
            let pool = chainsentry::storage::open_pool(&cli.db)?;
            let config = chainsentry::config::Config::load(&cli.config)?;
            let engine = chainsentry::build_engine(pool, config)?;

            let result = engine.run_cycle().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\nChainSentry Detection Cycle");
                println!("Outcome:       {:?}", result.outcome);
                println!("Escalated:     {}", result.escalated);
                println!("Rate limited:  {}", result.rate_limited);
                if let Some(id) = result.trigger_id {
                    println!("Trigger:       {}", id);
                }
                if let Some(e) = &result.analysis_error {
                    println!("Analysis err:  {}", e);
                }
                if let Some(e) = &result.persistence_error {
                    println!("Persist err:   {}", e);
                }
                for f in &result.findings {
                    println!(
                        " - [{}] {} (confidence {:.2}): {}",
                        f.severity, f.title, f.confidence, f.description
                    );
                }
                println!();
            }
        }
        Commands::Stats { hours } => {
            let pool = chainsentry::storage::open_pool(&cli.db)?;
            let stats = chainsentry::storage::detection_stats(&pool, hours)?;

            println!("\nDetection stats (last {} hours)", hours);
            println!("Anomalous cycles:  {}", stats.anomalous_cycles);
            println!("Normal cycles:     {}", stats.normal_cycles);
            println!("Escalations:       {}", stats.escalation_count);
            match stats.last_cycle_at {
                Some(at) => println!("Last cycle:        {}", at.to_rfc3339()),
                None => println!("Last cycle:        never"),
            }
            match stats.last_escalation_at {
                Some(at) => println!("Last escalation:   {}", at.to_rfc3339()),
                None => println!("Last escalation:   never"),
            }
            println!();
        }
        Commands::Baseline { refresh } => {
            let pool = chainsentry::storage::open_pool(&cli.db)?;
            let config = chainsentry::config::Config::load(&cli.config)?;
            let window_days = config.baseline.window_days;
            let accessor = chainsentry::baseline::BaselineAccessor::new(
                pool,
                config.baseline.ttl_secs,
                config.baseline.min_samples,
            );

            match accessor.get(window_days, refresh) {
                Ok(stats) => {
                    println!(
                        "\nBaseline over {} days ({} snapshots{})",
                        stats.window_days,
                        stats.snapshot_count,
                        if stats.stale { ", STALE" } else { "" }
                    );
                    println!(
                        "{:<22} | {:>12} | {:>12} | {:>12} | {:>12} | {:>6}",
                        "Metric", "Mean", "StdDev", "Min", "Max", "N"
                    );
                    let mut names: Vec<_> = stats.metrics.keys().collect();
                    names.sort();
                    for name in names {
                        let m = &stats.metrics[name];
                        println!(
                            "{:<22} | {:>12.4} | {:>12.4} | {:>12.4} | {:>12.4} | {:>6}",
                            name, m.mean, m.std_dev, m.min, m.max, m.sample_count
                        );
                    }
                    println!();
                }
                Err(chainsentry::baseline::BaselineError::InsufficientData { needed, have }) => {
                    println!("Baseline not ready: {} of {} snapshots collected", have, needed);
                }
                Err(e) => anyhow::bail!(e),
            }
        }
    }

    Ok(())
}
