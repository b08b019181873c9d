//! Aggwarden command-line tool
//!
//! Initializes the metadata store and inspects rules and leases.
//!
//! # Environment Variables
//!
//! - `AGGWARDEN_DATABASE`: SQLite path or `sqlite:` URL (default: ./data/aggwarden.db)
//! - `AGGWARDEN_OWNER_ID`: lease owner identity (default: hostname-based)
//! - `AGGWARDEN_LEASE_TTL_MS`: lease lifetime (default: 30000)
//! - `AGGWARDEN_RENEWAL_INTERVAL_MS`: lease renewal period (default: 10000)
//! - `AGGWARDEN_REAP_INTERVAL_MS`: expired-lease sweep period (default: 60000)
//! - `RUST_LOG`: log level (default: info)
//!
//! # Example
//!
//! ```bash
//! export AGGWARDEN_DATABASE=./data/aggwarden.db
//! aggwarden init
//! aggwarden rules
//! aggwarden leases --owner worker-1
//! aggwarden reap --once
//! ```

use aggwarden_agent::{LeaseReaper, WorkerConfig};
use aggwarden_metadata::{
    init, AggregationRule, Clock, ExecutionLease, LeaseStore, RuleStore, SqliteMetadataStore,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "aggwarden")]
#[command(about = "Aggregation rule store and execution lease tool", long_about = None)]
struct Cli {
    /// Metadata database (overrides AGGWARDEN_DATABASE)
    #[arg(short, long)]
    database: Option<String>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create tables and indexes and migrate legacy rule documents
    Init,
    /// List active aggregation rules
    Rules,
    /// List live execution leases
    Leases {
        /// Only leases held by this owner
        #[arg(short, long)]
        owner: Option<String>,
    },
    /// Delete expired lease records
    Reap {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let mut config = WorkerConfig::from_env().context("Invalid AGGWARDEN_* configuration")?;
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    ensure_parent_dir(&config.database_url)?;

    match cli.command {
        Commands::Init => {
            let (_store, report) = init::initialize(&config.database_url)
                .await
                .context("Failed to initialize metadata store")?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("✅ {} is ready", config.database_url);
                println!("  legacy rule ids assigned: {}", report.identifiers_assigned);
                println!("  documents completed:      {}", report.documents_completed);
            }
        }
        Commands::Rules => {
            let store = open(&config.database_url).await?;
            let rules: Vec<AggregationRule> = store.list_active().try_collect().await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else {
                print_rules(&rules);
            }
        }
        Commands::Leases { owner } => {
            let store = open(&config.database_url).await?;
            let leases = store.list_leases(owner.as_deref()).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&leases)?);
            } else {
                print_leases(&leases, store.clock().now_ms());
            }
        }
        Commands::Reap { once } => {
            let store = open(&config.database_url).await?;
            let reaper = LeaseReaper::new(store, config.reap_interval());

            if once {
                let reaped = reaper.sweep_once().await?;
                println!("Reaped {} expired lease(s)", reaped);
            } else {
                info!("🚀 Lease reaper running, press Ctrl-C to stop");
                reaper.run().await;
            }
        }
    }

    Ok(())
}

async fn open(database_url: &str) -> Result<Arc<SqliteMetadataStore>> {
    let store = SqliteMetadataStore::new(database_url)
        .await
        .with_context(|| format!("Failed to open metadata store {}", database_url))?;
    Ok(Arc::new(store))
}

/// Create the directory holding a file-backed database.
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }

    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = path.split('?').next().unwrap_or(path);

    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}

fn print_rules(rules: &[AggregationRule]) {
    if rules.is_empty() {
        println!("No active rules");
        return;
    }

    println!(
        "{:<32} {:<8} {:<14} {:<24} {}",
        "RULE ID", "WINDOW", "METRIC", "GROUP BY", "TOP N"
    );
    for rule in rules {
        println!(
            "{:<32} {:<8} {:<14} {:<24} {}",
            rule.rule_id,
            rule.window_size,
            rule.metric,
            rule.group_by.join(","),
            rule.top_n
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

fn print_leases(leases: &[ExecutionLease], now_ms: i64) {
    if leases.is_empty() {
        println!("No live leases");
        return;
    }

    println!("{:<40} {:<40} {}", "KEY", "OWNER", "EXPIRES IN");
    for lease in leases {
        println!(
            "{:<40} {:<40} {}ms",
            lease.key,
            lease.owner,
            lease.expires_at - now_ms
        );
    }
}
