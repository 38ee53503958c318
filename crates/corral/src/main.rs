//! Corral control plane CLI.
//!
//! Operational entry points over the core services: health, index
//! bootstrap, dashboard counters, freshness sweeps, SLA evaluation,
//! staging maintenance, catalog registration, and schema history. Results
//! print as JSON so they compose with shell tooling.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use corral_catalog::{DataCatalog, LineageService};
use corral_logging::{init_logging, LogConfig};
use corral_protocol::{AlertMessage, Notifier, NotifyOutcome};
use corral_review::PromotionEngine;
use corral_schema::SchemaRegistry;
use corral_sentinel::{FreshnessTracker, SlaMonitor};
use corral_store::{Store, StoreUrl};

/// CLI sink: alerts surface on the log stream instead of a chat channel.
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: AlertMessage) -> NotifyOutcome {
        tracing::warn!(
            severity = alert.severity.as_str(),
            source_id = alert.source_id.as_deref().unwrap_or("-"),
            title = %alert.title,
            "{}",
            alert.message
        );
        NotifyOutcome {
            sent: true,
            ..Default::default()
        }
    }
}

#[derive(Parser)]
#[command(name = "corral", version, about = "Corral crawler control plane")]
struct Cli {
    /// Store connection URL (memory:// or mongodb://host/db)
    #[arg(long, env = "CORRAL_DATABASE_URL", default_value = "memory://")]
    database_url: String,

    /// Verbose console logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ping the document store and report latency
    Health,
    /// Create the index set every deployment relies on
    InitIndexes,
    /// Source/crawler/execution counters
    Dashboard,
    /// Freshness operations
    Freshness {
        #[command(subcommand)]
        command: FreshnessCommand,
    },
    /// Evaluate every enabled SLA and report the non-compliant ones
    SlaEvaluate,
    /// Staging maintenance
    Staging {
        #[command(subcommand)]
        command: StagingCommand,
    },
    /// Catalog operations
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    /// Schema registry inspection
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    /// Reap child rows whose parent source is gone
    ReapOrphans,
}

#[derive(Subcommand)]
enum FreshnessCommand {
    /// Evaluate one source
    Check { source_id: String },
    /// Evaluate every configured source and summarize
    Sweep,
    /// Derive configurations from observed run intervals
    AutoConfigure,
}

#[derive(Subcommand)]
enum StagingCommand {
    /// Delete promoted staging records older than the cutoff
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Per-collection staging counters
    Stats,
}

#[derive(Subcommand)]
enum CatalogCommand {
    /// Auto-register known collections as datasets
    Register,
    /// Catalog-wide counters
    Stats,
    /// Downstream impact of a dataset
    Impact { dataset_id: String },
}

#[derive(Subcommand)]
enum SchemaCommand {
    /// Version history for one source
    History {
        source_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Every source with registered schemas
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig {
        app_name: "corral",
        verbose: cli.verbose,
    })?;

    let url = StoreUrl::parse(&cli.database_url)
        .with_context(|| format!("invalid database URL: {}", cli.database_url))?;
    let store = Store::open(url).await.context("failed to open store")?;

    let output = run(cli.command, store).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(command: Command, store: Store) -> Result<serde_json::Value> {
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let value = match command {
        Command::Health => serde_json::to_value(store.health_check().await)?,
        Command::InitIndexes => {
            store.ensure_indexes().await?;
            serde_json::json!({"indexes": "created"})
        }
        Command::Dashboard => serde_json::to_value(store.dashboard_stats().await?)?,
        Command::Freshness { command } => {
            let tracker = FreshnessTracker::new(store, notifier);
            match command {
                FreshnessCommand::Check { source_id } => {
                    serde_json::to_value(tracker.check_freshness(&source_id).await?)?
                }
                FreshnessCommand::Sweep => tracker.summary().await?,
                FreshnessCommand::AutoConfigure => {
                    serde_json::to_value(tracker.auto_configure().await?)?
                }
            }
        }
        Command::SlaEvaluate => {
            let monitor = SlaMonitor::new(store, notifier);
            serde_json::to_value(monitor.evaluate_all().await?)?
        }
        Command::Staging { command } => {
            let promotion = PromotionEngine::new(store);
            match command {
                StagingCommand::Cleanup { days } => {
                    let deleted = promotion.cleanup_old_staging(days).await?;
                    serde_json::json!({"deleted": deleted, "cutoff_days": days})
                }
                StagingCommand::Stats => promotion.staging_stats(None).await?,
            }
        }
        Command::Catalog { command } => {
            let catalog = Arc::new(DataCatalog::new(store.clone()));
            match command {
                CatalogCommand::Register => {
                    let registered = catalog.register_existing_collections().await?;
                    serde_json::json!({
                        "registered": registered.iter().map(|d| d.name.clone()).collect::<Vec<_>>(),
                    })
                }
                CatalogCommand::Stats => serde_json::to_value(catalog.get_statistics().await?)?,
                CatalogCommand::Impact { dataset_id } => {
                    let lineage = LineageService::new(store, catalog);
                    serde_json::to_value(lineage.analyze_impact(&dataset_id, true, 10).await?)?
                }
            }
        }
        Command::Schema { command } => {
            let registry = SchemaRegistry::new(store);
            match command {
                SchemaCommand::History { source_id, limit } => {
                    serde_json::to_value(registry.get_version_history(&source_id, limit).await?)?
                }
                SchemaCommand::Sources => serde_json::to_value(registry.list_all_sources().await?)?,
            }
        }
        Command::ReapOrphans => serde_json::to_value(store.reap_orphans().await?)?,
    };
    Ok(value)
}
