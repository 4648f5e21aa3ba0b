use anyhow::{bail, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use geekorium_core::aggregation::AggregationEngine;
use geekorium_core::catalog::{CatalogStore, PgCatalog};
use geekorium_core::harvest::HarvestScope;
use geekorium_core::sync::SyncMode;
use geekorium_core::tasks::TaskContext;
use geekorium_core::util::db::Db;
use geekorium_core::{AppConfig, Services};
use serde_json::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tcgctl", version, about = "Geekorium catalog operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Apply pending ./migrations files
    Migrate,
    /// Insert games, conditions and price sources
    Seed,
    /// Sync sets, cards and printings of one game from its registry
    Sync {
        #[arg(long)]
        game: String,
        /// Only sets released in the last N days
        #[arg(long)]
        recent_days: Option<u32>,
    },
    /// Harvest prices from one source
    Harvest {
        #[arg(long)]
        source: String,
        /// Only printings without an observation from this source in the last H hours
        #[arg(long, conflicts_with = "printing")]
        stale_hours: Option<i64>,
        /// Explicit printing ids (repeatable)
        #[arg(long)]
        printing: Vec<String>,
    },
    /// Recompute aggregated prices and refresh the catalog view
    Aggregate {
        #[arg(long)]
        window_days: Option<u32>,
    },
    /// Evaluate active price alerts
    Alerts,
    /// Run the full nightly pipeline once
    Nightly,
    /// Print row counts for the catalog tables
    Counts,
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    geekorium_core::util::env::init_env();
    let _ = geekorium_core::tracing::init_tracing(geekorium_core::tracing::DEFAULT_FILTER);
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Migrate => {
            let db = Db::connect_no_migrate(&config.database_url, config.db_max_conns).await?;
            let applied = db.migrate().await?;
            info!(?applied, "migrate: done");
        }
        Commands::Seed => {
            let db = Db::connect_no_migrate(&config.database_url, config.db_max_conns).await?;
            PgCatalog::new(db).seed_reference_data().await?;
            info!("seed: reference data in place");
        }
        Commands::Sync { game, recent_days } => {
            let services = Services::from_config(config).await?;
            let mode = match recent_days {
                Some(days) if days > 0 => SyncMode::Recent(days),
                _ => SyncMode::Full,
            };
            let id = services.launch_sync(&game, mode)?;
            print_json(&services.finish(id).await?);
        }
        Commands::Harvest {
            source,
            stale_hours,
            printing,
        } => {
            let scope = match (stale_hours, printing.is_empty()) {
                (Some(h), _) if h <= 0 => bail!("--stale-hours must be positive"),
                (Some(h), _) => HarvestScope::Stale(Duration::hours(h)),
                (None, false) => HarvestScope::Printings(printing),
                (None, true) => HarvestScope::All,
            };
            let services = Services::from_config(config).await?;
            let id = services.launch_harvest(&source, scope)?;
            print_json(&services.finish(id).await?);
        }
        Commands::Aggregate { window_days } => {
            let services = Services::from_config(config).await?;
            let days = window_days.unwrap_or(services.config.price_window_days).max(1);
            let summary = AggregationEngine::new(services.store.clone(), days)
                .refresh_aggregates()
                .await?;
            print_json(&serde_json::to_value(summary)?);
        }
        Commands::Alerts => {
            let services = Services::from_config(config).await?;
            let summary = services.alerts.process(&TaskContext::detached("alerts")).await?;
            print_json(&serde_json::to_value(summary)?);
        }
        Commands::Nightly => {
            let services = Services::from_config(config).await?;
            let id = services.launch_pipeline()?;
            print_json(&services.finish(id).await?);
        }
        Commands::Counts => {
            let db = Db::connect_no_migrate(&config.database_url, config.db_max_conns).await?;
            let stats = PgCatalog::new(db).stats().await?;
            print_json(&serde_json::to_value(stats)?);
        }
    }
    Ok(())
}
