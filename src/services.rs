//! Component wiring shared by the service binary, the API server and the CLI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregation::AggregationEngine;
use crate::alerts::AlertProcessor;
use crate::catalog::reference;
use crate::catalog::{CatalogStore, PgCatalog};
use crate::config::AppConfig;
use crate::exchange::{ExchangeRates, ExchangeService};
use crate::harvest::scrape::default_profiles;
use crate::harvest::{
    AntiBot, CardKingdomPricelist, HarvestScope, Harvester, HttpFetcher, PricelistCache, Scraper,
};
use crate::normalization::condition::ConditionMapper;
use crate::normalization::Currency;
use crate::orchestrator::{HttpVerifier, NightlyPipeline, PipelineSettings};
use crate::retry::RetryPolicy;
use crate::sync::{PokemonTcgClient, ScryfallClient, SyncMode, Synchronizer};
use crate::tasks::TaskRegistry;
use crate::util::db::Db;

#[derive(Clone)]
pub struct Services {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn CatalogStore>,
    pub synchronizer: Arc<Synchronizer>,
    pub harvester: Arc<Harvester>,
    pub aggregation: Arc<AggregationEngine>,
    pub alerts: Arc<AlertProcessor>,
    pub tasks: Arc<TaskRegistry>,
}

impl Services {
    /// Connect to Postgres and wire the production clients.
    pub async fn from_config(mut config: AppConfig) -> Result<Self> {
        if let Some(url) = config.fx_rates_url.clone() {
            let base = ExchangeRates::new(config.eur_usd_rate, config.gbp_usd_rate);
            match ExchangeService::new(&url)?.refresh(&base).await {
                Ok(rates) => {
                    config.eur_usd_rate = rates.rate(Currency::Eur).unwrap_or(config.eur_usd_rate);
                    config.gbp_usd_rate = rates.rate(Currency::Gbp).unwrap_or(config.gbp_usd_rate);
                }
                Err(e) => tracing::warn!(error = %e, "exchange rate refresh failed; keeping configured rates"),
            }
        }
        let db = Db::connect_no_migrate(&config.database_url, config.db_max_conns).await?;
        if config.auto_migrate {
            let applied = db.migrate().await?;
            tracing::info!(applied = applied.len(), "migrations applied");
        }
        let store: Arc<dyn CatalogStore> = Arc::new(PgCatalog::new(db));
        store
            .seed_reference_data()
            .await
            .context("seeding reference data")?;
        Self::build(config, store)
    }

    /// Wire every component over an existing store.
    pub fn build(config: AppConfig, store: Arc<dyn CatalogStore>) -> Result<Self> {
        let timeout_secs = config.scraping.timeout.as_secs().max(1);
        let retry = RetryPolicy {
            max_retries: config.scraping.max_retries,
            ..RetryPolicy::default()
        };

        let synchronizer = Synchronizer::new(store.clone(), retry, config.sync_batch_size)
            .with_registry(Arc::new(ScryfallClient::new(None, Some(timeout_secs))?))
            .with_registry(Arc::new(
                PokemonTcgClient::new(None, Some(timeout_secs))?
                    .with_api_key(config.pokemon_api_key.clone()),
            ));

        let antibot = Arc::new(AntiBot::from_config(&config.scraping));
        let scraper = Scraper::new(
            antibot.clone(),
            Arc::new(HttpFetcher::new(antibot)),
            ConditionMapper::with_defaults(),
        );
        let user_agent = config
            .scraping
            .user_agent
            .clone()
            .unwrap_or_else(|| concat!("GeekoriumPriceHarvester/", env!("CARGO_PKG_VERSION")).to_string());
        let mut harvester = Harvester::new(
            store.clone(),
            PricelistCache::new(&config.cache_dir, config.cache_ttl),
            scraper,
            retry,
            config.harvest_batch_size,
        )
        .with_pricelist(Arc::new(CardKingdomPricelist::new(
            None,
            Duration::from_secs(timeout_secs.max(120)),
            &user_agent,
        )?))
        .with_max_consecutive_blocks(config.scraping.max_consecutive_blocks)
        .with_rates(ExchangeRates::new(config.eur_usd_rate, config.gbp_usd_rate));
        for profile in default_profiles() {
            harvester = harvester.with_profile(profile);
        }

        let aggregation = AggregationEngine::new(store.clone(), config.price_window_days);
        let alerts = AlertProcessor::new(store.clone());
        let tasks = TaskRegistry::new(&config.log_dir);

        Ok(Self {
            config: Arc::new(config),
            store,
            synchronizer: Arc::new(synchronizer),
            harvester: Arc::new(harvester),
            aggregation: Arc::new(aggregation),
            alerts: Arc::new(alerts),
            tasks: Arc::new(tasks),
        })
    }

    /// Swap in a different synchronizer; tests use fake registries.
    pub fn with_synchronizer(mut self, synchronizer: Synchronizer) -> Self {
        self.synchronizer = Arc::new(synchronizer);
        self
    }

    pub fn with_harvester(mut self, harvester: Harvester) -> Self {
        self.harvester = Arc::new(harvester);
        self
    }

    pub fn pipeline(&self) -> Result<NightlyPipeline> {
        let settings = PipelineSettings {
            state_dir: self.config.state_dir.clone(),
            retention_days: self.config.price_retention_days,
            missing_secrets: self.config.missing_secrets(),
        };
        let pipeline = NightlyPipeline::new(
            self.store.clone(),
            self.harvester.clone(),
            self.aggregation.clone(),
            self.alerts.clone(),
            settings,
        );
        Ok(match self.config.verify_base_url.as_deref() {
            Some(base) => pipeline.with_verifier(Arc::new(HttpVerifier::new(base)?)),
            None => pipeline,
        })
    }

    /// Background catalog sync followed by an aggregate refresh.
    pub fn launch_sync(&self, game_code: &str, mode: SyncMode) -> Result<Uuid> {
        let game = crate::catalog::normalize_code(game_code);
        if self.synchronizer.registry(&game).is_none() {
            bail!("unknown game '{game}'");
        }
        let synchronizer = self.synchronizer.clone();
        let aggregation = self.aggregation.clone();
        let subject = game.clone();
        Ok(self.tasks.spawn("sync", &subject, move |ctx| async move {
            let summary = synchronizer.sync_game(&game, mode, &ctx).await?;
            ctx.info(format!(
                "sync {}: {} sets, {} skipped, {} failed, {} printings",
                summary.game,
                summary.sets_processed,
                summary.sets_skipped,
                summary.sets_failed,
                summary.printings_processed
            ));
            ctx.check_cancelled()?;
            let refreshed = aggregation.refresh_aggregates().await?;
            ctx.info(format!("{} aggregates refreshed", refreshed.aggregates_written));
            Ok(serde_json::to_value(summary)?)
        }))
    }

    pub fn launch_harvest(&self, source_code: &str, scope: HarvestScope) -> Result<Uuid> {
        let Some(source) = reference::source_by_code(source_code) else {
            bail!("unknown price source '{source_code}'");
        };
        if !self.harvester.runnable_sources().contains(&source.code) {
            bail!("price source '{}' is not configured", source.code);
        }
        let harvester = self.harvester.clone();
        let code = source.code;
        Ok(self.tasks.spawn("harvest", code, move |ctx| async move {
            let summary = harvester.run_source(code, &scope, &ctx).await?;
            Ok(serde_json::to_value(summary)?)
        }))
    }

    pub fn launch_pipeline(&self) -> Result<Uuid> {
        let pipeline = self.pipeline()?;
        Ok(self.tasks.spawn("nightly", "all", move |ctx| async move {
            let report = pipeline.run(&ctx).await?;
            Ok(serde_json::to_value(report)?)
        }))
    }

    /// Wait for a task and turn a non-completed status into an error.
    pub async fn finish(&self, id: Uuid) -> Result<Value> {
        use crate::tasks::TaskStatus;
        let Some(snapshot) = self.tasks.wait(id).await else {
            bail!("task {id} not found");
        };
        match snapshot.status {
            TaskStatus::Completed => Ok(snapshot.result.unwrap_or(Value::Null)),
            TaskStatus::Cancelled => bail!("task {id} was cancelled"),
            TaskStatus::Failed { code, message } => bail!("task {id} failed ({code}): {message}"),
            TaskStatus::Running => bail!("task {id} is still running"),
        }
    }
}
