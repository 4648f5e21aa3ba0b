//! Price harvester: bulk pricelists, scraped listings and the in-house
//! inventory, all landing in `price_history`.

pub mod antibot;
pub mod bulk;
pub mod cache;
pub mod incremental;
pub mod internal;
pub mod quality;
pub mod scrape;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::instrument;

use crate::catalog::reference::{self, SOURCE_SCRYFALL};
use crate::catalog::{
    dedupe_observations, CatalogStore, Condition, PriceObservation, PrintingRef, PrintingRefQuery,
    SourceKind,
};
use crate::exchange::ExchangeRates;
use crate::normalization::variant;
use crate::retry::{retry_async, RetryPolicy};
use crate::tasks::TaskContext;

pub use antibot::AntiBot;
pub use bulk::{BulkRow, CardKingdomPricelist, PricelistProvider};
pub use cache::PricelistCache;
pub use incremental::LastUpdatedCache;
pub use quality::{OutlierDetector, ValidationError};
pub use scrape::{HttpFetcher, PageFetcher, ScrapeFailure, ScrapeProfile, Scraper};
pub use worker::{HarvestReport, ProviderWorker, SourceWorker, WorkerManager};

/// Outlier baseline window.
const BASELINE_DAYS: i64 = 30;

/// Which printings a run refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HarvestScope {
    #[default]
    All,
    Printings(Vec<String>),
    Game(String),
    /// Printings without an observation from this source in the given span.
    Stale(Duration),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestSummary {
    pub source: String,
    pub considered: u64,
    pub matched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
    pub outliers: u64,
    pub failed: u64,
    pub captcha_hits: u64,
    pub block_hits: u64,
    pub skipped_recent: u64,
    /// Stopped early after repeated block responses.
    pub aborted: bool,
}

impl HarvestSummary {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }
}

pub struct Harvester {
    store: Arc<dyn CatalogStore>,
    cache: PricelistCache,
    scraper: Scraper,
    pricelists: HashMap<String, Arc<dyn PricelistProvider>>,
    profiles: HashMap<String, ScrapeProfile>,
    outliers: OutlierDetector,
    last_updated: LastUpdatedCache,
    retry: RetryPolicy,
    batch_size: usize,
    max_consecutive_blocks: u32,
    rates: ExchangeRates,
}

impl Harvester {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        cache: PricelistCache,
        scraper: Scraper,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            cache,
            scraper,
            pricelists: HashMap::new(),
            profiles: HashMap::new(),
            outliers: OutlierDetector::default(),
            last_updated: LastUpdatedCache::default(),
            retry,
            batch_size: batch_size.max(1),
            max_consecutive_blocks: 5,
            rates: ExchangeRates::default(),
        }
    }

    pub fn with_pricelist(mut self, provider: Arc<dyn PricelistProvider>) -> Self {
        self.pricelists
            .insert(provider.source_code().to_ascii_lowercase(), provider);
        self
    }

    pub fn with_profile(mut self, profile: ScrapeProfile) -> Self {
        self.profiles.insert(profile.source_code.to_string(), profile);
        self
    }

    pub fn with_last_updated(mut self, cache: LastUpdatedCache) -> Self {
        self.last_updated = cache;
        self
    }

    /// Zero disables the early stop.
    pub fn with_max_consecutive_blocks(mut self, n: u32) -> Self {
        self.max_consecutive_blocks = n;
        self
    }

    pub fn with_rates(mut self, rates: ExchangeRates) -> Self {
        self.rates = rates;
        self
    }

    pub fn rates(&self) -> &ExchangeRates {
        &self.rates
    }

    /// Source codes this harvester can run, in seed order.
    pub fn runnable_sources(&self) -> Vec<&'static str> {
        reference::SOURCES
            .iter()
            .filter(|s| match s.kind {
                SourceKind::Bulk => s.code == SOURCE_SCRYFALL || self.pricelists.contains_key(s.code),
                SourceKind::Scrape => self.profiles.contains_key(s.code),
                SourceKind::Internal => true,
            })
            .map(|s| s.code)
            .collect()
    }

    /// Runnable sources the nightly run may sweep whole: bulk and internal.
    /// Page scrapes stay on demand with an explicit scope.
    pub fn nightly_sources(&self) -> Vec<&'static str> {
        self.runnable_sources()
            .into_iter()
            .filter(|code| {
                reference::source_by_code(code).is_some_and(|s| s.kind != SourceKind::Scrape)
            })
            .collect()
    }

    /// Refresh prices for one source over `scope`.
    #[instrument(skip(self, ctx), fields(source = %source_code, task_id = ?ctx.task_id()))]
    pub async fn run_source(
        &self,
        source_code: &str,
        scope: &HarvestScope,
        ctx: &TaskContext,
    ) -> Result<HarvestSummary> {
        let Some(source) = reference::source_by_code(source_code) else {
            bail!("unknown price source '{source_code}'");
        };
        let mut summary = HarvestSummary::new(source.code);
        ctx.info(format!("harvest {} ({:?}) starting", source.code, scope));
        match source.kind {
            SourceKind::Bulk if source.code == SOURCE_SCRYFALL => {
                self.run_snapshot(source.id, scope, ctx, &mut summary).await?
            }
            SourceKind::Bulk => {
                let Some(provider) = self.pricelists.get(source.code).cloned() else {
                    bail!("no pricelist provider configured for '{}'", source.code);
                };
                self.run_bulk(provider.as_ref(), source.id, scope, ctx, &mut summary)
                    .await?
            }
            SourceKind::Scrape => {
                let Some(profile) = self.profiles.get(source.code) else {
                    bail!("no scrape profile configured for '{}'", source.code);
                };
                self.run_scrape(profile, source.id, scope, ctx, &mut summary)
                    .await?
            }
            SourceKind::Internal => self.run_internal(source.id, scope, ctx, &mut summary).await?,
        }
        ctx.info(format!(
            "harvest {} done: considered {}, matched {}, inserted {}, updated {}, rejected {}, outliers {}, failed {}",
            source.code,
            summary.considered,
            summary.matched,
            summary.inserted,
            summary.updated,
            summary.rejected,
            summary.outliers,
            summary.failed
        ));
        Ok(summary)
    }

    fn query_for(&self, scope: &HarvestScope, source_id: i16) -> PrintingRefQuery {
        let mut q = PrintingRefQuery::all(self.batch_size as i64);
        match scope {
            HarvestScope::All => {}
            HarvestScope::Printings(ids) => q.ids = Some(ids.clone()),
            HarvestScope::Game(game) => q.game_code = Some(game.clone()),
            HarvestScope::Stale(span) => q.stale_for = Some((source_id, Utc::now() - *span)),
        }
        q
    }

    /// Next keyset page; advances the cursor.
    async fn next_page(&self, query: &mut PrintingRefQuery) -> Result<Vec<PrintingRef>> {
        let refs = self.store.printing_refs(query).await?;
        if let Some(last) = refs.last() {
            query.after = Some(last.printing_id.clone());
        }
        Ok(refs)
    }

    fn is_recent(&self, printing_id: &str, source_id: i16, summary: &mut HarvestSummary) -> bool {
        let fresh = self.last_updated.is_fresh(printing_id, source_id, Utc::now());
        if fresh {
            summary.skipped_recent += 1;
        }
        fresh
    }

    async fn run_bulk(
        &self,
        provider: &dyn PricelistProvider,
        source_id: i16,
        scope: &HarvestScope,
        ctx: &TaskContext,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        let code = provider.source_code().to_string();
        let bytes = match self.cache.load_fresh(&code) {
            Some(bytes) => {
                ctx.info(format!("using cached {code} pricelist ({} bytes)", bytes.len()));
                bytes
            }
            None => {
                ctx.info(format!("downloading {code} pricelist"));
                let bytes = retry_async(&self.retry, "pricelist.download", move || provider.download())
                    .await
                    .with_context(|| format!("{code} pricelist download failed"))?;
                if let Err(e) = self.cache.store(&code, &bytes) {
                    ctx.warn(format!("could not cache {code} pricelist: {e:#}"));
                }
                bytes
            }
        };
        let rows = provider
            .parse(&bytes)
            .with_context(|| format!("{code} pricelist could not be parsed"))?;
        ctx.info(format!("{} priced rows in {code} pricelist", rows.len()));
        let index = bulk::build_index(rows);

        let mut query = self.query_for(scope, source_id);
        loop {
            ctx.check_cancelled()?;
            let refs = self.next_page(&mut query).await?;
            if refs.is_empty() {
                break;
            }
            let mut batch = Vec::new();
            for r in &refs {
                summary.considered += 1;
                if self.is_recent(&r.printing_id, source_id, summary) {
                    continue;
                }
                let Some(offers) = index.get(&r.printing_id.to_ascii_lowercase()) else {
                    continue;
                };
                summary.matched += 1;
                batch.extend(
                    offers
                        .iter()
                        .map(|o| (bulk_observation(o, r, source_id), r.name.clone())),
                );
            }
            self.persist(batch, source_id, ctx, summary).await?;
        }
        Ok(())
    }

    async fn run_snapshot(
        &self,
        source_id: i16,
        scope: &HarvestScope,
        ctx: &TaskContext,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        let mut query = self.query_for(scope, source_id);
        loop {
            ctx.check_cancelled()?;
            let refs = self.next_page(&mut query).await?;
            if refs.is_empty() {
                break;
            }
            let mut batch = Vec::new();
            for r in &refs {
                summary.considered += 1;
                if self.is_recent(&r.printing_id, source_id, summary) {
                    continue;
                }
                let Some(prices) = r.prices.as_ref() else {
                    continue;
                };
                let offers = bulk::snapshot_rows(&r.printing_id, prices);
                if offers.is_empty() {
                    continue;
                }
                summary.matched += 1;
                batch.extend(
                    offers
                        .iter()
                        .map(|o| (bulk_observation(o, r, source_id), r.name.clone())),
                );
            }
            self.persist(batch, source_id, ctx, summary).await?;
        }
        Ok(())
    }

    async fn run_scrape(
        &self,
        profile: &ScrapeProfile,
        source_id: i16,
        scope: &HarvestScope,
        ctx: &TaskContext,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        let mut query = self.query_for(scope, source_id);
        let mut consecutive_blocks = 0u32;
        'pages: loop {
            ctx.check_cancelled()?;
            let refs = self.next_page(&mut query).await?;
            if refs.is_empty() {
                break;
            }
            let mut batch = Vec::new();
            for r in &refs {
                summary.considered += 1;
                if self.is_recent(&r.printing_id, source_id, summary) {
                    continue;
                }
                match self.scraper.scrape(profile, r, source_id).await {
                    Ok(obs) => {
                        consecutive_blocks = 0;
                        summary.matched += 1;
                        batch.push((obs, r.name.clone()));
                    }
                    Err(ScrapeFailure::Unsupported) => {}
                    Err(err) => {
                        summary.failed += 1;
                        match &err {
                            ScrapeFailure::Captcha(_) => {
                                summary.captcha_hits += 1;
                                consecutive_blocks += 1;
                            }
                            ScrapeFailure::Blocked(_) => {
                                summary.block_hits += 1;
                                consecutive_blocks += 1;
                            }
                            _ => {}
                        }
                        ctx.warn(format!("{} {}: {err}", profile.source_code, r.printing_id));
                    }
                }
                if self.max_consecutive_blocks > 0 && consecutive_blocks >= self.max_consecutive_blocks {
                    summary.aborted = true;
                    ctx.error(format!(
                        "{} blocked {consecutive_blocks} times in a row; stopping run",
                        profile.source_code
                    ));
                    self.persist(batch, source_id, ctx, summary).await?;
                    break 'pages;
                }
            }
            self.persist(batch, source_id, ctx, summary).await?;
        }
        Ok(())
    }

    async fn run_internal(
        &self,
        source_id: i16,
        scope: &HarvestScope,
        ctx: &TaskContext,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        let mut rows =
            internal::product_observations(self.store.as_ref(), source_id, self.batch_size as i64).await?;
        if let HarvestScope::Printings(ids) = scope {
            rows.retain(|(obs, _)| ids.contains(&obs.printing_id));
        }
        summary.considered = rows.len() as u64;
        rows.retain(|(obs, _)| !self.is_recent(&obs.printing_id, source_id, summary));
        summary.matched = rows.len() as u64;
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            ctx.check_cancelled()?;
            let chunk: Vec<_> = rows.by_ref().take(self.batch_size).collect();
            self.persist(chunk, source_id, ctx, summary).await?;
        }
        Ok(())
    }

    /// Quality gates, outlier flagging, then one upsert for the batch.
    async fn persist(
        &self,
        rows: Vec<(PriceObservation, String)>,
        source_id: i16,
        ctx: &TaskContext,
        summary: &mut HarvestSummary,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut accepted = Vec::with_capacity(rows.len());
        for (mut obs, name) in rows {
            self.rates.fill_usd(&mut obs);
            let errors = quality::validate(&obs, &name);
            if errors.is_empty() {
                accepted.push(obs);
            } else {
                summary.rejected += 1;
                let reasons: Vec<String> = errors.iter().map(ToString::to_string).collect();
                ctx.warn(format!("rejected {}: {}", obs.printing_id, reasons.join(", ")));
            }
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = accepted.iter().map(|o| o.printing_id.clone()).collect();
        let since = Utc::now().date_naive() - Duration::days(BASELINE_DAYS);
        let baselines = self.store.recent_prices(&ids, since).await?;
        for obs in &accepted {
            let Some(price) = obs.price_usd else { continue };
            let baseline = baselines.get(&obs.printing_id).map(Vec::as_slice).unwrap_or_default();
            if self.outliers.is_outlier(price, baseline) {
                summary.outliers += 1;
                ctx.warn(format!("outlier price {price} for {}", obs.printing_id));
            }
        }

        let rows = dedupe_observations(accepted);
        let store = self.store.as_ref();
        let slice = rows.as_slice();
        let outcome = retry_async(&self.retry, "store.insert_price_history", move || {
            store.insert_price_history(slice)
        })
        .await?;
        summary.inserted += outcome.inserted;
        summary.updated += outcome.updated;
        let now = Utc::now();
        for obs in &rows {
            self.last_updated.mark(&obs.printing_id, source_id, now);
        }
        Ok(())
    }
}

fn bulk_observation(offer: &BulkRow, printing: &PrintingRef, source_id: i16) -> PriceObservation {
    let hints = variant::detect(offer.url.as_deref(), None, &printing.game_code);
    PriceObservation {
        printing_id: printing.printing_id.clone(),
        source_id,
        condition: Condition::NearMint,
        price_usd: Some(offer.price_usd),
        price_eur: None,
        stock_quantity: offer.stock,
        is_foil: offer.is_foil,
        observed_at: Utc::now(),
        url: offer.url.clone(),
        variant: hints.to_value(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> Harvester {
        let store: Arc<dyn CatalogStore> = Arc::new(crate::catalog::MemoryCatalog::new());
        let cfg = crate::config::ScrapingConfig::default();
        let antibot = Arc::new(AntiBot::from_config(&cfg));
        let scraper = Scraper::new(
            antibot.clone(),
            Arc::new(HttpFetcher::new(antibot)),
            crate::normalization::ConditionMapper::with_defaults(),
        );
        let dir = std::env::temp_dir();
        Harvester::new(
            store,
            PricelistCache::new(dir, std::time::Duration::from_secs(60)),
            scraper,
            RetryPolicy::immediate(0),
            50,
        )
    }

    #[test]
    fn scope_maps_onto_query() {
        let h = offline();
        let q = h.query_for(&HarvestScope::Printings(vec!["p1".into()]), 1);
        assert_eq!(q.ids, Some(vec!["p1".to_string()]));
        assert_eq!(q.limit, 50);
        let q = h.query_for(&HarvestScope::Stale(Duration::hours(6)), 2);
        assert_eq!(q.stale_for.map(|(s, _)| s), Some(2));
        assert_eq!(h.runnable_sources(), vec!["geekorium", "scryfall"]);
    }

    #[test]
    fn nightly_sweep_leaves_out_page_scrapes() {
        let mut h = offline();
        for profile in scrape::default_profiles() {
            h = h.with_profile(profile);
        }
        let runnable = h.runnable_sources();
        assert!(runnable.contains(&"tcgplayer"));
        assert!(runnable.contains(&"cardmarket"));
        assert_eq!(h.nightly_sources(), vec!["geekorium", "scryfall"]);
    }
}
