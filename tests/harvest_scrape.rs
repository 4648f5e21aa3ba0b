mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use geekorium_core::aggregation::AggregationEngine;
use geekorium_core::catalog::reference::{source_by_code, SOURCE_CARDMARKET};
use geekorium_core::catalog::{CatalogStore, Condition, MemoryCatalog};
use geekorium_core::config::AppConfig;
use geekorium_core::error::UpstreamError;
use geekorium_core::exchange::ExchangeRates;
use geekorium_core::harvest::antibot::RequestPlan;
use geekorium_core::harvest::scrape::{FetchedPage, CARDMARKET_PROFILE};
use geekorium_core::harvest::{
    AntiBot, HarvestScope, Harvester, PageFetcher, PricelistCache, Scraper,
};
use geekorium_core::normalization::ConditionMapper;
use geekorium_core::retry::RetryPolicy;
use geekorium_core::tasks::TaskContext;

const PRINTING: &str = "cm-0001";

/// Serves the same listing for every URL.
struct StaticListing(String);

#[async_trait]
impl PageFetcher for StaticListing {
    async fn fetch(&self, _url: &str, _plan: &RequestPlan) -> Result<FetchedPage, UpstreamError> {
        Ok(FetchedPage {
            status: 200,
            body: self.0.clone(),
        })
    }
}

fn listing(price: &str) -> String {
    format!(
        r#"<html><body><h1>Lightning Bolt</h1>
        <div class="article-row">
          <span class="article-condition">NM</span>
          <div class="price-container"><span class="color-primary">{price}</span></div>
          <div class="amount-container"><span>4</span></div>
        </div></body></html>"#
    )
}

fn cardmarket_harvester(store: Arc<MemoryCatalog>, dir: &std::path::Path, body: String) -> Harvester {
    let config = AppConfig::for_tests(dir);
    let antibot = Arc::new(AntiBot::from_config(&config.scraping));
    let scraper = Scraper::new(antibot, Arc::new(StaticListing(body)), ConditionMapper::with_defaults());
    Harvester::new(
        store,
        PricelistCache::new(dir, Duration::from_secs(3600)),
        scraper,
        RetryPolicy::immediate(0),
        100,
    )
    .with_profile(CARDMARKET_PROFILE)
    .with_rates(ExchangeRates::new(1.1, 1.3))
}

#[tokio::test]
async fn euro_listing_is_stored_with_usd_and_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;

    let summary = cardmarket_harvester(store.clone(), dir.path(), listing("2,75 €"))
        .run_source(
            SOURCE_CARDMARKET,
            &HarvestScope::Printings(vec![PRINTING.into()]),
            &TaskContext::detached("harvest"),
        )
        .await
        .unwrap();
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.inserted, 1);

    let history = store.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source_id, source_by_code(SOURCE_CARDMARKET).unwrap().id);
    assert_eq!(history[0].price_eur, Some(2.75));
    assert_eq!(history[0].price_usd, Some(3.03));
    assert_eq!(history[0].stock_quantity, Some(4));

    let written = AggregationEngine::new(store.clone(), 7)
        .refresh_aggregates()
        .await
        .unwrap()
        .aggregates_written;
    assert_eq!(written, 1);
    let agg = store.aggregate(PRINTING, Condition::NearMint).unwrap();
    assert_eq!(agg.avg_market_price_usd, 3.03);
    assert_eq!(agg.observation_count, 1);
}

#[tokio::test]
async fn legacy_euro_rows_are_priced_before_aggregation() {
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;
    let mut row = observation(PRINTING, source_by_code(SOURCE_CARDMARKET).unwrap().id, 0.0, 0);
    row.price_usd = None;
    row.price_eur = Some(2.75);
    store.insert_price_history(&[row]).await.unwrap();

    assert_eq!(store.fill_usd_from_eur(1.1).await.unwrap(), 1);
    assert_eq!(store.fill_usd_from_eur(1.1).await.unwrap(), 0);
    AggregationEngine::new(store.clone(), 7)
        .refresh_aggregates()
        .await
        .unwrap();
    let agg = store.aggregate(PRINTING, Condition::NearMint).unwrap();
    assert_eq!(agg.avg_market_price_usd, 3.03);
}
