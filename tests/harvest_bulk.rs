mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use geekorium_core::catalog::reference::{source_by_code, SOURCE_CARDKINGDOM, SOURCE_SCRYFALL};
use geekorium_core::catalog::{CatalogStore, Condition, MemoryCatalog};
use geekorium_core::error::UpstreamError;
use geekorium_core::harvest::bulk::{parse_cardkingdom, BulkRow};
use geekorium_core::harvest::{HarvestScope, LastUpdatedCache, PricelistCache, PricelistProvider};
use geekorium_core::tasks::TaskContext;
use serde_json::json;

const PRINTING: &str = "0b3f5a1e-0000-4c1d-9000-000000000001";

/// Serves `body` on download, or fails when `body` is `None`.
struct FakePricelist {
    body: Option<Vec<u8>>,
    downloads: AtomicUsize,
}

impl FakePricelist {
    fn new(body: Option<Vec<u8>>) -> Self {
        Self {
            body,
            downloads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PricelistProvider for FakePricelist {
    fn source_code(&self) -> &str {
        SOURCE_CARDKINGDOM
    }

    async fn download(&self) -> Result<Vec<u8>, UpstreamError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.body
            .clone()
            .ok_or_else(|| UpstreamError::Rejected {
                status: 403,
                url: "https://api.cardkingdom.test/pricelist".into(),
            })
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<BulkRow>, UpstreamError> {
        parse_cardkingdom(bytes)
    }
}

fn pricelist_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "meta": {},
        "data": [
            {"scryfall_id": PRINTING.to_uppercase(), "price_retail": "5.00", "qty_retail": 3,
             "url": "mtg/edge-of-eternities/lightning-bolt", "is_foil": "false"},
            {"scryfall_id": "ffffffff-0000-0000-0000-000000000000", "price_retail": "1.00",
             "qty_retail": 9, "url": "mtg/x/y", "is_foil": "false"}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn fresh_cache_feeds_bulk_harvest() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;

    let cache = PricelistCache::new(dir.path(), std::time::Duration::from_secs(3600));
    cache.store(SOURCE_CARDKINGDOM, &pricelist_body()).unwrap();
    let provider = Arc::new(FakePricelist::new(None));
    let harvester = offline_harvester(store.clone(), dir.path()).with_pricelist(provider.clone());

    let ctx = TaskContext::detached("harvest");
    let summary = harvester
        .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
        .await
        .unwrap();
    assert_eq!(provider.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.inserted, 1);

    let history = store.history();
    assert_eq!(history.len(), 1);
    let row = &history[0];
    assert_eq!(row.printing_id, PRINTING);
    assert_eq!(row.price_usd, Some(5.0));
    assert_eq!(row.stock_quantity, Some(3));
    assert_eq!(row.condition, Some(Condition::NearMint));
    assert_eq!(row.source_id, source_by_code(SOURCE_CARDKINGDOM).unwrap().id);
    assert!(row.url.as_deref().unwrap().starts_with("https://www.cardkingdom.com/"));
}

#[tokio::test]
async fn missing_cache_downloads_and_stores() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;
    let provider = Arc::new(FakePricelist::new(Some(pricelist_body())));
    let harvester = offline_harvester(store.clone(), dir.path()).with_pricelist(provider.clone());

    let ctx = TaskContext::detached("harvest");
    harvester
        .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
        .await
        .unwrap();
    assert_eq!(provider.downloads.load(Ordering::SeqCst), 1);
    let cache = PricelistCache::new(dir.path(), std::time::Duration::from_secs(3600));
    assert!(cache.load_fresh(SOURCE_CARDKINGDOM).is_some());
}

#[tokio::test]
async fn failed_download_aborts_source() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;
    let harvester = offline_harvester(store.clone(), dir.path())
        .with_pricelist(Arc::new(FakePricelist::new(None)));

    let ctx = TaskContext::detached("harvest");
    let err = harvester
        .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("pricelist download failed"));
    assert!(store.history().is_empty());
}

#[tokio::test]
async fn second_run_same_day_updates_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;
    let cache = PricelistCache::new(dir.path(), std::time::Duration::from_secs(3600));
    cache.store(SOURCE_CARDKINGDOM, &pricelist_body()).unwrap();

    let ctx = TaskContext::detached("harvest");
    for _ in 0..2 {
        // a fresh harvester each time so the recently-updated cache does not skip
        offline_harvester(store.clone(), dir.path())
            .with_pricelist(Arc::new(FakePricelist::new(None)))
            .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
            .await
            .unwrap();
    }
    assert_eq!(store.history().len(), 1);
}

#[tokio::test]
async fn recently_refreshed_printings_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;
    let cache = PricelistCache::new(dir.path(), std::time::Duration::from_secs(3600));
    cache.store(SOURCE_CARDKINGDOM, &pricelist_body()).unwrap();
    let ctx = TaskContext::detached("harvest");

    let harvester = offline_harvester(store.clone(), dir.path())
        .with_pricelist(Arc::new(FakePricelist::new(None)));
    harvester
        .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
        .await
        .unwrap();
    let again = harvester
        .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
        .await
        .unwrap();
    assert_eq!(again.skipped_recent, 1);
    assert_eq!(again.matched, 0);

    let eager = offline_harvester(store.clone(), dir.path())
        .with_pricelist(Arc::new(FakePricelist::new(None)))
        .with_last_updated(LastUpdatedCache::new(chrono::Duration::zero()));
    for _ in 0..2 {
        eager
            .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
            .await
            .unwrap();
    }
    let forced = eager
        .run_source(SOURCE_CARDKINGDOM, &HarvestScope::All, &ctx)
        .await
        .unwrap();
    assert_eq!(forced.matched, 1);
    assert_eq!(forced.updated, 1);
}

#[tokio::test]
async fn registry_snapshot_prices_are_harvested() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), PRINTING, "Lightning Bolt").await;
    let mut printing = store.printing(PRINTING).unwrap();
    printing.prices = Some(json!({"usd": "0.25", "usd_foil": "1.10", "eur": "0.20"}));
    store.upsert_printings(&[printing]).await.unwrap();

    let ctx = TaskContext::detached("harvest");
    let summary = offline_harvester(store.clone(), dir.path())
        .run_source(SOURCE_SCRYFALL, &HarvestScope::Printings(vec![PRINTING.into()]), &ctx)
        .await
        .unwrap();
    assert_eq!(summary.matched, 1);
    let history = store.history();
    // foil and non-foil share a (printing, source, condition, day) key; non-foil wins
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price_usd, Some(0.25));
    assert!(!history[0].is_foil);
}
