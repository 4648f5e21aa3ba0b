mod common;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use common::*;
use geekorium_core::catalog::reference::market_source;
use geekorium_core::catalog::{AlertType, CatalogStore, Condition, MemoryCatalog, PriceAlert};
use geekorium_core::config::AppConfig;
use geekorium_core::harvest::scrape::default_profiles;
use geekorium_core::orchestrator::{
    NightlyPipeline, PipelineSettings, ProgressMarker, Stage, StageStatus, Verifier, REPORT_FILE,
};
use geekorium_core::retry::RetryPolicy;
use geekorium_core::sync::{SyncMode, Synchronizer};
use geekorium_core::tasks::TaskContext;
use geekorium_core::Services;
use serde_json::Value;

const CARD: &str = "night-0001";

fn services(store: Arc<MemoryCatalog>, root: &std::path::Path) -> Services {
    Services::build(AppConfig::for_tests(root), store.clone())
        .unwrap()
        .with_harvester(offline_harvester(store, &root.join("cache")))
}

fn below_alert(target: f64) -> PriceAlert {
    PriceAlert {
        alert_id: 0,
        user_id: "collector-1".into(),
        printing_id: CARD.into(),
        condition: Condition::NearMint,
        alert_type: AlertType::Below,
        target_price: target,
        is_active: true,
        is_recurring: false,
        last_triggered_at: None,
        created_at: Utc::now() - Duration::days(3),
    }
}

struct FailingVerifier;

#[async_trait]
impl Verifier for FailingVerifier {
    async fn verify(&self) -> Result<Value> {
        bail!("GET /health returned 502")
    }
}

#[tokio::test]
async fn nightly_triggers_alert_once_and_writes_marker() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), CARD, "Sol Ring").await;
    store
        .insert_price_history(&[observation(CARD, market_source().id, 8.5, 0)])
        .await
        .unwrap();
    let alert_id = store.add_alert(below_alert(10.0));

    let svc = services(store.clone(), dir.path());
    let ctx = TaskContext::detached("nightly");
    let report = svc.pipeline().unwrap().run(&ctx).await.unwrap();
    assert!(report.success);
    assert_eq!(report.stages.len(), Stage::ALL.len());
    assert_eq!(report.stage(Stage::Verify).unwrap().status, StageStatus::Skipped);
    assert_eq!(report.stage(Stage::Alerts).unwrap().detail["triggered"], 1);

    let alert = store.alert(alert_id).unwrap();
    assert!(!alert.is_active);
    assert!(alert.last_triggered_at.is_some());
    let notes = store.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].current_price, 8.5);

    let state_dir = dir.path().join("state");
    let marker = ProgressMarker::load(&state_dir).unwrap();
    assert_eq!(marker.stages.first().map(String::as_str), Some("health"));
    assert!(state_dir.join(REPORT_FILE).exists());

    let again = svc.pipeline().unwrap().run(&ctx).await.unwrap();
    assert_eq!(again.stage(Stage::Alerts).unwrap().detail["triggered"], 0);
    assert_eq!(store.notifications().len(), 1);
}

#[tokio::test]
async fn failed_health_check_leaves_no_marker() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    let svc = services(store, dir.path());
    let state_dir = dir.path().join("state");
    let pipeline = NightlyPipeline::new(
        svc.store.clone(),
        svc.harvester.clone(),
        svc.aggregation.clone(),
        svc.alerts.clone(),
        PipelineSettings {
            state_dir: state_dir.clone(),
            retention_days: 365,
            missing_secrets: vec!["SUPABASE_URL"],
        },
    );

    let err = pipeline
        .run(&TaskContext::detached("nightly"))
        .await
        .unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("nightly stage health failed"));
    assert!(msg.contains("SUPABASE_URL"));
    assert!(ProgressMarker::load(&state_dir).is_none());
}

#[tokio::test]
async fn failed_verification_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    let svc = services(store, dir.path());
    let pipeline = svc.pipeline().unwrap().with_verifier(Arc::new(FailingVerifier));

    let err = pipeline
        .run(&TaskContext::detached("nightly"))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("nightly stage verify failed"));
    assert!(ProgressMarker::load(&dir.path().join("state")).is_none());
}

#[tokio::test]
async fn old_history_is_archived() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), CARD, "Sol Ring").await;
    store
        .insert_price_history(&[
            observation(CARD, market_source().id, 3.0, 400),
            observation(CARD, market_source().id, 4.0, 1),
        ])
        .await
        .unwrap();

    let svc = services(store.clone(), dir.path());
    svc.pipeline()
        .unwrap()
        .run(&TaskContext::detached("nightly"))
        .await
        .unwrap();
    assert_eq!(store.history().len(), 1);
    assert_eq!(store.archived().len(), 1);
}

#[tokio::test]
async fn launched_sync_refreshes_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    let released = Utc::now().date_naive() - Duration::days(5);
    let registry = FakeRegistry::new("mtg").with_set(
        set_row("mtg", "ecl", Some(released)),
        vec![registry_card("P1", "O1", "Lightning Bolt", "ecl")],
    );
    let svc = services(store.clone(), dir.path()).with_synchronizer(
        Synchronizer::new(store.clone(), RetryPolicy::immediate(0), 500)
            .with_registry(Arc::new(registry)),
    );

    assert!(svc.launch_sync("yugioh", SyncMode::Full).is_err());
    let id = svc.launch_sync("MTG", SyncMode::Recent(30)).unwrap();
    let result = svc.finish(id).await.unwrap();
    assert_eq!(result["sets_processed"], 1);
    assert!(store.printing("P1").is_some());
    let logs = svc.tasks.logs(id).unwrap();
    assert!(logs.iter().any(|l| l.contains("aggregates refreshed")));
}

#[tokio::test]
async fn legacy_rows_are_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), CARD, "Sol Ring").await;
    let market = market_source().id;
    let today = Utc::now().date_naive();
    store
        .insert_price_history(&[observation(CARD, market, 5.0, 0)])
        .await
        .unwrap();
    // same key as the NM row once the grade is filled in
    store.insert_legacy_history(CARD, market, None, today, None, 4.0);
    store.insert_legacy_history(CARD, market, None, today - Duration::days(1), None, 4.5);

    let svc = services(store.clone(), dir.path());
    let report = svc
        .pipeline()
        .unwrap()
        .run(&TaskContext::detached("nightly"))
        .await
        .unwrap();
    let repair = &report.stage(Stage::Repair).unwrap().detail["repair"];
    assert_eq!(repair["duplicates_removed"], 1);
    assert_eq!(repair["conditions_filled"], 1);

    let history = store.history();
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .all(|e| e.condition == Some(Condition::NearMint) && e.observed_at.is_some()));
    let agg = store.aggregate(CARD, Condition::NearMint).unwrap();
    assert_eq!(agg.observation_count, 2);
}

#[tokio::test]
async fn nightly_harvest_skips_page_scrapes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), CARD, "Sol Ring").await;
    let mut harvester = offline_harvester(store.clone(), &dir.path().join("cache"));
    for profile in default_profiles() {
        harvester = harvester.with_profile(profile);
    }
    assert!(harvester.runnable_sources().contains(&"cardmarket"));
    let svc = Services::build(AppConfig::for_tests(dir.path()), store.clone())
        .unwrap()
        .with_harvester(harvester);

    let report = svc
        .pipeline()
        .unwrap()
        .run(&TaskContext::detached("nightly"))
        .await
        .unwrap();
    let detail = &report.stage(Stage::Harvest).unwrap().detail;
    let mut sources: Vec<&str> = detail["summaries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["source"].as_str().unwrap())
        .collect();
    sources.sort_unstable();
    assert_eq!(sources, vec!["geekorium", "scryfall"]);
    assert!(detail["failures"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn repair_prices_euro_rows_for_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), CARD, "Sol Ring").await;
    let mut row = observation(CARD, 3, 0.0, 0);
    row.price_usd = None;
    row.price_eur = Some(10.0);
    store.insert_price_history(&[row]).await.unwrap();

    let report = services(store.clone(), dir.path())
        .pipeline()
        .unwrap()
        .run(&TaskContext::detached("nightly"))
        .await
        .unwrap();
    assert_eq!(report.stage(Stage::Repair).unwrap().detail["converted"], 1);
    let agg = store.aggregate(CARD, Condition::NearMint).unwrap();
    // offline harvester keeps the default rate
    assert_eq!(agg.avg_market_price_usd, 10.8);
}
