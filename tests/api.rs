mod common;

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use chrono::{Duration, Utc};
use common::*;
use geekorium_core::api::routes::configure_routes;
use geekorium_core::api::{AdminGate, StaticIdentity};
use geekorium_core::catalog::{CatalogStore, MemoryCatalog};
use geekorium_core::config::AppConfig;
use geekorium_core::retry::RetryPolicy;
use geekorium_core::sync::Synchronizer;
use geekorium_core::Services;
use serde_json::Value;

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<MemoryCatalog>,
    services: Services,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryCatalog::seeded());
    seed_printing(store.as_ref(), "api-0001", "Lightning Bolt").await;
    seed_printing(store.as_ref(), "api-0002", "Lightning Helix").await;
    seed_printing(store.as_ref(), "api-0003", "Counterspell").await;
    store.refresh_materialized_views().await.unwrap();
    store.add_profile("u-admin", "admin");
    store.add_profile("u-user", "user");

    let registry = FakeRegistry::new("mtg").with_set(
        set_row("mtg", "ecl", Some(Utc::now().date_naive() - Duration::days(3))),
        vec![registry_card("api-0001", "oracle-api-0001", "Lightning Bolt", "ecl")],
    );
    let services = Services::build(AppConfig::for_tests(dir.path()), store.clone())
        .unwrap()
        .with_harvester(offline_harvester(store.clone(), &dir.path().join("cache")))
        .with_synchronizer(
            Synchronizer::new(store.clone(), RetryPolicy::immediate(0), 500)
                .with_registry(Arc::new(registry)),
        );
    Fixture {
        _dir: dir,
        store,
        services,
    }
}

fn gate(store: Arc<MemoryCatalog>, dev_fallback: bool) -> AdminGate {
    let identity = StaticIdentity::new()
        .with_token("admin-token", "u-admin")
        .with_token("user-token", "u-user");
    AdminGate::new(Arc::new(identity), store, dev_fallback)
}

macro_rules! app {
    ($fx:expr, $dev:expr) => {{
        let gate = gate($fx.store.clone(), $dev);
        test::init_service(
            App::new()
                .app_data(web::Data::new($fx.services.clone()))
                .configure(move |cfg| configure_routes(cfg, gate)),
        )
        .await
    }};
}

#[actix_web::test]
async fn health_reports_connected_store() {
    let fx = fixture().await;
    let app = app!(fx, false);
    let body: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "connected");
}

#[actix_web::test]
async fn card_search_is_case_insensitive() {
    let fx = fixture().await;
    let app = app!(fx, false);
    let req = test::TestRequest::get()
        .uri("/api/cards?q=LIGHTNING&limit=1")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["cards"].as_array().unwrap().len(), 1);
    assert!(body["cards"][0]["name"].as_str().unwrap().starts_with("Lightning"));
}

#[actix_web::test]
async fn unknown_card_is_404() {
    let fx = fixture().await;
    let app = app!(fx, false);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/cards/nope").to_request()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::get().uri("/api/cards/api-0003").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["card_id"], "api-0003");
    assert_eq!(body["card"]["name"], "Counterspell");
}

#[actix_web::test]
async fn bad_sort_is_rejected() {
    let fx = fixture().await;
    let app = app!(fx, false);
    let req = test::TestRequest::get().uri("/api/cards?sort=bogus").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn admin_scope_checks_role() {
    let fx = fixture().await;
    let app = app!(fx, false);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/admin/stats").to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/api/admin/stats")
        .insert_header(("Authorization", "Bearer user-token"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get()
        .uri("/api/admin/stats")
        .insert_header(("Authorization", "Bearer admin-token"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["total_printings"], 3);
    assert_eq!(body["data"]["total_users"], 2);
}

#[actix_web::test]
async fn development_admits_anonymous_admin() {
    let fx = fixture().await;
    let app = app!(fx, true);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/api/admin/tasks").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri("/api/admin/tasks")
        .insert_header(("Authorization", "Bearer forged"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn admin_sync_launches_task() {
    let fx = fixture().await;
    let app = app!(fx, true);

    let req = test::TestRequest::post().uri("/api/admin/catalog/sync/yugioh").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri("/api/admin/catalog/sync/MTG?recent_days=30")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: Value = test::read_body_json(resp).await;
    let id = body["data"]["task_id"].as_str().unwrap().parse().unwrap();
    fx.services.finish(id).await.unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/admin/tasks/{id}/logs"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert!(!body["data"]["logs"].as_array().unwrap().is_empty());

    let req = test::TestRequest::get().uri("/api/admin/tasks/not-a-uuid").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn webhook_requires_token_and_known_game() {
    let fx = fixture().await;
    let app = app!(fx, false);

    let req = test::TestRequest::post()
        .uri("/api/webhook/sync?token=wrong&game_code=mtg")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/api/webhook/sync?token=test-token")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/api/webhook/sync?token=test-token&game_code=lorcana")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    let req = test::TestRequest::post()
        .uri("/api/webhook/sync?token=test-token&game_code=MTG")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::ACCEPTED);
}
