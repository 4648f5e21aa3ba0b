// HTTP request handlers for API endpoints

use std::str::FromStr;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::api::auth::tokens_match;
use crate::api::error::ApiError;
use crate::api::models::*;
use crate::catalog::{normalize_code, reference, ProductFilters, ProductSort, SortKey};
use crate::harvest::HarvestScope;
use crate::services::Services;
use crate::sync::SyncMode;

type ApiResult = Result<HttpResponse, ApiError>;

fn accepted(task_id: Uuid) -> HttpResponse {
    HttpResponse::Accepted().json(ApiResponse::success(TaskLaunched { task_id }))
}

fn sync_mode(recent_days: Option<u32>) -> SyncMode {
    match recent_days {
        Some(days) if days > 0 => SyncMode::Recent(days),
        _ => SyncMode::Full,
    }
}

fn parse_task_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid task id '{raw}'")))
}

/// Health check endpoint
pub async fn health_check(svc: web::Data<Services>) -> ApiResult {
    let database = match svc.store.ping().await {
        Ok(()) => "connected",
        Err(e) => {
            tracing::warn!(error = %e, "health check: store unreachable");
            "disconnected"
        }
    };
    Ok(HttpResponse::Ok().json(HealthResponse {
        status: if database == "connected" { "ok" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        database: database.to_string(),
    }))
}

pub async fn list_cards(svc: web::Data<Services>, query: web::Query<CardsQuery>) -> ApiResult {
    let sort = SortKey::from_str(query.sort.as_deref().unwrap_or("")).map_err(ApiError::BadRequest)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let page = svc
        .store
        .list_printings(&query.filters(), sort, limit, offset)
        .await?;
    Ok(HttpResponse::Ok().json(CardsResponse {
        cards: page.items.into_iter().map(CardSummary::from).collect(),
        total_count: page.total_count,
        limit,
        offset,
    }))
}

pub async fn get_card(svc: web::Data<Services>, path: web::Path<String>) -> ApiResult {
    let printing_id = path.into_inner();
    let Some(detail) = svc.store.get_printing_detail(&printing_id).await? else {
        return Err(ApiError::NotFound(format!("card '{printing_id}' not found")));
    };
    let valuation = svc.aggregation.valuation(&printing_id).await?;
    Ok(HttpResponse::Ok().json(CardDetailResponse {
        card_id: printing_id,
        printing: detail.printing,
        card: detail.card,
        set: detail.set,
        aggregates: detail.aggregates,
        valuation,
    }))
}

pub async fn get_card_valuation(svc: web::Data<Services>, path: web::Path<String>) -> ApiResult {
    let printing_id = path.into_inner();
    if svc.store.get_printing_detail(&printing_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("card '{printing_id}' not found")));
    }
    let valuation = svc.aggregation.valuation(&printing_id).await?;
    Ok(HttpResponse::Ok().json(valuation))
}

pub async fn list_sets(svc: web::Data<Services>, query: web::Query<SetsQuery>) -> ApiResult {
    let game = query
        .game_code
        .as_deref()
        .map(normalize_code)
        .filter(|g| !g.is_empty());
    let sets = svc.store.list_sets(game.as_deref()).await?;
    Ok(HttpResponse::Ok().json(sets))
}

pub async fn list_products(svc: web::Data<Services>, query: web::Query<ProductsQuery>) -> ApiResult {
    let sort =
        ProductSort::from_str(query.sort.as_deref().unwrap_or("")).map_err(ApiError::BadRequest)?;
    let (limit, offset) = page_bounds(query.limit, query.offset);
    let filters = ProductFilters {
        q: query.q.clone().filter(|q| !q.trim().is_empty()),
        game: query.game.as_deref().map(normalize_code).filter(|g| !g.is_empty()),
        in_stock: query.in_stock,
        linked_only: query.linked_only.unwrap_or(false),
        sort,
        limit,
        offset,
    };
    let page = svc.store.list_products(&filters).await?;
    Ok(HttpResponse::Ok().json(page))
}

/// Launch a catalog sync for one game
pub async fn trigger_sync(
    svc: web::Data<Services>,
    path: web::Path<String>,
    query: web::Query<SyncTriggerQuery>,
) -> ApiResult {
    let game = normalize_code(&path.into_inner());
    if svc.synchronizer.registry(&game).is_none() {
        return Err(ApiError::NotFound(format!("unknown game '{game}'")));
    }
    let task_id = svc.launch_sync(&game, sync_mode(query.recent_days))?;
    Ok(accepted(task_id))
}

/// Launch a price harvest for one source
pub async fn trigger_harvest(
    svc: web::Data<Services>,
    path: web::Path<String>,
    query: web::Query<HarvestTriggerQuery>,
) -> ApiResult {
    let code = path.into_inner().to_ascii_lowercase();
    let Some(source) = reference::source_by_code(&code) else {
        return Err(ApiError::NotFound(format!("unknown price source '{code}'")));
    };
    if !svc.harvester.runnable_sources().contains(&source.code) {
        return Err(ApiError::BadRequest(format!("price source '{code}' is not configured")));
    }
    let scope = match (query.stale_hours, query.game.as_deref()) {
        (Some(hours), _) if hours > 0 => HarvestScope::Stale(chrono::Duration::hours(hours)),
        (_, Some(game)) if !game.trim().is_empty() => HarvestScope::Game(normalize_code(game)),
        _ => HarvestScope::All,
    };
    let task_id = svc.launch_harvest(source.code, scope)?;
    Ok(accepted(task_id))
}

pub async fn trigger_pipeline(svc: web::Data<Services>) -> ApiResult {
    let task_id = svc.launch_pipeline()?;
    Ok(accepted(task_id))
}

pub async fn list_tasks(svc: web::Data<Services>) -> ApiResult {
    Ok(HttpResponse::Ok().json(ApiResponse::success(svc.tasks.list())))
}

pub async fn get_task(svc: web::Data<Services>, path: web::Path<String>) -> ApiResult {
    let id = parse_task_id(&path.into_inner())?;
    let task = svc
        .tasks
        .get(id)
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(task)))
}

pub async fn get_task_logs(svc: web::Data<Services>, path: web::Path<String>) -> ApiResult {
    let id = parse_task_id(&path.into_inner())?;
    let logs = svc
        .tasks
        .logs(id)
        .ok_or_else(|| ApiError::NotFound(format!("task {id} not found")))?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(TaskLogsResponse { id, logs })))
}

pub async fn cancel_task(svc: web::Data<Services>, path: web::Path<String>) -> ApiResult {
    let id = parse_task_id(&path.into_inner())?;
    if svc.tasks.get(id).is_none() {
        return Err(ApiError::NotFound(format!("task {id} not found")));
    }
    let cancelled = svc.tasks.cancel(id);
    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({ "id": id, "cancelled": cancelled }))))
}

pub async fn admin_stats(svc: web::Data<Services>) -> ApiResult {
    let stats = svc.store.stats().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(AdminStats {
        total_cards: stats.cards,
        total_printings: stats.printings,
        total_users: stats.users,
        total_updates: stats.price_history,
        total_products: stats.products,
    })))
}

/// Token-gated sync trigger for external schedulers
pub async fn webhook_sync(svc: web::Data<Services>, query: web::Query<WebhookSyncQuery>) -> ApiResult {
    let Some(expected) = svc.config.sync_webhook_token.as_deref() else {
        return Err(ApiError::Unauthorized("webhook disabled".to_string()));
    };
    let given = query.token.as_deref().unwrap_or("");
    if !tokens_match(given, expected) {
        tracing::warn!("webhook sync rejected: bad token");
        return Err(ApiError::Unauthorized("invalid webhook token".to_string()));
    }
    let Some(game) = query.game_code.as_deref().map(normalize_code).filter(|g| !g.is_empty()) else {
        return Err(ApiError::BadRequest("game_code is required".to_string()));
    };
    if svc.synchronizer.registry(&game).is_none() {
        return Err(ApiError::NotFound(format!("unknown game '{game}'")));
    }
    let task_id = svc.launch_sync(&game, sync_mode(query.recent_days))?;
    tracing::info!(%task_id, game = %game, "webhook sync launched");
    Ok(accepted(task_id))
}
