// API route configuration

use actix_web::web;

use crate::api::auth::{AdminGate, AdminGuard};
use crate::api::handlers;

pub fn configure_routes(cfg: &mut web::ServiceConfig, gate: AdminGate) {
    cfg
        // Public
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .route("/api/cards", web::get().to(handlers::list_cards))
        .route("/api/cards/{printing_id}", web::get().to(handlers::get_card))
        .route(
            "/api/cards/{printing_id}/valuation",
            web::get().to(handlers::get_card_valuation),
        )
        .route("/api/sets", web::get().to(handlers::list_sets))
        .route("/api/products", web::get().to(handlers::list_products))
        // Token in the query string instead of admin auth
        .route("/api/webhook/sync", web::post().to(handlers::webhook_sync))
        .service(
            web::scope("/api/admin")
                .wrap(AdminGuard::new(gate))
                .route(
                    "/catalog/sync/{game_code}",
                    web::post().to(handlers::trigger_sync),
                )
                .route(
                    "/scraper/run/{source}",
                    web::post().to(handlers::trigger_harvest),
                )
                .route("/pipeline/run", web::post().to(handlers::trigger_pipeline))
                .route("/tasks", web::get().to(handlers::list_tasks))
                .route("/tasks/{task_id}", web::get().to(handlers::get_task))
                .route("/tasks/{task_id}/logs", web::get().to(handlers::get_task_logs))
                .route(
                    "/tasks/{task_id}/cancel",
                    web::post().to(handlers::cancel_task),
                )
                .route("/stats", web::get().to(handlers::admin_stats)),
        );
}
