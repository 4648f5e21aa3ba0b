// API server implementation using actix-web

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};

use crate::api::auth::{AdminGate, IdentityProvider};
use crate::api::{middleware, routes};
use crate::config::AppConfig;
use crate::services::Services;

pub struct ApiServer {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub dev_fallback: bool,
}

impl ApiServer {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            host: config.api_host.clone(),
            port: config.api_port,
            allowed_origins: config.allowed_origins.clone(),
            dev_fallback: config.app_env.is_development(),
        }
    }

    /// Start the HTTP server
    pub async fn run(self, services: Services, identity: Arc<dyn IdentityProvider>) -> Result<()> {
        let bind_addr = format!("{}:{}", self.host, self.port);

        tracing::info!(
            host = %self.host,
            port = %self.port,
            dev_fallback = self.dev_fallback,
            "starting catalog API server"
        );

        let gate = AdminGate::new(identity, services.store.clone(), self.dev_fallback);
        let data = web::Data::new(services);
        let allowed_origins = self.allowed_origins.clone();

        HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);
            let gate = gate.clone();

            App::new()
                .app_data(data.clone())
                .wrap(logger)
                .wrap(compress)
                .wrap(cors)
                .configure(move |cfg| routes::configure_routes(cfg, gate))
        })
        .bind(&bind_addr)
        .with_context(|| format!("Failed to bind to {}", bind_addr))?
        .run()
        .await
        .context("HTTP server error")?;

        Ok(())
    }
}
