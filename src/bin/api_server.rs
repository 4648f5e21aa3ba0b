// HTTP API server only; no scheduler

use anyhow::Result;
use geekorium_core::api::auth::identity_from_config;
use geekorium_core::api::ApiServer;
use geekorium_core::{AppConfig, Services};

#[actix_web::main]
async fn main() -> Result<()> {
    geekorium_core::util::env::init_env();
    geekorium_core::tracing::init_tracing(geekorium_core::tracing::DEFAULT_FILTER)?;

    tracing::info!("initializing catalog API server");

    let config = AppConfig::from_env()?;
    let server = ApiServer::from_config(&config);
    let identity = identity_from_config(&config)?;
    let services = Services::from_config(config).await?;

    server.run(services, identity).await
}
