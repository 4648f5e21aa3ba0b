use anyhow::Result;
use chrono::Utc;
use geekorium_core::api::auth::identity_from_config;
use geekorium_core::api::ApiServer;
use geekorium_core::orchestrator::next_run_after;
use geekorium_core::util::env::env_flag;
use geekorium_core::{AppConfig, Services};
use tracing::{error, info, warn};

/// Launch the nightly pipeline once a day at the configured hour.
async fn nightly_scheduler(services: Services) {
    let hour = services.config.nightly_hour_utc;
    loop {
        let now = Utc::now();
        let next = next_run_after(now, hour);
        info!(%next, "next nightly run scheduled");
        tokio::time::sleep((next - now).to_std().unwrap_or_default()).await;

        let id = match services.launch_pipeline() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %format!("{e:#}"), "nightly pipeline could not start");
                continue;
            }
        };
        match services.finish(id).await {
            Ok(_) => info!(%id, "nightly pipeline finished"),
            Err(e) => warn!(%id, error = %format!("{e:#}"), "nightly pipeline failed"),
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    geekorium_core::util::env::init_env();
    geekorium_core::tracing::init_tracing(geekorium_core::tracing::DEFAULT_FILTER)?;

    let config = AppConfig::from_env()?;
    let server = ApiServer::from_config(&config);
    let identity = identity_from_config(&config)?;
    let services = Services::from_config(config).await?;

    if env_flag("NIGHTLY_ENABLED", true) {
        tokio::spawn(nightly_scheduler(services.clone()));
    } else {
        info!("NIGHTLY_ENABLED=0; scheduler not started");
    }

    server.run(services, identity).await
}
