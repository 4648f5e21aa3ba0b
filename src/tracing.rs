use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

use crate::util::env::env_opt;

/// Filter used when neither `RUST_LOG` nor `LOG_LEVEL` is set.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Resolve the effective filter directive: `RUST_LOG` wins, then `LOG_LEVEL`
/// (a bare level such as `debug`), then `default_filter`.
pub fn resolve_filter(
    rust_log: Option<&str>,
    log_level: Option<&str>,
    default_filter: &str,
) -> String {
    if let Some(directive) = rust_log.map(str::trim).filter(|s| !s.is_empty()) {
        return directive.to_string();
    }
    if let Some(level) = log_level.map(str::trim).filter(|s| !s.is_empty()) {
        return format!("{},sqlx=warn,actix_web=info", level.to_ascii_lowercase());
    }
    default_filter.to_string()
}

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// All binaries share the same formatting rules. `LOG_LEVEL` is honoured
/// when `RUST_LOG` is not set.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let rust_log = env_opt("RUST_LOG");
    let log_level = env_opt("LOG_LEVEL");
    let directive = resolve_filter(rust_log.as_deref(), log_level.as_deref(), default_filter);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
