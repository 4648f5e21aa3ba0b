//! Process configuration assembled from the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::util::env::{env_flag, env_opt, env_parse, preflight_check, split_list};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(v) if v == "development" || v == "dev" || v == "local" => AppEnv::Development,
            _ => AppEnv::Production,
        }
    }

    pub fn is_development(self) -> bool {
        self == AppEnv::Development
    }
}

/// Knobs for the anti-bot layer and the scrape path.
#[derive(Debug, Clone)]
pub struct ScrapingConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub user_agent: Option<String>,
    pub proxies: Vec<String>,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Consecutive block responses after which a source run stops early.
    pub max_consecutive_blocks: u32,
    /// Proxy failures before it is benched.
    pub proxy_max_failures: u32,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(3.0),
            timeout: Duration::from_secs(30),
            max_retries: 5,
            user_agent: None,
            proxies: Vec::new(),
            requests_per_minute: 30,
            requests_per_hour: 500,
            max_consecutive_blocks: 5,
            proxy_max_failures: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_env: AppEnv,
    pub database_url: String,
    pub db_max_conns: u32,
    pub auto_migrate: bool,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub supabase_service_role_key: Option<String>,
    pub sync_webhook_token: Option<String>,
    pub pokemon_api_key: Option<String>,
    pub scraping: ScrapingConfig,
    pub api_host: String,
    pub api_port: u16,
    pub allowed_origins: Vec<String>,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub log_dir: PathBuf,
    pub state_dir: PathBuf,
    pub price_window_days: u32,
    pub price_retention_days: u32,
    pub sync_batch_size: usize,
    pub harvest_batch_size: usize,
    pub nightly_hour_utc: u32,
    pub verify_base_url: Option<String>,
    /// USD per euro for EUR-only observations.
    pub eur_usd_rate: f64,
    pub gbp_usd_rate: f64,
    /// Quotes per USD in the frankfurter.app shape; refreshed at startup when set.
    pub fx_rates_url: Option<String>,
}

/// Keys logged (redacted) at startup.
const SNAPSHOT_KEYS: &[&str] = &[
    "APP_ENV",
    "DATABASE_URL",
    "SUPABASE_URL",
    "SUPABASE_ANON_KEY",
    "SUPABASE_SERVICE_ROLE_KEY",
    "SYNC_WEBHOOK_TOKEN",
    "POKEMON_API_KEY",
    "LOG_LEVEL",
    "SCRAPING_DELAY",
    "SCRAPING_TIMEOUT",
    "SCRAPING_MAX_RETRIES",
    "SCRAPING_USER_AGENT",
    "CACHE_DIR",
    "LOG_DIR",
    "STATE_DIR",
    "EUR_USD_RATE",
    "FX_RATES_URL",
];

impl AppConfig {
    /// Required env keys for the given environment.
    pub fn required_keys(app_env: AppEnv) -> &'static [&'static str] {
        match app_env {
            AppEnv::Development => &["DATABASE_URL"],
            AppEnv::Production => &["DATABASE_URL", "SUPABASE_URL", "SUPABASE_SERVICE_ROLE_KEY"],
        }
    }

    /// Load and validate configuration; fails fast when secrets are missing.
    pub fn from_env() -> Result<Self> {
        let app_env = AppEnv::parse(env_opt("APP_ENV").as_deref());
        preflight_check("geekorium", Self::required_keys(app_env), SNAPSHOT_KEYS)?;
        let database_url = crate::util::env::db_url()?;

        let min_delay = env_parse("SCRAPING_DELAY", 1.0f64).max(0.0);
        let max_delay = env_parse("SCRAPING_MAX_DELAY", 3.0f64).max(min_delay);
        let scraping = ScrapingConfig {
            min_delay: Duration::from_secs_f64(min_delay),
            max_delay: Duration::from_secs_f64(max_delay),
            timeout: Duration::from_secs(env_parse("SCRAPING_TIMEOUT", 30u64)),
            max_retries: env_parse("SCRAPING_MAX_RETRIES", 5u32),
            user_agent: env_opt("SCRAPING_USER_AGENT"),
            proxies: env_opt("SCRAPING_PROXIES")
                .map(|raw| split_list(&raw))
                .unwrap_or_default(),
            requests_per_minute: env_parse("SCRAPING_REQUESTS_PER_MINUTE", 30u32).max(1),
            requests_per_hour: env_parse("SCRAPING_REQUESTS_PER_HOUR", 500u32).max(1),
            max_consecutive_blocks: env_parse("SCRAPING_MAX_CONSECUTIVE_BLOCKS", 5u32),
            proxy_max_failures: env_parse("SCRAPING_PROXY_MAX_FAILURES", 3u32).max(1),
        };

        let allowed_origins = env_opt("ALLOWED_ORIGINS")
            .map(|raw| split_list(&raw))
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ]
            });

        Ok(Self {
            app_env,
            database_url,
            db_max_conns: env_parse("DB_MAX_CONNS", 10u32),
            auto_migrate: env_flag("AUTO_MIGRATE", false),
            supabase_url: env_opt("SUPABASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            supabase_anon_key: env_opt("SUPABASE_ANON_KEY"),
            supabase_service_role_key: env_opt("SUPABASE_SERVICE_ROLE_KEY"),
            sync_webhook_token: env_opt("SYNC_WEBHOOK_TOKEN"),
            pokemon_api_key: env_opt("POKEMON_API_KEY"),
            scraping,
            api_host: env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: env_parse("API_PORT", 8080u16),
            allowed_origins,
            cache_dir: PathBuf::from(env_opt("CACHE_DIR").unwrap_or_else(|| "./data/cache".into())),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_HOURS", 24u64) * 3600),
            log_dir: PathBuf::from(env_opt("LOG_DIR").unwrap_or_else(|| "./logs".into())),
            state_dir: PathBuf::from(env_opt("STATE_DIR").unwrap_or_else(|| "./data/state".into())),
            price_window_days: env_parse("PRICE_WINDOW_DAYS", 7u32).max(1),
            price_retention_days: env_parse("PRICE_RETENTION_DAYS", 365u32).max(1),
            sync_batch_size: env_parse("SYNC_BATCH_SIZE", 500usize).max(1),
            harvest_batch_size: env_parse("HARVEST_BATCH_SIZE", 1000usize).max(1),
            nightly_hour_utc: env_parse("NIGHTLY_HOUR_UTC", 3u32).min(23),
            verify_base_url: env_opt("VERIFY_BASE_URL"),
            eur_usd_rate: env_parse("EUR_USD_RATE", 1.08f64),
            gbp_usd_rate: env_parse("GBP_USD_RATE", 1.27f64),
            fx_rates_url: env_opt("FX_RATES_URL"),
        })
    }

    /// Secrets the current environment needs but does not have. Checked again
    /// by the nightly health stage.
    pub fn missing_secrets(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.app_env.is_development() {
            return missing;
        }
        if self.database_url.trim().is_empty() {
            missing.push("DATABASE_URL");
        }
        if self.supabase_url.is_none() {
            missing.push("SUPABASE_URL");
        }
        if self.supabase_service_role_key.is_none() {
            missing.push("SUPABASE_SERVICE_ROLE_KEY");
        }
        missing
    }

    /// Minimal configuration for tests and dry runs; nothing is read from the environment.
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            app_env: AppEnv::Development,
            database_url: String::new(),
            db_max_conns: 1,
            auto_migrate: false,
            supabase_url: None,
            supabase_anon_key: None,
            supabase_service_role_key: None,
            sync_webhook_token: Some("test-token".to_string()),
            pokemon_api_key: None,
            scraping: ScrapingConfig {
                min_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                timeout: Duration::from_secs(5),
                max_retries: 0,
                ..ScrapingConfig::default()
            },
            api_host: "127.0.0.1".to_string(),
            api_port: 0,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            cache_dir: root.join("cache"),
            cache_ttl: Duration::from_secs(24 * 3600),
            log_dir: root.join("logs"),
            state_dir: root.join("state"),
            price_window_days: 7,
            price_retention_days: 365,
            sync_batch_size: 500,
            harvest_batch_size: 1000,
            nightly_hour_utc: 3,
            verify_base_url: None,
            eur_usd_rate: 1.1,
            gbp_usd_rate: 1.3,
            fx_rates_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_env_parsing() {
        assert_eq!(AppEnv::parse(Some("Development")), AppEnv::Development);
        assert_eq!(AppEnv::parse(Some("production")), AppEnv::Production);
        assert_eq!(AppEnv::parse(None), AppEnv::Production);
    }

    #[test]
    fn production_requires_supabase() {
        let keys = AppConfig::required_keys(AppEnv::Production);
        assert!(keys.contains(&"SUPABASE_SERVICE_ROLE_KEY"));
        assert_eq!(AppConfig::required_keys(AppEnv::Development), &["DATABASE_URL"]);
    }

    #[test]
    fn missing_secrets_only_outside_development() {
        let dir = std::env::temp_dir();
        let mut cfg = AppConfig::for_tests(&dir);
        assert!(cfg.missing_secrets().is_empty());
        cfg.app_env = AppEnv::Production;
        cfg.database_url = "postgres://localhost/geekorium".into();
        assert_eq!(
            cfg.missing_secrets(),
            vec!["SUPABASE_URL", "SUPABASE_SERVICE_ROLE_KEY"]
        );
    }
}
