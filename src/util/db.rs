use anyhow::Result;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    /// Connect without touching the schema; callers decide whether to migrate.
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect_no_migrate(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!(max_connections, "connected to db");
        Ok(Self { pool })
    }

    /// Apply pending `./migrations/NNNN_name.sql` files.
    pub async fn migrate(&self) -> Result<Vec<i64>> {
        run_migrations(&self.pool, Path::new("./migrations")).await
    }
}

/// `0003_prices.sql` -> `(3, "prices")`; anything else is ignored.
pub fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = stem[digits.len()..].strip_prefix('_')?;
    let version = digits.parse::<i64>().ok()?;
    Some((version, rest.to_string()))
}

/// Split out `CREATE INDEX CONCURRENTLY` statements, which Postgres refuses
/// inside the implicit transaction of a multi-statement script.
pub fn split_concurrent_indexes(sql: &str) -> (String, Vec<String>) {
    let mut transactional = String::with_capacity(sql.len());
    let mut concurrent = Vec::new();
    let mut buf = String::new();
    let mut capturing = false;
    for line in sql.lines() {
        let lowered = line.trim_start().to_lowercase();
        if !capturing && lowered.starts_with("create index concurrently") {
            capturing = true;
            buf.clear();
        }
        if capturing {
            buf.push_str(line);
            buf.push('\n');
            if line.contains(';') {
                capturing = false;
                concurrent.push(buf.trim().to_string());
            }
            continue;
        }
        transactional.push_str(line);
        transactional.push('\n');
    }
    (transactional, concurrent)
}

fn migration_candidates(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            candidates.push((version, desc, path));
        }
    }
    candidates.sort_by_key(|(v, _, _)| *v);
    Ok(candidates)
}

/// Lightweight runner tracked in `_sqlx_migrations`; raw SQL only so it
/// works behind a transaction pooler.
pub async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<Vec<i64>> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "migrations directory missing");
        return Ok(Vec::new());
    }
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _sqlx_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT,
            installed_at TIMESTAMPTZ DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;
    let mut applied: HashSet<i64> = HashSet::new();
    for r in sqlx::raw_sql("SELECT version FROM _sqlx_migrations")
        .fetch_all(pool)
        .await?
    {
        applied.insert(r.try_get::<i64, _>(0)?);
    }

    let mut newly_applied = Vec::new();
    for (version, desc, path) in migration_candidates(dir)? {
        if applied.contains(&version) {
            continue;
        }
        let sql = std::fs::read_to_string(&path)?;
        info!(version, file = ?path, "applying migration");
        let (transactional, concurrent) = split_concurrent_indexes(&sql);
        let trimmed = transactional.trim();
        if !trimmed.is_empty() {
            sqlx::raw_sql(trimmed).execute(pool).await?;
        }
        for stmt in concurrent {
            info!(migration_version = version, index_stmt = %stmt, "creating concurrent index");
            sqlx::raw_sql(&stmt).execute(pool).await?;
        }
        let insert_stmt = format!(
            "INSERT INTO _sqlx_migrations(version, description) VALUES ({}, '{}')",
            version,
            desc.replace('\'', "''")
        );
        sqlx::raw_sql(&insert_stmt).execute(pool).await?;
        applied.insert(version);
        newly_applied.push(version);
    }
    info!(applied = newly_applied.len(), "migrations up-to-date");
    Ok(newly_applied)
}
