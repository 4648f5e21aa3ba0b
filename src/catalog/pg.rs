//! Postgres-backed catalog store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use super::model::*;
use super::reference;
use super::CatalogStore;
use crate::error::{StoreError, StoreResult};
use crate::util::db::Db;

/// Rows per statement; keeps every batch well under the 65535 bind limit.
const WRITE_CHUNK: usize = 1000;

/// Escape `%`, `_` and `\` for a LIKE/ILIKE pattern.
pub fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn tally(flags: &[bool]) -> UpsertOutcome {
    let inserted = flags.iter().filter(|f| **f).count() as u64;
    UpsertOutcome {
        inserted,
        updated: flags.len() as u64 - inserted,
    }
}

fn legalities_from(value: Value) -> HashMap<String, String> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect(),
        _ => HashMap::new(),
    }
}

fn condition_from(id: i16) -> Result<Condition, sqlx::Error> {
    Condition::from_id(id).ok_or_else(|| sqlx::Error::Decode(format!("unknown condition_id {id}").into()))
}

fn aggregate_from_row(row: &PgRow) -> Result<AggregatedPrice, sqlx::Error> {
    Ok(AggregatedPrice {
        printing_id: row.try_get("printing_id")?,
        condition: condition_from(row.try_get("condition_id")?)?,
        avg_market_price_usd: row.try_get("avg_usd")?,
        low_price_usd: row.try_get("low_usd")?,
        high_price_usd: row.try_get("high_usd")?,
        observation_count: row.try_get("observation_count")?,
        last_updated: row.try_get("last_updated")?,
    })
}

const AGGREGATE_COLUMNS: &str = "printing_id, condition_id, avg_market_price_usd::float8 AS avg_usd, \
     low_price_usd::float8 AS low_usd, high_price_usd::float8 AS high_usd, \
     observation_count::int8 AS observation_count, last_updated";

fn set_from_row(row: &PgRow) -> Result<CardSet, sqlx::Error> {
    Ok(CardSet {
        game_code: row.try_get("game_code")?,
        set_code: row.try_get("set_code")?,
        name: row.try_get("set_name")?,
        release_date: row.try_get("release_date")?,
        card_count: row.try_get("card_count")?,
        printed_size: row.try_get("printed_size")?,
        set_type: row.try_get("set_type")?,
        is_digital: row.try_get("is_digital")?,
        is_promo: row.try_get("is_promo")?,
        icon_uri: row.try_get("icon_uri")?,
    })
}

const SET_COLUMNS: &str = "g.code AS game_code, s.set_code, s.name AS set_name, s.release_date, \
     s.card_count, s.printed_size, s.set_type, s.is_digital, s.is_promo, s.icon_uri";

fn list_item_from_row(row: &PgRow) -> Result<PrintingListItem, sqlx::Error> {
    Ok(PrintingListItem {
        printing_id: row.try_get("printing_id")?,
        card_id: row.try_get("card_id")?,
        name: row.try_get("name")?,
        type_line: row.try_get("type_line")?,
        game_code: row.try_get("game_code")?,
        set_code: row.try_get("set_code")?,
        set_name: row.try_get("set_name")?,
        collector_number: row.try_get("collector_number")?,
        rarity: row.try_get("rarity")?,
        colors: row.try_get("colors")?,
        image_url: row.try_get("image_url")?,
        price: row.try_get("price")?,
        released_at: row.try_get("released_at")?,
    })
}

fn push_printing_filters(qb: &mut QueryBuilder<'_, Postgres>, f: &PrintingFilters) {
    qb.push(" WHERE TRUE");
    if let Some(q) = &f.q {
        qb.push(" AND name ILIKE ")
            .push_bind(format!("%{}%", escape_like(q)));
    }
    if !f.games.is_empty() {
        qb.push(" AND game_code = ANY(").push_bind(f.games.clone()).push(")");
    }
    if !f.sets.is_empty() {
        qb.push(" AND set_code = ANY(").push_bind(f.sets.clone()).push(")");
    }
    if !f.rarities.is_empty() {
        qb.push(" AND rarity = ANY(").push_bind(f.rarities.clone()).push(")");
    }
    if !f.colors.is_empty() {
        qb.push(" AND colors && ").push_bind(f.colors.clone());
    }
    if !f.types.is_empty() {
        qb.push(" AND (");
        for (i, t) in f.types.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("type_line ILIKE ")
                .push_bind(format!("%{}%", escape_like(t)));
        }
        qb.push(")");
    }
}

fn printing_order(sort: SortKey) -> &'static str {
    match sort {
        SortKey::Name => " ORDER BY name COLLATE \"C\", printing_id COLLATE \"C\"",
        SortKey::PriceAsc => " ORDER BY price ASC NULLS LAST, printing_id COLLATE \"C\"",
        SortKey::PriceDesc => " ORDER BY price DESC NULLS LAST, printing_id COLLATE \"C\"",
        SortKey::Newest => " ORDER BY released_at DESC NULLS LAST, printing_id COLLATE \"C\"",
    }
}

fn push_product_filters(qb: &mut QueryBuilder<'_, Postgres>, f: &ProductFilters) {
    qb.push(" WHERE TRUE");
    if let Some(q) = f.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        qb.push(" AND name ILIKE ")
            .push_bind(format!("%{}%", escape_like(q)));
    }
    if let Some(game) = &f.game {
        qb.push(" AND lower(game_code) = ")
            .push_bind(normalize_code(game));
    }
    match f.in_stock {
        Some(true) => {
            qb.push(" AND stock > 0");
        }
        Some(false) => {
            qb.push(" AND stock <= 0");
        }
        None => {}
    }
    if f.linked_only {
        qb.push(" AND printing_id IS NOT NULL");
    }
}

fn product_order(sort: ProductSort) -> &'static str {
    match sort {
        ProductSort::Name => " ORDER BY name COLLATE \"C\", product_id",
        ProductSort::PriceAsc => " ORDER BY price ASC, product_id",
        ProductSort::PriceDesc => " ORDER BY price DESC, product_id",
        ProductSort::Newest => " ORDER BY updated_at DESC, product_id",
        ProductSort::Stock => " ORDER BY stock DESC, product_id",
    }
}

/// Reduce the window into `aggregated_prices` and drop aggregates whose
/// history is gone.
async fn aggregate_into(conn: &mut PgConnection, since: NaiveDate) -> Result<u64, sqlx::Error> {
    let written = sqlx::query(
        "INSERT INTO aggregated_prices
            (printing_id, condition_id, avg_market_price_usd, low_price_usd, high_price_usd,
             observation_count, last_updated)
         SELECT printing_id, condition_id, ROUND(AVG(price_usd), 2), MIN(price_usd), MAX(price_usd),
                COUNT(*), now()
         FROM price_history
         WHERE observed_on >= $1 AND condition_id IS NOT NULL AND price_usd > 0
         GROUP BY printing_id, condition_id
         ON CONFLICT (printing_id, condition_id) DO UPDATE SET
            avg_market_price_usd = EXCLUDED.avg_market_price_usd,
            low_price_usd = EXCLUDED.low_price_usd,
            high_price_usd = EXCLUDED.high_price_usd,
            observation_count = EXCLUDED.observation_count,
            last_updated = EXCLUDED.last_updated",
    )
    .bind(since)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    let dropped = sqlx::query(
        "DELETE FROM aggregated_prices a
         WHERE NOT EXISTS (
            SELECT 1 FROM price_history h
            WHERE h.printing_id = a.printing_id AND h.condition_id = a.condition_id)",
    )
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if dropped > 0 {
        debug!(dropped, "dropped aggregates without history");
    }
    Ok(written)
}

#[derive(Clone)]
pub struct PgCatalog {
    db: Db,
}

impl PgCatalog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    async fn game_ids(&self, codes: Vec<String>) -> StoreResult<HashMap<String, i32>> {
        let rows = sqlx::query("SELECT code, game_id FROM games WHERE code = ANY($1)")
            .bind(codes)
            .fetch_all(&self.db.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.insert(r.try_get::<String, _>("code")?, r.try_get::<i32, _>("game_id")?);
        }
        Ok(out)
    }

    async fn set_ids(
        &self,
        games: Vec<String>,
        sets: Vec<String>,
    ) -> StoreResult<HashMap<(String, String), i32>> {
        let rows = sqlx::query(
            "SELECT g.code, s.set_code, s.set_id
             FROM sets s JOIN games g ON g.game_id = s.game_id
             WHERE g.code = ANY($1) AND s.set_code = ANY($2)",
        )
        .bind(games)
        .bind(sets)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.insert(
                (r.try_get::<String, _>("code")?, r.try_get::<String, _>("set_code")?),
                r.try_get::<i32, _>("set_id")?,
            );
        }
        Ok(out)
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn seed_reference_data(&self) -> StoreResult<()> {
        let mut tx = self.db.pool.begin().await?;
        for c in reference::conditions() {
            sqlx::query(
                "INSERT INTO conditions (condition_id, code, name, sort_order) VALUES ($1, $2, $3, $1)
                 ON CONFLICT (condition_id) DO UPDATE SET code = EXCLUDED.code, name = EXCLUDED.name",
            )
            .bind(c.id())
            .bind(c.code())
            .bind(c.label())
            .execute(&mut *tx)
            .await?;
        }
        for s in reference::SOURCES {
            sqlx::query(
                "INSERT INTO sources (source_id, code, name, kind, currency) VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (source_id) DO UPDATE SET
                    code = EXCLUDED.code, name = EXCLUDED.name,
                    kind = EXCLUDED.kind, currency = EXCLUDED.currency",
            )
            .bind(s.id)
            .bind(s.code)
            .bind(s.name)
            .bind(s.kind.as_str())
            .bind(s.currency)
            .execute(&mut *tx)
            .await?;
        }
        for g in reference::GAMES {
            sqlx::query("INSERT INTO games (code, name) VALUES ($1, $2) ON CONFLICT (code) DO NOTHING")
                .bind(g.code)
                .bind(g.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!("reference data seeded");
        Ok(())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_games(&self, rows: &[GameRow]) -> StoreResult<UpsertOutcome> {
        let unique: IndexMap<String, &GameRow> =
            rows.iter().map(|r| (normalize_code(&r.code), r)).collect();
        let unique: Vec<(String, &GameRow)> = unique.into_iter().collect();
        let mut outcome = UpsertOutcome::default();
        for chunk in unique.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO games (code, name, is_active) ");
            qb.push_values(chunk, |mut b, (code, r)| {
                b.push_bind(code.clone())
                    .push_bind(r.name.clone())
                    .push_bind(r.is_active);
            });
            qb.push(
                " ON CONFLICT (code) DO UPDATE SET name = EXCLUDED.name,
                   is_active = EXCLUDED.is_active, updated_at = now()
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_sets(&self, rows: &[CardSet]) -> StoreResult<UpsertOutcome> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let unique: IndexMap<(String, String), &CardSet> = rows
            .iter()
            .map(|r| ((normalize_code(&r.game_code), normalize_code(&r.set_code)), r))
            .collect();
        let codes: Vec<String> = unique.keys().map(|(g, _)| g.clone()).collect();
        let game_ids = self.game_ids(codes).await?;
        let mut bound = Vec::with_capacity(unique.len());
        for ((game_code, set_code), r) in unique {
            let game_id = *game_ids
                .get(&game_code)
                .ok_or_else(|| StoreError::DependencyMissing(format!("game {game_code}")))?;
            bound.push((game_id, set_code, r));
        }
        let mut outcome = UpsertOutcome::default();
        for chunk in bound.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO sets (game_id, set_code, name, release_date, card_count, printed_size,
                   set_type, is_digital, is_promo, icon_uri) ",
            );
            qb.push_values(chunk, |mut b, (game_id, set_code, r)| {
                b.push_bind(*game_id)
                    .push_bind(set_code.clone())
                    .push_bind(r.name.clone())
                    .push_bind(r.release_date)
                    .push_bind(r.card_count)
                    .push_bind(r.printed_size)
                    .push_bind(r.set_type.clone())
                    .push_bind(r.is_digital)
                    .push_bind(r.is_promo)
                    .push_bind(r.icon_uri.clone());
            });
            qb.push(
                " ON CONFLICT (game_id, set_code) DO UPDATE SET
                    name = EXCLUDED.name,
                    release_date = EXCLUDED.release_date,
                    card_count = EXCLUDED.card_count,
                    printed_size = EXCLUDED.printed_size,
                    set_type = EXCLUDED.set_type,
                    is_digital = EXCLUDED.is_digital,
                    is_promo = EXCLUDED.is_promo,
                    icon_uri = EXCLUDED.icon_uri,
                    updated_at = now()
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_cards(&self, rows: &[Card]) -> StoreResult<UpsertOutcome> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let unique: IndexMap<&str, &Card> = rows.iter().map(|r| (r.card_id.as_str(), r)).collect();
        let codes: Vec<String> = unique.values().map(|r| normalize_code(&r.game_code)).collect();
        let game_ids = self.game_ids(codes).await?;
        let mut bound = Vec::with_capacity(unique.len());
        for r in unique.into_values() {
            let game_code = normalize_code(&r.game_code);
            let game_id = *game_ids
                .get(&game_code)
                .ok_or_else(|| StoreError::DependencyMissing(format!("game {game_code}")))?;
            bound.push((game_id, r));
        }
        let mut outcome = UpsertOutcome::default();
        for chunk in bound.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO cards (card_id, game_id, name, oracle_text, mana_cost, type_line, rarity,
                   cmc, colors, color_identity, legalities) ",
            );
            qb.push_values(chunk, |mut b, (game_id, r)| {
                b.push_bind(r.card_id.clone())
                    .push_bind(*game_id)
                    .push_bind(r.name.clone())
                    .push_bind(r.oracle_text.clone())
                    .push_bind(r.mana_cost.clone())
                    .push_bind(r.type_line.clone())
                    .push_bind(r.rarity.clone())
                    .push_bind(r.cmc)
                    .push_bind(r.colors.clone())
                    .push_bind(r.color_identity.clone())
                    .push_bind(Json(r.legalities.clone()));
            });
            // game_id is part of the card's identity and is never rewritten
            qb.push(
                " ON CONFLICT (card_id) DO UPDATE SET
                    name = EXCLUDED.name,
                    oracle_text = EXCLUDED.oracle_text,
                    mana_cost = EXCLUDED.mana_cost,
                    type_line = EXCLUDED.type_line,
                    rarity = EXCLUDED.rarity,
                    cmc = EXCLUDED.cmc,
                    colors = EXCLUDED.colors,
                    color_identity = EXCLUDED.color_identity,
                    legalities = EXCLUDED.legalities,
                    updated_at = now()
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_printings(&self, rows: &[Printing]) -> StoreResult<UpsertOutcome> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }
        let unique: IndexMap<&str, &Printing> =
            rows.iter().map(|r| (r.printing_id.as_str(), r)).collect();
        let games: Vec<String> = unique.values().map(|r| normalize_code(&r.game_code)).collect();
        let sets: Vec<String> = unique.values().map(|r| normalize_code(&r.set_code)).collect();
        let set_ids = self.set_ids(games, sets).await?;
        let mut bound = Vec::with_capacity(unique.len());
        for r in unique.into_values() {
            let key = (normalize_code(&r.game_code), normalize_code(&r.set_code));
            let set_id = *set_ids.get(&key).ok_or_else(|| {
                StoreError::DependencyMissing(format!("set {}/{}", key.0, key.1))
            })?;
            bound.push((set_id, key.1, r));
        }
        let mut outcome = UpsertOutcome::default();
        for chunk in bound.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO card_printings (printing_id, card_id, set_id, set_code, collector_number,
                   rarity, image_url, artist, flavor_text, lang, released_at, card_faces, prices,
                   is_foil, is_nonfoil, is_etched, treatments) ",
            );
            qb.push_values(chunk, |mut b, (set_id, set_code, r)| {
                b.push_bind(r.printing_id.clone())
                    .push_bind(r.card_id.clone())
                    .push_bind(*set_id)
                    .push_bind(set_code.clone())
                    .push_bind(r.collector_number.clone())
                    .push_bind(r.rarity.clone())
                    .push_bind(r.image_url.clone())
                    .push_bind(r.artist.clone())
                    .push_bind(r.flavor_text.clone())
                    .push_bind(r.lang.clone())
                    .push_bind(r.released_at)
                    .push_bind(r.card_faces.clone())
                    .push_bind(r.prices.clone())
                    .push_bind(r.is_foil)
                    .push_bind(r.is_nonfoil)
                    .push_bind(r.is_etched)
                    .push_bind(r.treatments.clone());
            });
            qb.push(
                " ON CONFLICT (printing_id) DO UPDATE SET
                    card_id = EXCLUDED.card_id,
                    set_id = EXCLUDED.set_id,
                    set_code = EXCLUDED.set_code,
                    collector_number = EXCLUDED.collector_number,
                    rarity = EXCLUDED.rarity,
                    image_url = EXCLUDED.image_url,
                    artist = EXCLUDED.artist,
                    flavor_text = EXCLUDED.flavor_text,
                    lang = EXCLUDED.lang,
                    released_at = EXCLUDED.released_at,
                    card_faces = EXCLUDED.card_faces,
                    prices = EXCLUDED.prices,
                    is_foil = EXCLUDED.is_foil,
                    is_nonfoil = EXCLUDED.is_nonfoil,
                    is_etched = EXCLUDED.is_etched,
                    treatments = EXCLUDED.treatments,
                    updated_at = now()
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_price_history(&self, rows: &[PriceObservation]) -> StoreResult<UpsertOutcome> {
        let rows = dedupe_observations(rows.to_vec());
        let mut outcome = UpsertOutcome::default();
        for chunk in rows.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO price_history (printing_id, source_id, condition_id, price_usd, price_eur,
                   stock_quantity, is_foil, observed_at, observed_on, url, variant) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.printing_id.clone())
                    .push_bind(r.source_id)
                    .push_bind(r.condition.id())
                    .push_bind(r.price_usd)
                    .push_bind(r.price_eur)
                    .push_bind(r.stock_quantity)
                    .push_bind(r.is_foil)
                    .push_bind(r.observed_at)
                    .push_bind(r.observed_on())
                    .push_bind(r.url.clone())
                    .push_bind(r.variant.clone());
            });
            qb.push(
                " ON CONFLICT ON CONSTRAINT price_history_day_key DO UPDATE SET
                    price_usd = EXCLUDED.price_usd,
                    price_eur = EXCLUDED.price_eur,
                    stock_quantity = EXCLUDED.stock_quantity,
                    is_foil = EXCLUDED.is_foil,
                    observed_at = EXCLUDED.observed_at,
                    url = EXCLUDED.url,
                    variant = EXCLUDED.variant
                 WHERE price_history.observed_at IS NULL
                    OR price_history.observed_at <= EXCLUDED.observed_at
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_aggregates(&self, rows: &[AggregatedPrice]) -> StoreResult<UpsertOutcome> {
        let unique: IndexMap<(&str, Condition), &AggregatedPrice> = rows
            .iter()
            .map(|r| ((r.printing_id.as_str(), r.condition), r))
            .collect();
        let unique: Vec<&AggregatedPrice> = unique.into_values().collect();
        let mut outcome = UpsertOutcome::default();
        for chunk in unique.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO aggregated_prices (printing_id, condition_id, avg_market_price_usd,
                   low_price_usd, high_price_usd, observation_count, last_updated) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.printing_id.clone())
                    .push_bind(r.condition.id())
                    .push_bind(r.avg_market_price_usd)
                    .push_bind(r.low_price_usd)
                    .push_bind(r.high_price_usd)
                    .push_bind(r.observation_count as i32)
                    .push_bind(r.last_updated);
            });
            qb.push(
                " ON CONFLICT (printing_id, condition_id) DO UPDATE SET
                    avg_market_price_usd = EXCLUDED.avg_market_price_usd,
                    low_price_usd = EXCLUDED.low_price_usd,
                    high_price_usd = EXCLUDED.high_price_usd,
                    observation_count = EXCLUDED.observation_count,
                    last_updated = EXCLUDED.last_updated
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn refresh_aggregates(&self, since: NaiveDate) -> StoreResult<u64> {
        let mut conn = self.db.pool.acquire().await?;
        Ok(aggregate_into(&mut conn, since).await?)
    }

    #[instrument(skip(self))]
    async fn refresh_materialized_views(&self) -> StoreResult<()> {
        sqlx::query("REFRESH MATERIALIZED VIEW mv_printing_catalog")
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// One transaction: readers see either the old aggregates and view or the new pair.
    #[instrument(skip(self))]
    async fn refresh_catalog_views(&self, since: NaiveDate) -> StoreResult<u64> {
        let mut tx = self.db.pool.begin().await?;
        let written = aggregate_into(&mut tx, since).await?;
        sqlx::query("REFRESH MATERIALIZED VIEW mv_printing_catalog")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn list_games(&self) -> StoreResult<Vec<Game>> {
        let rows = sqlx::query("SELECT game_id, code, name, is_active FROM games ORDER BY game_id")
            .fetch_all(&self.db.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(Game {
                game_id: r.try_get("game_id")?,
                code: r.try_get("code")?,
                name: r.try_get("name")?,
                is_active: r.try_get("is_active")?,
            });
        }
        Ok(out)
    }

    async fn list_sets(&self, game_code: Option<&str>) -> StoreResult<Vec<SetWithGame>> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {SET_COLUMNS}, g.name AS game_name, g.is_active AS game_is_active
             FROM sets s JOIN games g ON g.game_id = s.game_id"
        ));
        if let Some(code) = game_code {
            qb.push(" WHERE g.code = ").push_bind(normalize_code(code));
        }
        qb.push(" ORDER BY s.release_date DESC NULLS LAST, s.set_code");
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            out.push(SetWithGame {
                set: set_from_row(r)?,
                game_name: r.try_get("game_name")?,
                game_is_active: r.try_get("game_is_active")?,
            });
        }
        Ok(out)
    }

    async fn sets_for_sync(
        &self,
        game_code: &str,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<CardSet>> {
        let rows = sqlx::query(&format!(
            "SELECT {SET_COLUMNS}
             FROM sets s JOIN games g ON g.game_id = s.game_id
             WHERE g.code = $1 AND ($2::date IS NULL OR s.release_date >= $2)
             ORDER BY s.release_date DESC NULLS LAST, s.set_code"
        ))
        .persistent(false)
        .bind(normalize_code(game_code))
        .bind(since)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            out.push(set_from_row(r)?);
        }
        Ok(out)
    }

    #[instrument(skip(self, filters))]
    async fn list_printings(
        &self,
        filters: &PrintingFilters,
        sort: SortKey,
        limit: i64,
        offset: i64,
    ) -> StoreResult<PrintingPage> {
        let filters = filters.normalized();

        let mut count_qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM mv_printing_catalog");
        push_printing_filters(&mut count_qb, &filters);
        let total_count: i64 = count_qb
            .build_query_scalar()
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT printing_id, card_id, name, type_line, game_code, set_code, set_name,
                    collector_number, rarity, colors, image_url, price, released_at
             FROM mv_printing_catalog",
        );
        push_printing_filters(&mut qb, &filters);
        qb.push(printing_order(sort));
        qb.push(" LIMIT ").push_bind(limit.max(0));
        qb.push(" OFFSET ").push_bind(offset.max(0));
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        let mut items = Vec::with_capacity(rows.len());
        for r in &rows {
            items.push(list_item_from_row(r)?);
        }
        Ok(PrintingPage { items, total_count })
    }

    async fn get_printing_detail(&self, printing_id: &str) -> StoreResult<Option<PrintingDetail>> {
        let row = sqlx::query(&format!(
            "SELECT cp.printing_id, cp.card_id, cp.collector_number, cp.rarity AS printing_rarity,
                    cp.image_url, cp.artist, cp.flavor_text, cp.lang, cp.released_at, cp.card_faces,
                    cp.prices, cp.is_foil, cp.is_nonfoil, cp.is_etched, cp.treatments,
                    c.name, c.oracle_text, c.mana_cost, c.type_line, c.rarity AS card_rarity, c.cmc,
                    c.colors, c.color_identity, c.legalities,
                    {SET_COLUMNS}
             FROM card_printings cp
             JOIN cards c ON c.card_id = cp.card_id
             JOIN sets s ON s.set_id = cp.set_id
             JOIN games g ON g.game_id = s.game_id
             WHERE cp.printing_id = $1"
        ))
        .persistent(false)
        .bind(printing_id)
        .fetch_optional(&self.db.pool)
        .await?;
        let Some(r) = row else {
            return Ok(None);
        };
        let set = set_from_row(&r)?;
        let card = Card {
            card_id: r.try_get("card_id")?,
            game_code: set.game_code.clone(),
            name: r.try_get("name")?,
            oracle_text: r.try_get("oracle_text")?,
            mana_cost: r.try_get("mana_cost")?,
            type_line: r.try_get("type_line")?,
            rarity: r.try_get("card_rarity")?,
            cmc: r.try_get("cmc")?,
            colors: r.try_get("colors")?,
            color_identity: r.try_get("color_identity")?,
            legalities: legalities_from(r.try_get("legalities")?),
        };
        let printing = Printing {
            printing_id: r.try_get("printing_id")?,
            card_id: card.card_id.clone(),
            game_code: set.game_code.clone(),
            set_code: set.set_code.clone(),
            collector_number: r.try_get("collector_number")?,
            rarity: r.try_get("printing_rarity")?,
            image_url: r.try_get("image_url")?,
            artist: r.try_get("artist")?,
            flavor_text: r.try_get("flavor_text")?,
            lang: r.try_get("lang")?,
            released_at: r.try_get("released_at")?,
            card_faces: r.try_get("card_faces")?,
            prices: r.try_get("prices")?,
            is_foil: r.try_get("is_foil")?,
            is_nonfoil: r.try_get("is_nonfoil")?,
            is_etched: r.try_get("is_etched")?,
            treatments: r.try_get("treatments")?,
        };
        let aggregates = self.aggregates_for(&[printing_id.to_string()]).await?;
        Ok(Some(PrintingDetail {
            printing,
            card,
            set,
            aggregates,
        }))
    }

    async fn printing_refs(&self, query: &PrintingRefQuery) -> StoreResult<Vec<PrintingRef>> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT cp.printing_id, cp.card_id, c.name, g.code AS game_code, cp.set_code,
                    s.name AS set_name, cp.collector_number, cp.is_foil, cp.is_nonfoil, cp.prices
             FROM card_printings cp
             JOIN cards c ON c.card_id = cp.card_id
             JOIN sets s ON s.set_id = cp.set_id
             JOIN games g ON g.game_id = s.game_id
             WHERE TRUE",
        );
        if let Some(after) = &query.after {
            qb.push(" AND cp.printing_id COLLATE \"C\" > ")
                .push_bind(after.clone());
        }
        if let Some(game) = &query.game_code {
            qb.push(" AND g.code = ").push_bind(normalize_code(game));
        }
        if let Some(ids) = &query.ids {
            qb.push(" AND cp.printing_id = ANY(")
                .push_bind(ids.clone())
                .push(")");
        }
        if let Some((source_id, since)) = query.stale_for {
            qb.push(
                " AND NOT EXISTS (SELECT 1 FROM price_history h
                   WHERE h.printing_id = cp.printing_id AND h.source_id = ",
            )
            .push_bind(source_id)
            .push(" AND COALESCE(h.observed_at, h.observed_on::timestamp AT TIME ZONE 'UTC') >= ")
            .push_bind(since)
            .push(")");
        }
        qb.push(" ORDER BY cp.printing_id COLLATE \"C\" LIMIT ")
            .push_bind(query.limit.max(0));
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(PrintingRef {
                printing_id: r.try_get("printing_id")?,
                card_id: r.try_get("card_id")?,
                name: r.try_get("name")?,
                game_code: r.try_get("game_code")?,
                set_code: r.try_get("set_code")?,
                set_name: r.try_get("set_name")?,
                collector_number: r.try_get("collector_number")?,
                is_foil: r.try_get("is_foil")?,
                is_nonfoil: r.try_get("is_nonfoil")?,
                prices: r.try_get("prices")?,
            });
        }
        Ok(out)
    }

    async fn latest_prices(
        &self,
        printing_ids: &[String],
        source_id: i16,
    ) -> StoreResult<HashMap<String, LatestPrice>> {
        if printing_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT DISTINCT ON (printing_id)
                    printing_id, price_usd::float8 AS price_usd,
                    COALESCE(observed_at, observed_on::timestamp AT TIME ZONE 'UTC') AS seen_at
             FROM price_history
             WHERE source_id = $1 AND printing_id = ANY($2) AND price_usd > 0
             ORDER BY printing_id, seen_at DESC",
        )
        .bind(source_id)
        .bind(printing_ids)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for r in rows {
            out.insert(
                r.try_get::<String, _>("printing_id")?,
                LatestPrice {
                    price_usd: r.try_get("price_usd")?,
                    observed_at: r.try_get("seen_at")?,
                },
            );
        }
        Ok(out)
    }

    async fn aggregates_for(&self, printing_ids: &[String]) -> StoreResult<Vec<AggregatedPrice>> {
        if printing_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregated_prices
             WHERE printing_id = ANY($1) ORDER BY printing_id, condition_id"
        ))
        .persistent(false)
        .bind(printing_ids)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            out.push(aggregate_from_row(r)?);
        }
        Ok(out)
    }

    async fn recent_prices(
        &self,
        printing_ids: &[String],
        since: NaiveDate,
    ) -> StoreResult<HashMap<String, Vec<f64>>> {
        if printing_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT printing_id, price_usd::float8 AS price_usd FROM price_history
             WHERE printing_id = ANY($1) AND observed_on >= $2 AND price_usd > 0",
        )
        .bind(printing_ids)
        .bind(since)
        .fetch_all(&self.db.pool)
        .await?;
        let mut out: HashMap<String, Vec<f64>> = HashMap::new();
        for r in rows {
            out.entry(r.try_get("printing_id")?)
                .or_default()
                .push(r.try_get("price_usd")?);
        }
        Ok(out)
    }

    async fn list_products(&self, filters: &ProductFilters) -> StoreResult<ProductPage> {
        let mut count_qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM products");
        push_product_filters(&mut count_qb, filters);
        let total_count: i64 = count_qb
            .build_query_scalar()
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT product_id, name, game_code, set_code, price::float8 AS price, stock,
                    image_url, rarity, printing_id, updated_at
             FROM products",
        );
        push_product_filters(&mut qb, filters);
        qb.push(product_order(filters.sort));
        qb.push(" LIMIT ").push_bind(filters.limit.max(0));
        qb.push(" OFFSET ").push_bind(filters.offset.max(0));
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        let mut items = Vec::with_capacity(rows.len());
        for r in rows {
            items.push(Product {
                product_id: r.try_get("product_id")?,
                name: r.try_get("name")?,
                game_code: r.try_get("game_code")?,
                set_code: r.try_get("set_code")?,
                price: r.try_get("price")?,
                stock: r.try_get("stock")?,
                image_url: r.try_get("image_url")?,
                rarity: r.try_get("rarity")?,
                printing_id: r.try_get("printing_id")?,
                updated_at: r.try_get("updated_at")?,
            });
        }
        Ok(ProductPage { items, total_count })
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_products(&self, rows: &[Product]) -> StoreResult<UpsertOutcome> {
        let unique: IndexMap<i64, &Product> = rows.iter().map(|r| (r.product_id, r)).collect();
        let unique: Vec<&Product> = unique.into_values().collect();
        let mut outcome = UpsertOutcome::default();
        for chunk in unique.chunks(WRITE_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO products (product_id, name, game_code, set_code, price, stock, image_url,
                   rarity, printing_id, updated_at) ",
            );
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.product_id)
                    .push_bind(r.name.clone())
                    .push_bind(r.game_code.clone())
                    .push_bind(r.set_code.clone())
                    .push_bind(r.price)
                    .push_bind(r.stock)
                    .push_bind(r.image_url.clone())
                    .push_bind(r.rarity.clone())
                    .push_bind(r.printing_id.clone())
                    .push_bind(r.updated_at);
            });
            qb.push(
                " ON CONFLICT (product_id) DO UPDATE SET
                    name = EXCLUDED.name, game_code = EXCLUDED.game_code, set_code = EXCLUDED.set_code,
                    price = EXCLUDED.price, stock = EXCLUDED.stock, image_url = EXCLUDED.image_url,
                    rarity = EXCLUDED.rarity, printing_id = EXCLUDED.printing_id,
                    updated_at = EXCLUDED.updated_at
                 RETURNING (xmax = 0) AS inserted",
            );
            let flags: Vec<bool> = qb
                .build_query_scalar()
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
            outcome += tally(&flags);
        }
        Ok(outcome)
    }

    async fn stats(&self) -> StoreResult<CatalogStats> {
        let r = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM games) AS games,
                (SELECT COUNT(*) FROM sets) AS sets,
                (SELECT COUNT(*) FROM cards) AS cards,
                (SELECT COUNT(*) FROM card_printings) AS printings,
                (SELECT COUNT(*) FROM price_history) AS price_history,
                (SELECT COUNT(*) FROM aggregated_prices) AS aggregates,
                (SELECT COUNT(*) FROM products) AS products,
                (SELECT COUNT(*) FROM profiles) AS users",
        )
        .fetch_one(&self.db.pool)
        .await?;
        Ok(CatalogStats {
            games: r.try_get("games")?,
            sets: r.try_get("sets")?,
            cards: r.try_get("cards")?,
            printings: r.try_get("printings")?,
            price_history: r.try_get("price_history")?,
            aggregates: r.try_get("aggregates")?,
            products: r.try_get("products")?,
            users: r.try_get("users")?,
        })
    }

    async fn active_alerts(&self) -> StoreResult<Vec<PriceAlert>> {
        let rows = sqlx::query(
            "SELECT alert_id, user_id::text AS user_id, printing_id, condition_id, alert_type,
                    target_price::float8 AS target_price, is_active, is_recurring,
                    last_triggered_at, created_at
             FROM price_alerts WHERE is_active ORDER BY alert_id",
        )
        .fetch_all(&self.db.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let raw_type: String = r.try_get("alert_type")?;
            let Some(alert_type) = AlertType::parse(&raw_type) else {
                tracing::warn!(alert_type = %raw_type, "skipping alert with unknown type");
                continue;
            };
            out.push(PriceAlert {
                alert_id: r.try_get("alert_id")?,
                user_id: r.try_get("user_id")?,
                printing_id: r.try_get("printing_id")?,
                condition: condition_from(r.try_get("condition_id")?)?,
                alert_type,
                target_price: r.try_get("target_price")?,
                is_active: r.try_get("is_active")?,
                is_recurring: r.try_get("is_recurring")?,
                last_triggered_at: r.try_get("last_triggered_at")?,
                created_at: r.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn mark_alert_triggered(
        &self,
        alert_id: i64,
        at: DateTime<Utc>,
        deactivate: bool,
    ) -> StoreResult<()> {
        let affected = sqlx::query(
            "UPDATE price_alerts
             SET last_triggered_at = $2,
                 is_active = CASE WHEN $3 THEN FALSE ELSE is_active END
             WHERE alert_id = $1",
        )
        .bind(alert_id)
        .bind(at)
        .bind(deactivate)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound(format!("alert {alert_id}")));
        }
        Ok(())
    }

    async fn record_notification(&self, n: &AlertNotification) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO alert_notifications
                (alert_id, user_id, printing_id, alert_type, target_price, current_price, triggered_at)
             VALUES ($1, $2::uuid, $3, $4, $5, $6, $7)",
        )
        .bind(n.alert_id)
        .bind(&n.user_id)
        .bind(&n.printing_id)
        .bind(n.alert_type.as_str())
        .bind(n.target_price)
        .bind(n.current_price)
        .bind(n.triggered_at)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn repair_price_history(&self) -> StoreResult<RepairSummary> {
        let mut tx = self.db.pool.begin().await?;
        let duplicates_removed = sqlx::query(
            "DELETE FROM price_history h
             WHERE h.condition_id IS NULL AND EXISTS (
                SELECT 1 FROM price_history o
                WHERE o.condition_id = 1 AND o.printing_id = h.printing_id
                  AND o.source_id = h.source_id AND o.observed_on = h.observed_on)",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let conditions_filled =
            sqlx::query("UPDATE price_history SET condition_id = 1 WHERE condition_id IS NULL")
                .execute(&mut *tx)
                .await?
                .rows_affected();
        let timestamps_filled = sqlx::query(
            "UPDATE price_history SET observed_at = observed_on::timestamp AT TIME ZONE 'UTC'
             WHERE observed_at IS NULL",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(RepairSummary {
            conditions_filled,
            timestamps_filled,
            duplicates_removed,
        })
    }

    #[instrument(skip(self))]
    async fn fill_usd_from_eur(&self, eur_usd: f64) -> StoreResult<u64> {
        let filled = sqlx::query(
            "UPDATE price_history SET price_usd = ROUND(price_eur * $1::numeric, 2)
             WHERE price_usd IS NULL AND price_eur > 0",
        )
        .bind(eur_usd)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        Ok(filled)
    }

    #[instrument(skip(self))]
    async fn archive_price_history(&self, cutoff: NaiveDate) -> StoreResult<u64> {
        let moved = sqlx::query(
            "WITH moved AS (
                DELETE FROM price_history WHERE observed_on < $1 RETURNING *
             )
             INSERT INTO price_history_archive
                (id, printing_id, source_id, condition_id, price_usd, price_eur, stock_quantity,
                 is_foil, observed_at, observed_on, url, variant)
             SELECT id, printing_id, source_id, condition_id, price_usd, price_eur, stock_quantity,
                    is_foil, observed_at, observed_on, url, variant
             FROM moved
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(cutoff)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        Ok(moved)
    }

    async fn resolve_profile_role(&self, user_id: &str) -> StoreResult<Option<String>> {
        let Ok(id) = uuid::Uuid::parse_str(user_id) else {
            return Ok(None);
        };
        let role: Option<String> = sqlx::query_scalar("SELECT role FROM profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(role)
    }
}
