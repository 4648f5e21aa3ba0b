//! Catalog store: games, sets, cards, printings, prices and aggregates.

pub mod memory;
pub mod model;
pub mod pg;
pub mod reference;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreResult;

pub use memory::MemoryCatalog;
pub use model::*;
pub use pg::PgCatalog;

/// Durable store behind every pipeline component.
///
/// Upserts are keyed on registry identifiers and must be called leaves
/// first (game, set, card, printing); a missing parent surfaces as
/// [`crate::error::StoreError::DependencyMissing`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Insert games, conditions and sources if absent.
    async fn seed_reference_data(&self) -> StoreResult<()>;

    async fn upsert_games(&self, rows: &[GameRow]) -> StoreResult<UpsertOutcome>;
    async fn upsert_sets(&self, rows: &[CardSet]) -> StoreResult<UpsertOutcome>;
    async fn upsert_cards(&self, rows: &[Card]) -> StoreResult<UpsertOutcome>;
    async fn upsert_printings(&self, rows: &[Printing]) -> StoreResult<UpsertOutcome>;

    /// Upsert on (printing, source, condition, day); an older observation
    /// never replaces a newer one.
    async fn insert_price_history(&self, rows: &[PriceObservation]) -> StoreResult<UpsertOutcome>;

    async fn upsert_aggregates(&self, rows: &[AggregatedPrice]) -> StoreResult<UpsertOutcome>;

    /// Reduce `price_history` rows observed on or after `since` into
    /// `aggregated_prices`. Returns the number of aggregate rows written.
    async fn refresh_aggregates(&self, since: NaiveDate) -> StoreResult<u64>;

    async fn refresh_materialized_views(&self) -> StoreResult<()>;

    /// Aggregates and the list view as one logical step.
    async fn refresh_catalog_views(&self, since: NaiveDate) -> StoreResult<u64> {
        let written = self.refresh_aggregates(since).await?;
        self.refresh_materialized_views().await?;
        Ok(written)
    }

    async fn list_games(&self) -> StoreResult<Vec<Game>>;
    async fn list_sets(&self, game_code: Option<&str>) -> StoreResult<Vec<SetWithGame>>;

    /// Sets of a game, optionally only those released on or after `since`,
    /// newest first.
    async fn sets_for_sync(
        &self,
        game_code: &str,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<CardSet>>;

    async fn list_printings(
        &self,
        filters: &PrintingFilters,
        sort: SortKey,
        limit: i64,
        offset: i64,
    ) -> StoreResult<PrintingPage>;

    async fn get_printing_detail(&self, printing_id: &str) -> StoreResult<Option<PrintingDetail>>;

    async fn printing_refs(&self, query: &PrintingRefQuery) -> StoreResult<Vec<PrintingRef>>;

    /// Latest positive USD price per printing from one source, any condition.
    async fn latest_prices(
        &self,
        printing_ids: &[String],
        source_id: i16,
    ) -> StoreResult<HashMap<String, LatestPrice>>;

    async fn aggregates_for(&self, printing_ids: &[String]) -> StoreResult<Vec<AggregatedPrice>>;

    /// Positive USD prices observed since `since`, per printing.
    async fn recent_prices(
        &self,
        printing_ids: &[String],
        since: NaiveDate,
    ) -> StoreResult<HashMap<String, Vec<f64>>>;

    async fn list_products(&self, filters: &ProductFilters) -> StoreResult<ProductPage>;
    async fn upsert_products(&self, rows: &[Product]) -> StoreResult<UpsertOutcome>;

    async fn stats(&self) -> StoreResult<CatalogStats>;

    async fn active_alerts(&self) -> StoreResult<Vec<PriceAlert>>;
    async fn mark_alert_triggered(
        &self,
        alert_id: i64,
        at: DateTime<Utc>,
        deactivate: bool,
    ) -> StoreResult<()>;
    async fn record_notification(&self, notification: &AlertNotification) -> StoreResult<()>;

    /// Fill missing condition (NM) and timestamp on legacy rows.
    async fn repair_price_history(&self) -> StoreResult<RepairSummary>;

    /// Give EUR-only rows a USD price at `eur_usd` per euro.
    async fn fill_usd_from_eur(&self, eur_usd: f64) -> StoreResult<u64>;

    /// Move rows observed before `cutoff` into the archive table.
    async fn archive_price_history(&self, cutoff: NaiveDate) -> StoreResult<u64>;

    async fn resolve_profile_role(&self, user_id: &str) -> StoreResult<Option<String>>;
}
