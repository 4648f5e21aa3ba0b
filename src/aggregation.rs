//! Price aggregation and the two-factor valuation read model.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::catalog::reference::{market_source, store_source};
use crate::catalog::{headline_price, AggregatedPrice, CatalogStore, Condition, PriceHistoryEntry};
use crate::error::StoreResult;

pub fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// First day inside a window of `window_days` days ending on `today`.
pub fn window_start(today: NaiveDate, window_days: u32) -> NaiveDate {
    today - ChronoDuration::days(i64::from(window_days.max(1)) - 1)
}

#[derive(Default)]
struct Acc {
    sum: f64,
    low: f64,
    high: f64,
    count: i64,
}

/// Group in-window rows by (printing, condition) and reduce to
/// average/min/max/count. Rows lacking a condition or a positive USD
/// price do not contribute.
pub fn reduce_window<'a, I>(rows: I, since: NaiveDate, now: DateTime<Utc>) -> Vec<AggregatedPrice>
where
    I: IntoIterator<Item = &'a PriceHistoryEntry>,
{
    let mut groups: BTreeMap<(String, Condition), Acc> = BTreeMap::new();
    for row in rows {
        if row.observed_on < since {
            continue;
        }
        let (Some(condition), Some(price)) = (row.condition, row.price_usd) else {
            continue;
        };
        if price <= 0.0 {
            continue;
        }
        let acc = groups
            .entry((row.printing_id.clone(), condition))
            .or_insert_with(|| Acc {
                low: f64::MAX,
                high: f64::MIN,
                ..Acc::default()
            });
        acc.sum += price;
        acc.low = acc.low.min(price);
        acc.high = acc.high.max(price);
        acc.count += 1;
    }
    groups
        .into_iter()
        .map(|((printing_id, condition), acc)| AggregatedPrice {
            printing_id,
            condition,
            avg_market_price_usd: round_cents(acc.sum / acc.count as f64),
            low_price_usd: round_cents(acc.low),
            high_price_usd: round_cents(acc.high),
            observation_count: acc.count,
            last_updated: now,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Valuation {
    pub printing_id: String,
    pub store_price: Option<f64>,
    pub market_price: Option<f64>,
    pub average: Option<f64>,
    pub store_from_aggregate: bool,
    pub market_from_aggregate: bool,
}

impl Valuation {
    /// Combine direct observations with the aggregate fallback.
    pub fn combine(
        printing_id: &str,
        store: Option<f64>,
        market: Option<f64>,
        aggregate: Option<f64>,
    ) -> Self {
        let store_price = store.or(aggregate);
        let market_price = market.or(aggregate);
        let average = match (store_price, market_price) {
            (Some(s), Some(m)) => Some(round_cents((s + m) / 2.0)),
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        };
        Self {
            printing_id: printing_id.to_string(),
            store_price,
            market_price,
            average,
            store_from_aggregate: store.is_none() && aggregate.is_some(),
            market_from_aggregate: market.is_none() && aggregate.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationSummary {
    pub since: NaiveDate,
    pub aggregates_written: u64,
}

pub struct AggregationEngine {
    store: Arc<dyn CatalogStore>,
    window_days: u32,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn CatalogStore>, window_days: u32) -> Self {
        Self {
            store,
            window_days: window_days.max(1),
        }
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    /// Recompute the window's aggregates and refresh the list view together.
    #[instrument(skip(self), fields(window_days = self.window_days))]
    pub async fn refresh_aggregates(&self) -> StoreResult<AggregationSummary> {
        let since = window_start(Utc::now().date_naive(), self.window_days);
        let written = self.store.refresh_catalog_views(since).await?;
        info!(%since, written, "aggregates and catalog view refreshed");
        Ok(AggregationSummary {
            since,
            aggregates_written: written,
        })
    }

    pub async fn valuation(&self, printing_id: &str) -> StoreResult<Valuation> {
        let mut batch = self.batch_valuation(&[printing_id.to_string()]).await?;
        Ok(batch.remove(printing_id).unwrap_or_else(|| {
            Valuation::combine(printing_id, None, None, None)
        }))
    }

    /// Two bulk reads for the direct prices plus one for the fallback,
    /// joined in memory.
    pub async fn batch_valuation(
        &self,
        printing_ids: &[String],
    ) -> StoreResult<HashMap<String, Valuation>> {
        if printing_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let store_prices = self
            .store
            .latest_prices(printing_ids, store_source().id)
            .await?;
        let market_prices = self
            .store
            .latest_prices(printing_ids, market_source().id)
            .await?;
        let aggregates = self.store.aggregates_for(printing_ids).await?;
        let mut by_printing: HashMap<&str, Vec<&AggregatedPrice>> = HashMap::new();
        for agg in &aggregates {
            by_printing
                .entry(agg.printing_id.as_str())
                .or_default()
                .push(agg);
        }
        Ok(printing_ids
            .iter()
            .map(|id| {
                let fallback = by_printing
                    .get(id.as_str())
                    .and_then(|aggs| headline_price(aggs.iter().copied()));
                let valuation = Valuation::combine(
                    id,
                    store_prices.get(id).map(|p| p.price_usd),
                    market_prices.get(id).map(|p| p.price_usd),
                    fallback,
                );
                (id.clone(), valuation)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, day: u32, cond: Option<Condition>, price: Option<f64>) -> PriceHistoryEntry {
        let on = NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        PriceHistoryEntry {
            id: i64::from(day),
            printing_id: id.to_string(),
            source_id: 1,
            condition: cond,
            price_usd: price,
            price_eur: None,
            stock_quantity: None,
            is_foil: false,
            observed_at: Some(Utc.from_utc_datetime(&on.and_hms_opt(12, 0, 0).unwrap())),
            observed_on: on,
            url: None,
            variant: None,
        }
    }

    #[test]
    fn five_day_window_reduces() {
        let now = Utc.with_ymd_and_hms(2025, 1, 5, 23, 0, 0).unwrap();
        let rows: Vec<_> = [10.0, 12.0, 11.0, 13.0, 14.0]
            .iter()
            .enumerate()
            .map(|(i, p)| entry("P1", i as u32 + 1, Some(Condition::NearMint), Some(*p)))
            .collect();
        let out = reduce_window(&rows, window_start(now.date_naive(), 7), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].avg_market_price_usd, 12.0);
        assert_eq!(out[0].low_price_usd, 10.0);
        assert_eq!(out[0].high_price_usd, 14.0);
        assert_eq!(out[0].observation_count, 5);
    }

    #[test]
    fn window_excludes_old_and_unusable_rows() {
        let now = Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap();
        let rows = vec![
            entry("P1", 1, Some(Condition::NearMint), Some(100.0)),
            entry("P1", 18, Some(Condition::NearMint), Some(4.0)),
            entry("P1", 19, None, Some(7.0)),
            entry("P1", 19, Some(Condition::LightlyPlayed), None),
        ];
        let out = reduce_window(&rows, window_start(now.date_naive(), 7), now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].avg_market_price_usd, 4.0);
    }

    #[test]
    fn window_start_is_inclusive() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 7).unwrap();
        assert_eq!(window_start(today, 7), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(window_start(today, 1), today);
    }

    #[test]
    fn valuation_falls_back_to_aggregate() {
        let both = Valuation::combine("p", Some(10.0), Some(12.0), Some(50.0));
        assert_eq!(both.average, Some(11.0));
        assert!(!both.store_from_aggregate);

        let market_only = Valuation::combine("p", None, Some(12.0), None);
        assert_eq!(market_only.average, Some(12.0));
        assert_eq!(market_only.store_price, None);

        let fallback = Valuation::combine("p", None, Some(12.0), Some(8.0));
        assert_eq!(fallback.store_price, Some(8.0));
        assert!(fallback.store_from_aggregate);
        assert_eq!(fallback.average, Some(10.0));

        assert_eq!(Valuation::combine("p", None, None, None).average, None);
    }
}
