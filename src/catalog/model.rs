//! Row and projection types shared by every catalog store implementation.

use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical form for game, set and rarity codes.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Canonical form for color symbols (`w` -> `W`).
pub fn normalize_color(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameRow {
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Game {
    pub game_id: i32,
    pub code: String,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CardSet {
    pub game_code: String,
    pub set_code: String,
    pub name: String,
    pub release_date: Option<NaiveDate>,
    pub card_count: Option<i32>,
    pub printed_size: Option<i32>,
    pub set_type: Option<String>,
    pub is_digital: bool,
    pub is_promo: bool,
    pub icon_uri: Option<String>,
}

/// Set projection joined with its game for the sets endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetWithGame {
    #[serde(flatten)]
    pub set: CardSet,
    pub game_name: String,
    pub game_is_active: bool,
}

/// Logical card. `card_id` is the registry's oracle identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Card {
    pub card_id: String,
    pub game_code: String,
    pub name: String,
    pub oracle_text: Option<String>,
    pub mana_cost: Option<String>,
    pub type_line: Option<String>,
    pub rarity: Option<String>,
    pub cmc: Option<f64>,
    pub colors: Vec<String>,
    pub color_identity: Vec<String>,
    /// format name -> legality status
    pub legalities: HashMap<String, String>,
}

/// Physical printing. `printing_id` is the registry's printing identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Printing {
    pub printing_id: String,
    pub card_id: String,
    pub game_code: String,
    pub set_code: String,
    pub collector_number: Option<String>,
    pub rarity: Option<String>,
    pub image_url: Option<String>,
    pub artist: Option<String>,
    pub flavor_text: Option<String>,
    pub lang: Option<String>,
    pub released_at: Option<NaiveDate>,
    pub card_faces: Option<Value>,
    pub prices: Option<Value>,
    pub is_foil: bool,
    pub is_nonfoil: bool,
    pub is_etched: bool,
    pub treatments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "NM")]
    NearMint,
    #[serde(rename = "LP")]
    LightlyPlayed,
    #[serde(rename = "MP")]
    ModeratelyPlayed,
    #[serde(rename = "HP")]
    HeavilyPlayed,
    #[serde(rename = "DM")]
    Damaged,
}

impl Condition {
    pub const ALL: [Condition; 5] = [
        Condition::NearMint,
        Condition::LightlyPlayed,
        Condition::ModeratelyPlayed,
        Condition::HeavilyPlayed,
        Condition::Damaged,
    ];

    /// Stable numeric identity, also the sort order.
    pub fn id(self) -> i16 {
        match self {
            Condition::NearMint => 1,
            Condition::LightlyPlayed => 2,
            Condition::ModeratelyPlayed => 3,
            Condition::HeavilyPlayed => 4,
            Condition::Damaged => 5,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.id() == id)
    }

    pub fn code(self) -> &'static str {
        match self {
            Condition::NearMint => "NM",
            Condition::LightlyPlayed => "LP",
            Condition::ModeratelyPlayed => "MP",
            Condition::HeavilyPlayed => "HP",
            Condition::Damaged => "DM",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Condition::NearMint => "Near Mint",
            Condition::LightlyPlayed => "Lightly Played",
            Condition::ModeratelyPlayed => "Moderately Played",
            Condition::HeavilyPlayed => "Heavily Played",
            Condition::Damaged => "Damaged",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.code().eq_ignore_ascii_case(code))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// One provider-wide pricelist joined locally.
    Bulk,
    /// Per-URL HTML pages.
    Scrape,
    /// Prices owned by the store itself.
    Internal,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Bulk => "bulk",
            SourceKind::Scrape => "scrape",
            SourceKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: i16,
    pub code: String,
    pub name: String,
    pub kind: SourceKind,
    pub currency: String,
}

/// One harvested observation ready to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub printing_id: String,
    pub source_id: i16,
    pub condition: Condition,
    pub price_usd: Option<f64>,
    pub price_eur: Option<f64>,
    pub stock_quantity: Option<i32>,
    pub is_foil: bool,
    pub observed_at: DateTime<Utc>,
    pub url: Option<String>,
    pub variant: Option<Value>,
}

impl PriceObservation {
    pub fn observed_on(&self) -> NaiveDate {
        self.observed_at.date_naive()
    }

    pub fn day_key(&self) -> (String, i16, Condition, NaiveDate) {
        (
            self.printing_id.clone(),
            self.source_id,
            self.condition,
            self.observed_on(),
        )
    }
}

/// Collapse rows that share (printing, source, condition, day) so a single
/// upsert statement never touches one key twice. Non-foil wins over foil,
/// then the later observation wins. Input order is otherwise kept.
pub fn dedupe_observations(rows: Vec<PriceObservation>) -> Vec<PriceObservation> {
    let mut index: HashMap<(String, i16, Condition, NaiveDate), usize> = HashMap::new();
    let mut out: Vec<PriceObservation> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.day_key()) {
            Some(&slot) => {
                let cur = &out[slot];
                let better = (cur.is_foil && !row.is_foil)
                    || (cur.is_foil == row.is_foil && row.observed_at >= cur.observed_at);
                if better {
                    out[slot] = row;
                }
            }
            None => {
                index.insert(row.day_key(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// A stored `price_history` row. Legacy writers may leave condition or
/// timestamp empty; the nightly repair pass fills them in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub id: i64,
    pub printing_id: String,
    pub source_id: i16,
    pub condition: Option<Condition>,
    pub price_usd: Option<f64>,
    pub price_eur: Option<f64>,
    pub stock_quantity: Option<i32>,
    pub is_foil: bool,
    pub observed_at: Option<DateTime<Utc>>,
    pub observed_on: NaiveDate,
    pub url: Option<String>,
    pub variant: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub printing_id: String,
    pub condition: Condition,
    pub avg_market_price_usd: f64,
    pub low_price_usd: f64,
    pub high_price_usd: f64,
    pub observation_count: i64,
    pub last_updated: DateTime<Utc>,
}

/// Headline price for a printing: the NM average, otherwise the cheapest
/// condition average.
pub fn headline_price<'a, I>(aggregates: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a AggregatedPrice>,
{
    let mut nm = None;
    let mut cheapest: Option<f64> = None;
    for agg in aggregates {
        if agg.condition == Condition::NearMint {
            nm = Some(agg.avg_market_price_usd);
        }
        cheapest = Some(match cheapest {
            Some(c) => c.min(agg.avg_market_price_usd),
            None => agg.avg_market_price_usd,
        });
    }
    nm.or(cheapest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Name,
    PriceAsc,
    PriceDesc,
    Newest,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "name" => Ok(SortKey::Name),
            "price_asc" | "price" => Ok(SortKey::PriceAsc),
            "price_desc" => Ok(SortKey::PriceDesc),
            "newest" | "release" | "released_at" => Ok(SortKey::Newest),
            other => Err(format!("unknown sort key: {other}")),
        }
    }
}

/// Filters for the printing list. Dimensions combine with AND, values
/// within one dimension with OR. Empty vectors mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrintingFilters {
    pub q: Option<String>,
    pub games: Vec<String>,
    pub sets: Vec<String>,
    pub rarities: Vec<String>,
    pub colors: Vec<String>,
    pub types: Vec<String>,
}

impl PrintingFilters {
    /// Lower/upper-case the code dimensions and drop blanks.
    pub fn normalized(&self) -> Self {
        fn clean(values: &[String], f: fn(&str) -> String) -> Vec<String> {
            values
                .iter()
                .map(|v| f(v))
                .filter(|v| !v.is_empty())
                .collect()
        }
        Self {
            q: self
                .q
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string),
            games: clean(&self.games, normalize_code),
            sets: clean(&self.sets, normalize_code),
            rarities: clean(&self.rarities, normalize_code),
            colors: clean(&self.colors, normalize_color),
            types: clean(&self.types, |t| t.trim().to_string()),
        }
    }
}

/// Row of the denormalized catalog view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintingListItem {
    pub printing_id: String,
    pub card_id: String,
    pub name: String,
    pub type_line: Option<String>,
    pub game_code: String,
    pub set_code: String,
    pub set_name: String,
    pub collector_number: Option<String>,
    pub rarity: Option<String>,
    pub colors: Vec<String>,
    pub image_url: Option<String>,
    pub price: Option<f64>,
    pub released_at: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintingPage {
    pub items: Vec<PrintingListItem>,
    pub total_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintingDetail {
    pub printing: Printing,
    pub card: Card,
    pub set: CardSet,
    pub aggregates: Vec<AggregatedPrice>,
}

/// Minimal printing projection the harvesters iterate over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintingRef {
    pub printing_id: String,
    pub card_id: String,
    pub name: String,
    pub game_code: String,
    pub set_code: String,
    pub set_name: String,
    pub collector_number: Option<String>,
    pub is_foil: bool,
    pub is_nonfoil: bool,
    pub prices: Option<Value>,
}

/// Keyset-paginated selection of printings.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintingRefQuery {
    /// Return printings with id strictly greater than this.
    pub after: Option<String>,
    pub limit: i64,
    pub game_code: Option<String>,
    pub ids: Option<Vec<String>>,
    /// Only printings without an observation from this source at or after the instant.
    pub stale_for: Option<(i16, DateTime<Utc>)>,
}

impl PrintingRefQuery {
    pub fn all(limit: i64) -> Self {
        Self {
            after: None,
            limit,
            game_code: None,
            ids: None,
            stale_for: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatestPrice {
    pub price_usd: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: i64,
    pub name: String,
    pub game_code: String,
    pub set_code: Option<String>,
    pub price: f64,
    pub stock: i32,
    pub image_url: Option<String>,
    pub rarity: Option<String>,
    pub printing_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductSort {
    #[default]
    Name,
    PriceAsc,
    PriceDesc,
    Newest,
    Stock,
}

impl FromStr for ProductSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "name" => Ok(ProductSort::Name),
            "price_asc" | "price" => Ok(ProductSort::PriceAsc),
            "price_desc" => Ok(ProductSort::PriceDesc),
            "newest" => Ok(ProductSort::Newest),
            "stock" => Ok(ProductSort::Stock),
            other => Err(format!("unknown sort key: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductFilters {
    pub q: Option<String>,
    pub game: Option<String>,
    pub in_stock: Option<bool>,
    /// Only lines linked to a catalog printing.
    pub linked_only: bool,
    pub sort: ProductSort,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPage {
    pub items: Vec<Product>,
    pub total_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Below,
    Above,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::Below => "below",
            AlertType::Above => "above",
        }
    }

    /// Accepts the comparison shorthands older rows were written with.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "below" | "lt" | "lte" => Some(AlertType::Below),
            "above" | "gt" | "gte" => Some(AlertType::Above),
            _ => None,
        }
    }

    pub fn is_met(self, current: f64, target: f64) -> bool {
        match self {
            AlertType::Below => current <= target,
            AlertType::Above => current >= target,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub alert_id: i64,
    pub user_id: String,
    pub printing_id: String,
    pub condition: Condition,
    pub alert_type: AlertType,
    pub target_price: f64,
    pub is_active: bool,
    pub is_recurring: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_id: i64,
    pub user_id: String,
    pub printing_id: String,
    pub alert_type: AlertType,
    pub target_price: f64,
    pub current_price: f64,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub games: i64,
    pub sets: i64,
    pub cards: i64,
    pub printings: i64,
    pub price_history: i64,
    pub aggregates: i64,
    pub products: i64,
    pub users: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSummary {
    pub conditions_filled: u64,
    pub timestamps_filled: u64,
    /// Condition-less rows dropped because an NM row already held their key.
    pub duplicates_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(id: &str, foil: bool, hour: u32, price: f64) -> PriceObservation {
        PriceObservation {
            printing_id: id.to_string(),
            source_id: 1,
            condition: Condition::NearMint,
            price_usd: Some(price),
            price_eur: None,
            stock_quantity: None,
            is_foil: foil,
            observed_at: Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap(),
            url: None,
            variant: None,
        }
    }

    #[test]
    fn condition_ids_are_stable() {
        for c in Condition::ALL {
            assert_eq!(Condition::from_id(c.id()), Some(c));
            assert_eq!(Condition::from_code(&c.code().to_lowercase()), Some(c));
        }
        assert_eq!(Condition::from_id(9), None);
    }

    #[test]
    fn dedupe_prefers_nonfoil_then_latest() {
        let rows = vec![
            obs("a", true, 1, 9.0),
            obs("a", false, 2, 4.0),
            obs("a", false, 3, 5.0),
            obs("a", true, 4, 11.0),
            obs("b", true, 1, 2.0),
        ];
        let out = dedupe_observations(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].price_usd, Some(5.0));
        assert_eq!(out[1].printing_id, "b");
    }

    #[test]
    fn alert_comparisons_are_inclusive() {
        assert!(AlertType::Below.is_met(10.0, 10.0));
        assert!(AlertType::Below.is_met(8.5, 10.0));
        assert!(!AlertType::Below.is_met(10.5, 10.0));
        assert!(AlertType::Above.is_met(10.0, 10.0));
        assert_eq!(AlertType::parse("LT"), Some(AlertType::Below));
        assert_eq!(AlertType::parse("sideways"), None);
    }

    #[test]
    fn headline_prefers_near_mint() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let agg = |c, avg| AggregatedPrice {
            printing_id: "p".into(),
            condition: c,
            avg_market_price_usd: avg,
            low_price_usd: avg,
            high_price_usd: avg,
            observation_count: 1,
            last_updated: at,
        };
        let both = [agg(Condition::LightlyPlayed, 3.0), agg(Condition::NearMint, 5.0)];
        assert_eq!(headline_price(&both), Some(5.0));
        let played = [agg(Condition::HeavilyPlayed, 2.0), agg(Condition::LightlyPlayed, 3.0)];
        assert_eq!(headline_price(&played), Some(2.0));
        assert_eq!(headline_price(&[]), None);
    }
}
