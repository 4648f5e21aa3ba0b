//! Bulk pricelist path: one provider-wide dump joined locally against the
//! catalog by registry id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rayon::prelude::*;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::error::UpstreamError;
use crate::sync::registry::get_json_bytes;

pub const CARDKINGDOM_PRICELIST_URL: &str = "https://api.cardkingdom.com/api/v2/pricelist";
pub const CARDKINGDOM_BASE_URL: &str = "https://www.cardkingdom.com/";

/// Provider-wide price dump.
#[async_trait]
pub trait PricelistProvider: Send + Sync {
    fn source_code(&self) -> &str;

    async fn download(&self) -> Result<Vec<u8>, UpstreamError>;

    fn parse(&self, bytes: &[u8]) -> Result<Vec<BulkRow>, UpstreamError>;
}

/// One priced offer keyed by the registry's printing id.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkRow {
    pub external_id: String,
    pub price_usd: f64,
    pub stock: Option<i32>,
    pub url: Option<String>,
    pub is_foil: bool,
}

fn value_as_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str().and_then(|s| s.trim().parse::<f64>().ok())
}

fn value_as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_i64() == Some(1),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct CardKingdomRow {
    #[serde(default)]
    scryfall_id: Option<String>,
    #[serde(default)]
    price_retail: Value,
    #[serde(default)]
    qty_retail: Value,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    is_foil: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CardKingdomDump {
    Wrapped { data: Vec<CardKingdomRow> },
    Bare(Vec<CardKingdomRow>),
}

/// Rows without a registry id or a positive retail price are dropped.
pub fn parse_cardkingdom(bytes: &[u8]) -> Result<Vec<BulkRow>, UpstreamError> {
    let dump: CardKingdomDump = serde_json::from_slice(bytes)?;
    let rows = match dump {
        CardKingdomDump::Wrapped { data } => data,
        CardKingdomDump::Bare(rows) => rows,
    };
    Ok(rows
        .into_par_iter()
        .filter_map(|r| {
            let external_id = r.scryfall_id.filter(|s| !s.trim().is_empty())?;
            let price = value_as_f64(&r.price_retail).filter(|p| *p > 0.0)?;
            Some(BulkRow {
                external_id: external_id.trim().to_ascii_lowercase(),
                price_usd: price,
                stock: value_as_f64(&r.qty_retail).map(|q| q as i32),
                url: r
                    .url
                    .filter(|u| !u.is_empty())
                    .map(|u| format!("{CARDKINGDOM_BASE_URL}{}", u.trim_start_matches('/'))),
                is_foil: value_as_bool(&r.is_foil),
            })
        })
        .collect())
}

/// Rows grouped by external id, non-foil offers first.
pub fn build_index(rows: Vec<BulkRow>) -> HashMap<String, Vec<BulkRow>> {
    let mut index = rows
        .into_par_iter()
        .fold(HashMap::new, |mut acc: HashMap<String, Vec<BulkRow>>, row| {
            acc.entry(row.external_id.clone()).or_default().push(row);
            acc
        })
        .reduce(HashMap::new, |mut a, b| {
            for (k, mut v) in b {
                a.entry(k).or_default().append(&mut v);
            }
            a
        });
    index.par_iter_mut().for_each(|(_, rows)| rows.sort_by_key(|r| r.is_foil));
    index
}

/// Offers held in a printing's registry `prices` snapshot
/// (`usd`, `usd_foil`, `usd_etched`).
pub fn snapshot_rows(printing_id: &str, prices: &Value) -> Vec<BulkRow> {
    [("usd", false), ("usd_foil", true), ("usd_etched", true)]
        .iter()
        .filter_map(|(key, foil)| {
            let price = prices.get(*key).and_then(value_as_f64).filter(|p| *p > 0.0)?;
            Some(BulkRow {
                external_id: printing_id.to_string(),
                price_usd: price,
                stock: None,
                url: None,
                is_foil: *foil,
            })
        })
        .collect()
}

pub struct CardKingdomPricelist {
    url: String,
    http: Client,
}

impl CardKingdomPricelist {
    pub fn new(url: Option<&str>, timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            url: url.unwrap_or(CARDKINGDOM_PRICELIST_URL).to_string(),
            http,
        })
    }
}

#[async_trait]
impl PricelistProvider for CardKingdomPricelist {
    fn source_code(&self) -> &str {
        crate::catalog::reference::SOURCE_CARDKINGDOM
    }

    async fn download(&self) -> Result<Vec<u8>, UpstreamError> {
        get_json_bytes(self.http.get(&self.url)).await
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<BulkRow>, UpstreamError> {
        parse_cardkingdom(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_both_dump_shapes() {
        let bare = br#"[
            {"scryfall_id": "ABC", "price_retail": "5.00", "qty_retail": 3, "url": "mtg/lea/bolt", "is_foil": "false"},
            {"scryfall_id": "abc", "price_retail": "9.50", "qty_retail": "1", "url": "mtg/lea/bolt-foil", "is_foil": "true"},
            {"scryfall_id": null, "price_retail": "1.00"},
            {"scryfall_id": "zero", "price_retail": "0.00"}
        ]"#;
        let rows = parse_cardkingdom(bare).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].external_id, "abc");
        assert_eq!(rows[0].stock, Some(3));
        assert_eq!(rows[0].url.as_deref(), Some("https://www.cardkingdom.com/mtg/lea/bolt"));

        let wrapped = br#"{"meta": {}, "data": [{"scryfall_id": "x", "price_retail": 2.5, "is_foil": true}]}"#;
        let rows = parse_cardkingdom(wrapped).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_foil);
        assert!(parse_cardkingdom(b"{\"nope\": 1}").is_err());
    }

    #[test]
    fn index_puts_nonfoil_first() {
        let rows = parse_cardkingdom(
            br#"[
            {"scryfall_id": "abc", "price_retail": "9.50", "is_foil": "true"},
            {"scryfall_id": "abc", "price_retail": "5.00", "is_foil": "false"}
        ]"#,
        )
        .unwrap();
        let index = build_index(rows);
        let offers = &index["abc"];
        assert_eq!(offers.len(), 2);
        assert!(!offers[0].is_foil);
    }

    #[test]
    fn snapshot_prices() {
        let rows = snapshot_rows("p1", &json!({"usd": "0.25", "usd_foil": null, "eur": "0.20"}));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].price_usd, 0.25);
        assert!(!rows[0].is_foil);
    }
}
