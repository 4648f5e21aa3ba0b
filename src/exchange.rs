//! USD conversion for observations priced in other currencies.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::{info, instrument};

use crate::aggregation::round_cents;
use crate::catalog::PriceObservation;
use crate::normalization::Currency;

/// USD value of one unit of each currency.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRates {
    usd_per_unit: HashMap<Currency, f64>,
}

impl Default for ExchangeRates {
    fn default() -> Self {
        Self::new(1.08, 1.27)
    }
}

impl ExchangeRates {
    pub fn new(eur_usd: f64, gbp_usd: f64) -> Self {
        let mut usd_per_unit = HashMap::from([(Currency::Usd, 1.0)]);
        if eur_usd > 0.0 {
            usd_per_unit.insert(Currency::Eur, eur_usd);
        }
        if gbp_usd > 0.0 {
            usd_per_unit.insert(Currency::Gbp, gbp_usd);
        }
        Self { usd_per_unit }
    }

    pub fn rate(&self, currency: Currency) -> Option<f64> {
        self.usd_per_unit.get(&currency).copied()
    }

    pub fn to_usd(&self, amount: f64, currency: Currency) -> Option<f64> {
        self.rate(currency).map(|r| round_cents(amount * r))
    }

    /// Fill `price_usd` from `price_eur` when only the EUR price is known.
    /// Returns whether the row changed.
    pub fn fill_usd(&self, obs: &mut PriceObservation) -> bool {
        if obs.price_usd.is_some() {
            return false;
        }
        let Some(eur) = obs.price_eur else {
            return false;
        };
        obs.price_usd = self.to_usd(eur, Currency::Eur);
        obs.price_usd.is_some()
    }

    /// Overlay rates from a `{"rates": {"EUR": 0.92, ...}}` body quoted per
    /// one USD (the frankfurter.app shape).
    pub fn merge_quotes(&mut self, body: &Value) -> Result<usize> {
        let rates = body
            .get("rates")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow!("rates object missing"))?;
        let mut merged = 0;
        for (code, quote) in rates {
            let (Ok(currency), Some(quote)) = (code.parse::<Currency>(), quote.as_f64()) else {
                continue;
            };
            if quote > 0.0 && currency != Currency::Usd {
                self.usd_per_unit.insert(currency, 1.0 / quote);
                merged += 1;
            }
        }
        Ok(merged)
    }
}

pub struct ExchangeService {
    http: Client,
    url: String,
}

impl ExchangeService {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    /// Fetch current quotes and lay them over `base`.
    #[instrument(skip(self, base))]
    pub async fn refresh(&self, base: &ExchangeRates) -> Result<ExchangeRates> {
        let resp = self.http.get(&self.url).send().await?.error_for_status()?;
        let body: Value = resp.json().await?;
        let mut rates = base.clone();
        let merged = rates.merge_quotes(&body)?;
        info!(merged, "exchange rates refreshed");
        Ok(rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Condition;
    use chrono::Utc;
    use serde_json::json;

    fn eur_only(price: f64) -> PriceObservation {
        PriceObservation {
            printing_id: "p1".into(),
            source_id: 3,
            condition: Condition::NearMint,
            price_usd: None,
            price_eur: Some(price),
            stock_quantity: None,
            is_foil: false,
            observed_at: Utc::now(),
            url: None,
            variant: None,
        }
    }

    #[test]
    fn eur_rows_gain_a_usd_price() {
        let rates = ExchangeRates::new(1.1, 1.3);
        let mut obs = eur_only(2.75);
        assert!(rates.fill_usd(&mut obs));
        assert_eq!(obs.price_usd, Some(3.03));
        assert_eq!(obs.price_eur, Some(2.75));
        assert!(!rates.fill_usd(&mut obs));
    }

    #[test]
    fn quotes_per_usd_are_inverted() {
        let mut rates = ExchangeRates::default();
        let merged = rates
            .merge_quotes(&json!({"base": "USD", "rates": {"EUR": 0.8, "JPY": 150.0}}))
            .unwrap();
        assert_eq!(merged, 1);
        assert_eq!(rates.rate(Currency::Eur), Some(1.25));
        assert_eq!(rates.to_usd(10.0, Currency::Usd), Some(10.0));
        assert!(rates.merge_quotes(&json!({"error": "nope"})).is_err());
    }
}
