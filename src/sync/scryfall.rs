use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

use super::registry::{get_json, CardRegistry, RegistryCard, RegistryPage};
use crate::catalog::{normalize_code, CardSet};
use crate::error::UpstreamError;

/// Scryfall registry client for Magic: The Gathering.
/// Public API (base): https://api.scryfall.com/
///
/// Endpoints used:
/// - GET /sets
/// - GET /cards/search?q=e:<set>&unique=prints
/// - GET /cards/<set>/<number>
#[derive(Debug, Clone)]
pub struct ScryfallClient {
    base_url: String,
    http: Client,
    page_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct ScryfallList<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScryfallSet {
    code: String,
    name: String,
    #[serde(default)]
    released_at: Option<String>,
    #[serde(default)]
    card_count: Option<i32>,
    #[serde(default)]
    printed_size: Option<i32>,
    #[serde(default)]
    set_type: Option<String>,
    #[serde(default)]
    digital: bool,
    #[serde(default)]
    icon_svg_uri: Option<String>,
}

impl ScryfallSet {
    fn into_set(self) -> CardSet {
        let is_promo = self.set_type.as_deref() == Some("promo");
        CardSet {
            game_code: "mtg".to_string(),
            set_code: normalize_code(&self.code),
            name: self.name,
            release_date: self
                .released_at
                .as_deref()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            card_count: self.card_count,
            printed_size: self.printed_size,
            set_type: self.set_type,
            is_digital: self.digital,
            is_promo,
            icon_uri: self.icon_svg_uri,
        }
    }
}

impl ScryfallClient {
    pub fn new(base_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self> {
        let base_url = base_url
            .unwrap_or("https://api.scryfall.com")
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .user_agent(concat!("GeekoriumCatalogSync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs.unwrap_or(30)))
            .build()?;
        Ok(Self {
            base_url,
            http,
            page_delay: Duration::from_millis(100),
        })
    }

    fn search_url(&self, set_code: &str) -> Result<String, UpstreamError> {
        let mut url = url::Url::parse(&format!("{}/cards/search", self.base_url))
            .map_err(|e| UpstreamError::Malformed(format!("bad base url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("q", &format!("e:{}", normalize_code(set_code)))
            .append_pair("unique", "prints")
            .append_pair("order", "set")
            .append_pair("include_extras", "true")
            .append_pair("include_variations", "true");
        Ok(url.into())
    }
}

#[async_trait]
impl CardRegistry for ScryfallClient {
    fn game_code(&self) -> &str {
        "mtg"
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    async fn list_sets(&self) -> Result<Vec<CardSet>, UpstreamError> {
        let url = format!("{}/sets", self.base_url);
        let list: ScryfallList<ScryfallSet> = get_json(self.http.get(&url)).await?;
        Ok(list.data.into_iter().map(ScryfallSet::into_set).collect())
    }

    async fn search_set_page(
        &self,
        set_code: &str,
        page: Option<&str>,
    ) -> Result<RegistryPage, UpstreamError> {
        let url = match page {
            Some(next) => next.to_string(),
            None => self.search_url(set_code)?,
        };
        let list: ScryfallList<RegistryCard> = get_json(self.http.get(&url)).await?;
        Ok(RegistryPage {
            data: list.data,
            has_more: list.has_more,
            next_page: list.next_page,
        })
    }

    async fn card_by_collector(
        &self,
        set_code: &str,
        collector_number: &str,
    ) -> Result<RegistryCard, UpstreamError> {
        let url = format!(
            "{}/cards/{}/{}",
            self.base_url,
            urlencoding::encode(&normalize_code(set_code)),
            urlencoding::encode(collector_number.trim())
        );
        get_json(self.http.get(&url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_encodes_query() {
        let c = ScryfallClient::new(Some("https://example.test/"), None).unwrap();
        let url = c.search_url("ECL").unwrap();
        assert!(url.starts_with("https://example.test/cards/search?q=e%3Aecl"));
        assert!(url.contains("unique=prints"));
    }

    #[test]
    fn promo_sets_are_flagged() {
        let s: ScryfallSet = serde_json::from_value(serde_json::json!({
            "code": "PLST", "name": "The List", "set_type": "promo",
            "released_at": "2020-09-26", "card_count": 1000
        }))
        .unwrap();
        let set = s.into_set();
        assert_eq!(set.set_code, "plst");
        assert!(set.is_promo);
        assert_eq!(set.release_date, NaiveDate::from_ymd_opt(2020, 9, 26));
    }
}
