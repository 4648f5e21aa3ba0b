use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::registry::{get_json, CardRegistry, RegistryCard, RegistryPage};
use crate::catalog::{normalize_code, CardSet};
use crate::error::UpstreamError;

const PAGE_SIZE: u32 = 250;

/// Pokémon TCG API client. Cards have no oracle identity upstream, so the
/// logical card is keyed `pokemon:<name-slug>`.
#[derive(Debug, Clone)]
pub struct PokemonTcgClient {
    base_url: String,
    http: Client,
    api_key: Option<String>,
    page_delay: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PtcgList<T> {
    data: Vec<T>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    page_size: u32,
    #[serde(default)]
    total_count: u32,
}

#[derive(Debug, Deserialize)]
struct PtcgOne<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PtcgSet {
    id: String,
    name: String,
    #[serde(default)]
    series: Option<String>,
    #[serde(default)]
    printed_total: Option<i32>,
    #[serde(default)]
    total: Option<i32>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    images: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PtcgAttack {
    name: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PtcgSetRef {
    id: String,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PtcgCard {
    id: String,
    name: String,
    #[serde(default)]
    supertype: Option<String>,
    #[serde(default)]
    subtypes: Vec<String>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    rules: Vec<String>,
    #[serde(default)]
    attacks: Vec<PtcgAttack>,
    #[serde(default)]
    rarity: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    flavor_text: Option<String>,
    #[serde(default)]
    images: HashMap<String, String>,
    #[serde(default)]
    legalities: HashMap<String, String>,
    #[serde(default)]
    tcgplayer: Option<Value>,
    #[serde(default)]
    cardmarket: Option<Value>,
    set: PtcgSetRef,
}

/// Release dates come as `2023/03/31`.
fn parse_release(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    NaiveDate::parse_from_str(raw, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

pub fn name_slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

impl PtcgSet {
    fn into_set(self) -> CardSet {
        let is_promo = self.name.to_lowercase().contains("promo");
        CardSet {
            game_code: "pokemon".to_string(),
            set_code: normalize_code(&self.id),
            name: self.name,
            release_date: parse_release(self.release_date.as_deref()),
            card_count: self.total,
            printed_size: self.printed_total,
            set_type: self.series,
            is_digital: false,
            is_promo,
            icon_uri: self.images.get("symbol").cloned(),
        }
    }
}

impl PtcgCard {
    fn into_registry_card(self) -> RegistryCard {
        let type_line = match (self.supertype.as_deref(), self.subtypes.is_empty()) {
            (Some(sup), false) => Some(format!("{sup} — {}", self.subtypes.join(" "))),
            (Some(sup), true) => Some(sup.to_string()),
            (None, false) => Some(self.subtypes.join(" ")),
            (None, true) => None,
        };
        let mut text: Vec<String> = self.rules.clone();
        for a in &self.attacks {
            match a.text.as_deref().filter(|t| !t.is_empty()) {
                Some(t) => text.push(format!("{}: {t}", a.name)),
                None => text.push(a.name.clone()),
            }
        }
        let mut image_uris = HashMap::new();
        if let Some(large) = self.images.get("large") {
            image_uris.insert("normal".to_string(), large.clone());
        }
        if let Some(small) = self.images.get("small") {
            image_uris.insert("small".to_string(), small.clone());
        }
        let prices = match (&self.tcgplayer, &self.cardmarket) {
            (None, None) => None,
            (tp, cm) => Some(json!({ "tcgplayer": tp, "cardmarket": cm })),
        };
        let released_at = parse_release(self.set.release_date.as_deref()).map(|d| d.to_string());

        RegistryCard {
            id: self.id,
            oracle_id: Some(format!("pokemon:{}", name_slug(&self.name))),
            name: self.name,
            lang: Some("en".to_string()),
            released_at,
            type_line,
            oracle_text: if text.is_empty() { None } else { Some(text.join("\n")) },
            colors: Some(self.types),
            legalities: Some(
                self.legalities
                    .into_iter()
                    .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
                    .collect(),
            ),
            rarity: self.rarity,
            set: Some(self.set.id),
            collector_number: self.number,
            artist: self.artist,
            flavor_text: self.flavor_text,
            image_uris: Some(image_uris),
            prices,
            ..RegistryCard::default()
        }
    }
}

impl PokemonTcgClient {
    pub fn new(base_url: Option<&str>, timeout_secs: Option<u64>) -> Result<Self> {
        let base_url = base_url
            .unwrap_or("https://api.pokemontcg.io/v2")
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .user_agent(concat!("GeekoriumCatalogSync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs.unwrap_or(30)))
            .build()?;
        Ok(Self {
            base_url,
            http,
            api_key: None,
            page_delay: Duration::from_millis(100),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|s| !s.trim().is_empty());
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match self.api_key.as_deref() {
            Some(key) => req.header("X-Api-Key", key),
            None => req,
        }
    }
}

#[async_trait]
impl CardRegistry for PokemonTcgClient {
    fn game_code(&self) -> &str {
        "pokemon"
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    async fn list_sets(&self) -> Result<Vec<CardSet>, UpstreamError> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!("{}/sets?page={page}&pageSize={PAGE_SIZE}", self.base_url);
            let list: PtcgList<PtcgSet> = get_json(self.get(&url)).await?;
            let fetched = list.data.len();
            out.extend(list.data.into_iter().map(PtcgSet::into_set));
            if fetched == 0 || out.len() >= list.total_count as usize {
                break;
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }
        Ok(out)
    }

    async fn search_set_page(
        &self,
        set_code: &str,
        page: Option<&str>,
    ) -> Result<RegistryPage, UpstreamError> {
        let page_no: u32 = page.and_then(|p| p.parse().ok()).unwrap_or(1);
        let q = format!("set.id:{}", normalize_code(set_code));
        let url = format!(
            "{}/cards?q={}&page={page_no}&pageSize={PAGE_SIZE}",
            self.base_url,
            urlencoding::encode(&q)
        );
        let list: PtcgList<PtcgCard> = get_json(self.get(&url)).await?;
        // an unknown set answers with an empty first page rather than 404
        if page_no == 1 && list.data.is_empty() {
            return Err(UpstreamError::NotFound(url));
        }
        let page_size = if list.page_size == 0 { PAGE_SIZE } else { list.page_size };
        let current = if list.page == 0 { page_no } else { list.page };
        let has_more = current * page_size < list.total_count;
        Ok(RegistryPage {
            data: list
                .data
                .into_iter()
                .map(PtcgCard::into_registry_card)
                .collect(),
            has_more,
            next_page: has_more.then(|| (current + 1).to_string()),
        })
    }

    async fn card_by_collector(
        &self,
        set_code: &str,
        collector_number: &str,
    ) -> Result<RegistryCard, UpstreamError> {
        let id = format!("{}-{}", normalize_code(set_code), collector_number.trim());
        let url = format!("{}/cards/{}", self.base_url, urlencoding::encode(&id));
        let one: PtcgOne<PtcgCard> = get_json(self.get(&url)).await?;
        Ok(one.data.into_registry_card())
    }
}
