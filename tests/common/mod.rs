#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use geekorium_core::catalog::{
    CardSet, CatalogStore, Card, Condition, PriceObservation, Printing,
};
use geekorium_core::config::AppConfig;
use geekorium_core::error::UpstreamError;
use geekorium_core::harvest::{AntiBot, Harvester, HttpFetcher, PricelistCache, Scraper};
use geekorium_core::normalization::ConditionMapper;
use geekorium_core::retry::RetryPolicy;
use geekorium_core::sync::{CardRegistry, RegistryCard, RegistryPage};

pub fn set_row(game: &str, code: &str, release: Option<NaiveDate>) -> CardSet {
    CardSet {
        game_code: game.into(),
        set_code: code.into(),
        name: format!("Set {}", code.to_uppercase()),
        release_date: release,
        card_count: Some(1),
        printed_size: None,
        set_type: Some("expansion".into()),
        is_digital: false,
        is_promo: false,
        icon_uri: None,
    }
}

pub fn card_row(id: &str, game: &str, name: &str) -> Card {
    Card {
        card_id: id.into(),
        game_code: game.into(),
        name: name.into(),
        oracle_text: None,
        mana_cost: None,
        type_line: Some("Instant".into()),
        rarity: Some("common".into()),
        cmc: None,
        colors: vec![],
        color_identity: vec![],
        legalities: HashMap::new(),
    }
}

pub fn printing_row(id: &str, card_id: &str, game: &str, set_code: &str) -> Printing {
    Printing {
        printing_id: id.into(),
        card_id: card_id.into(),
        game_code: game.into(),
        set_code: set_code.into(),
        collector_number: Some("1".into()),
        rarity: Some("common".into()),
        image_url: None,
        artist: None,
        flavor_text: None,
        lang: Some("en".into()),
        released_at: None,
        card_faces: None,
        prices: None,
        is_foil: false,
        is_nonfoil: true,
        is_etched: false,
        treatments: vec![],
    }
}

pub fn observation(printing_id: &str, source_id: i16, price: f64, days_ago: i64) -> PriceObservation {
    PriceObservation {
        printing_id: printing_id.into(),
        source_id,
        condition: Condition::NearMint,
        price_usd: Some(price),
        price_eur: None,
        stock_quantity: None,
        is_foil: false,
        observed_at: Utc::now() - chrono::Duration::days(days_ago),
        url: None,
        variant: None,
    }
}

/// One MTG set, card and printing already in the store.
pub async fn seed_printing(store: &dyn CatalogStore, printing_id: &str, name: &str) {
    store
        .upsert_sets(&[set_row("mtg", "ecl", NaiveDate::from_ymd_opt(2024, 10, 1))])
        .await
        .unwrap();
    store
        .upsert_cards(&[card_row(&format!("oracle-{printing_id}"), "mtg", name)])
        .await
        .unwrap();
    store
        .upsert_printings(&[printing_row(printing_id, &format!("oracle-{printing_id}"), "mtg", "ecl")])
        .await
        .unwrap();
}

/// Harvester with no network-backed sources; only `scryfall` and
/// `geekorium` are runnable.
pub fn offline_harvester(store: Arc<dyn CatalogStore>, cache_dir: &Path) -> Harvester {
    let config = AppConfig::for_tests(cache_dir);
    let antibot = Arc::new(AntiBot::from_config(&config.scraping));
    let scraper = Scraper::new(
        antibot.clone(),
        Arc::new(HttpFetcher::new(antibot)),
        ConditionMapper::with_defaults(),
    );
    Harvester::new(
        store,
        PricelistCache::new(cache_dir, Duration::from_secs(3600)),
        scraper,
        RetryPolicy::immediate(0),
        100,
    )
}

/// In-memory registry for one game.
pub struct FakeRegistry {
    pub game: String,
    pub sets: Vec<CardSet>,
    pub cards: HashMap<String, Vec<RegistryCard>>,
    pub page_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(game: &str) -> Self {
        Self {
            game: game.into(),
            sets: Vec::new(),
            cards: HashMap::new(),
            page_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_set(mut self, set: CardSet, cards: Vec<RegistryCard>) -> Self {
        self.cards.insert(set.set_code.clone(), cards);
        self.sets.push(set);
        self
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

pub fn registry_card(id: &str, oracle_id: &str, name: &str, set_code: &str) -> RegistryCard {
    RegistryCard {
        id: id.into(),
        oracle_id: Some(oracle_id.into()),
        name: name.into(),
        lang: Some("en".into()),
        type_line: Some("Instant".into()),
        rarity: Some("common".into()),
        set: Some(set_code.into()),
        collector_number: Some("1".into()),
        finishes: vec!["nonfoil".into()],
        ..RegistryCard::default()
    }
}

#[async_trait]
impl CardRegistry for FakeRegistry {
    fn game_code(&self) -> &str {
        &self.game
    }

    fn page_delay(&self) -> Duration {
        Duration::ZERO
    }

    async fn list_sets(&self) -> Result<Vec<CardSet>, UpstreamError> {
        Ok(self.sets.clone())
    }

    async fn search_set_page(
        &self,
        set_code: &str,
        _page: Option<&str>,
    ) -> Result<RegistryPage, UpstreamError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        match self.cards.get(set_code) {
            Some(cards) => Ok(RegistryPage {
                data: cards.clone(),
                has_more: false,
                next_page: None,
            }),
            None => Err(UpstreamError::NotFound(format!("set {set_code}"))),
        }
    }

    async fn card_by_collector(
        &self,
        set_code: &str,
        collector_number: &str,
    ) -> Result<RegistryCard, UpstreamError> {
        self.cards
            .get(set_code)
            .and_then(|cards| {
                cards
                    .iter()
                    .find(|c| c.collector_number.as_deref() == Some(collector_number))
            })
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(format!("{set_code}/{collector_number}")))
    }
}
