//! Per-URL scrape path for marketplaces without a bulk pricelist.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use scraper::{Html, Selector};
use thiserror::Error;

use super::antibot::{detect_block, detect_captcha, AntiBot, RequestPlan};
use crate::catalog::reference::{SOURCE_CARDMARKET, SOURCE_TCGPLAYER};
use crate::catalog::{PriceObservation, PrintingRef};
use crate::error::UpstreamError;
use crate::normalization::price::parse_amount;
use crate::normalization::{variant, ConditionMapper, Currency};

/// Where a marketplace keeps its listing and how to read it.
#[derive(Debug, Clone)]
pub struct ScrapeProfile {
    pub source_code: &'static str,
    /// Placeholders: `{game}`, `{set_code}`, `{number}`, `{name_slug}`,
    /// `{set_name_slug}`, `{name_path}`, `{set_name_path}`.
    pub url_template: &'static str,
    /// Game code to the marketplace's path segment; unlisted games are not scraped.
    pub game_paths: &'static [(&'static str, &'static str)],
    pub price_selector: &'static str,
    pub condition_selector: Option<&'static str>,
    pub stock_selector: Option<&'static str>,
    pub title_selector: Option<&'static str>,
    /// Assumed when the price text carries no currency indicator.
    pub currency: Currency,
}

pub const TCGPLAYER_PROFILE: ScrapeProfile = ScrapeProfile {
    source_code: SOURCE_TCGPLAYER,
    url_template: "https://shop.tcgplayer.com/{game}/{set_name_slug}/{name_slug}",
    game_paths: &[("mtg", "magic"), ("pokemon", "pokemon")],
    price_selector: ".spotlight__price, .price-points__upper__price",
    condition_selector: Some(".spotlight__condition"),
    stock_selector: Some(".spotlight__quantity"),
    title_selector: Some("h1.product-details__name"),
    currency: Currency::Usd,
};

pub const CARDMARKET_PROFILE: ScrapeProfile = ScrapeProfile {
    source_code: SOURCE_CARDMARKET,
    url_template: "https://www.cardmarket.com/en/{game}/Products/Singles/{set_name_path}/{name_path}",
    game_paths: &[("mtg", "Magic"), ("pokemon", "Pokemon")],
    price_selector: ".article-row .price-container span.color-primary",
    condition_selector: Some(".article-row .article-condition"),
    stock_selector: Some(".article-row .amount-container span"),
    title_selector: Some("h1"),
    currency: Currency::Eur,
};

pub fn default_profiles() -> Vec<ScrapeProfile> {
    vec![TCGPLAYER_PROFILE, CARDMARKET_PROFILE]
}

fn name_words(raw: &str) -> Vec<String> {
    raw.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.replace('\'', ""))
        .filter(|w| !w.is_empty())
        .collect()
}

/// `Lightning Bolt` -> `lightning-bolt`
pub fn slug(raw: &str) -> String {
    name_words(raw).join("-").to_lowercase()
}

/// `commander masters` -> `Commander-Masters`
pub fn title_path(raw: &str) -> String {
    name_words(raw)
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

pub fn render_url(profile: &ScrapeProfile, printing: &PrintingRef) -> Option<String> {
    let game = profile
        .game_paths
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(&printing.game_code))?
        .1;
    Some(
        profile
            .url_template
            .replace("{game}", game)
            .replace("{set_code}", &printing.set_code)
            .replace("{number}", printing.collector_number.as_deref().unwrap_or_default())
            .replace("{name_slug}", &slug(&printing.name))
            .replace("{set_name_slug}", &slug(&printing.set_name))
            .replace("{name_path}", &title_path(&printing.name))
            .replace("{set_name_path}", &title_path(&printing.set_name)),
    )
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapedFields {
    pub price_text: Option<String>,
    pub condition_text: Option<String>,
    pub stock_text: Option<String>,
    pub title: Option<String>,
}

fn first_text(doc: &Html, selector: &str) -> Result<Option<String>, UpstreamError> {
    let sel = Selector::parse(selector)
        .map_err(|e| UpstreamError::Malformed(format!("bad selector {selector}: {e:?}")))?;
    Ok(doc
        .select(&sel)
        .map(|el| el.text().collect::<Vec<_>>().join(" ").trim().to_string())
        .find(|t| !t.is_empty()))
}

/// Apply a profile's selectors. The parsed document never leaves this
/// function, so callers can hold the result across awaits.
pub fn extract_fields(html: &str, profile: &ScrapeProfile) -> Result<ScrapedFields, UpstreamError> {
    let doc = Html::parse_document(html);
    let optional = |sel: Option<&str>| match sel {
        Some(s) => first_text(&doc, s),
        None => Ok(None),
    };
    Ok(ScrapedFields {
        price_text: first_text(&doc, profile.price_selector)?,
        condition_text: optional(profile.condition_selector)?,
        stock_text: optional(profile.stock_selector)?,
        title: optional(profile.title_selector)?,
    })
}

/// First integer in text like "12 available".
pub fn parse_stock(text: &str) -> Option<i32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

pub fn title_matches(title: &str, card_name: &str) -> bool {
    let title = title.to_lowercase();
    let name = card_name.to_lowercase();
    title.contains(&name) || strsim::jaro_winkler(&title, &name) >= 0.85
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, plan: &RequestPlan) -> Result<FetchedPage, UpstreamError>;
}

pub struct HttpFetcher {
    antibot: Arc<AntiBot>,
}

impl HttpFetcher {
    pub fn new(antibot: Arc<AntiBot>) -> Self {
        Self { antibot }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, plan: &RequestPlan) -> Result<FetchedPage, UpstreamError> {
        let client = self
            .antibot
            .client_for(plan)
            .map_err(|e| UpstreamError::transient(format!("client setup: {e}")))?;
        let resp = client
            .get(url)
            .header(reqwest::header::USER_AGENT, plan.user_agent.as_str())
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(FetchedPage { status, body })
    }
}

#[derive(Debug, Error)]
pub enum ScrapeFailure {
    #[error("game not listed on this marketplace")]
    Unsupported,
    #[error("captcha ({0})")]
    Captcha(&'static str),
    #[error("blocked (HTTP {0})")]
    Blocked(u16),
    #[error("listing not found")]
    NotFound,
    #[error("HTTP {0}")]
    Http(u16),
    #[error("no price on page")]
    NoPrice,
    #[error("{0} prices are not stored")]
    UnsupportedCurrency(Currency),
    #[error("page title {0:?} does not match the card")]
    TitleMismatch(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

pub struct Scraper {
    antibot: Arc<AntiBot>,
    fetcher: Arc<dyn PageFetcher>,
    conditions: ConditionMapper,
}

impl Scraper {
    pub fn new(antibot: Arc<AntiBot>, fetcher: Arc<dyn PageFetcher>, conditions: ConditionMapper) -> Self {
        Self {
            antibot,
            fetcher,
            conditions,
        }
    }

    /// Fetch one listing and turn it into an observation.
    pub async fn scrape(
        &self,
        profile: &ScrapeProfile,
        printing: &PrintingRef,
        source_id: i16,
    ) -> Result<PriceObservation, ScrapeFailure> {
        let url = render_url(profile, printing).ok_or(ScrapeFailure::Unsupported)?;
        let plan = self.antibot.prepare().await;
        let page = match self.fetcher.fetch(&url, &plan).await {
            Ok(p) => p,
            Err(e) => {
                self.antibot.report(&plan, false);
                return Err(e.into());
            }
        };

        if page.status != 200 {
            self.antibot.report(&plan, page.status == 404);
            if let Some(marker) = detect_captcha(&page.body) {
                return Err(ScrapeFailure::Captcha(marker));
            }
            if page.status == 404 {
                return Err(ScrapeFailure::NotFound);
            }
            if detect_block(page.status, &page.body) {
                return Err(ScrapeFailure::Blocked(page.status));
            }
            return Err(ScrapeFailure::Http(page.status));
        }

        let fields = extract_fields(&page.body, profile)?;
        let Some(price_text) = fields.price_text.as_deref() else {
            // a 200 without a price is usually an interstitial
            self.antibot.report(&plan, false);
            if let Some(marker) = detect_captcha(&page.body) {
                return Err(ScrapeFailure::Captcha(marker));
            }
            return Err(ScrapeFailure::NoPrice);
        };
        self.antibot.report(&plan, true);

        if let Some(title) = fields.title.as_deref() {
            if !title_matches(title, &printing.name) {
                return Err(ScrapeFailure::TitleMismatch(title.to_string()));
            }
        }
        let amount = parse_amount(price_text).ok_or(ScrapeFailure::NoPrice)?;
        let currency = Currency::detect(price_text).unwrap_or(profile.currency);
        let (price_usd, price_eur) = match currency {
            Currency::Usd => (Some(amount), None),
            Currency::Eur => (None, Some(amount)),
            other => return Err(ScrapeFailure::UnsupportedCurrency(other)),
        };

        let hints = variant::detect(
            Some(&url),
            fields.title.as_deref().or(Some(printing.name.as_str())),
            &printing.game_code,
        );
        let condition = self
            .conditions
            .map(profile.source_code, fields.condition_text.as_deref().unwrap_or_default());

        Ok(PriceObservation {
            printing_id: printing.printing_id.clone(),
            source_id,
            condition,
            price_usd,
            price_eur,
            stock_quantity: fields.stock_text.as_deref().and_then(parse_stock),
            is_foil: hints.foil_type.is_some() || (printing.is_foil && !printing.is_nonfoil),
            observed_at: Utc::now(),
            url: Some(url),
            variant: hints.to_value(),
        })
    }
}
