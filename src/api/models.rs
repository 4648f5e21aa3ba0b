// API request/response models (DTOs)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregation::Valuation;
use crate::catalog::{AggregatedPrice, Card, CardSet, Printing, PrintingFilters, PrintingListItem};

/// Envelope for admin and webhook responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub database: String,
}

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 250;

/// Clamp `limit`/`offset` query values.
pub fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> (i64, i64) {
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = offset.unwrap_or(0).max(0);
    (limit, offset)
}

/// Comma-separated query value into its parts.
fn split_csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Default, Deserialize)]
pub struct CardsQuery {
    pub q: Option<String>,
    pub game: Option<String>,
    pub set: Option<String>,
    pub rarity: Option<String>,
    pub color: Option<String>,
    #[serde(rename = "type")]
    pub type_line: Option<String>,
    pub sort: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl CardsQuery {
    pub fn filters(&self) -> PrintingFilters {
        PrintingFilters {
            q: self.q.clone(),
            games: split_csv(&self.game),
            sets: split_csv(&self.set),
            rarities: split_csv(&self.rarity),
            colors: split_csv(&self.color),
            types: split_csv(&self.type_line),
        }
    }
}

/// One row of `GET /api/cards`. `card_id` carries the printing id.
#[derive(Debug, Serialize, Deserialize)]
pub struct CardSummary {
    pub card_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_line: Option<String>,
    pub set: String,
    pub set_name: String,
    pub game: String,
    pub collector_number: Option<String>,
    pub price: Option<f64>,
    pub image_url: Option<String>,
    pub rarity: Option<String>,
}

impl From<PrintingListItem> for CardSummary {
    fn from(item: PrintingListItem) -> Self {
        Self {
            card_id: item.printing_id,
            name: item.name,
            type_line: item.type_line,
            set: item.set_code,
            set_name: item.set_name,
            game: item.game_code,
            collector_number: item.collector_number,
            price: item.price,
            image_url: item.image_url,
            rarity: item.rarity,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CardsResponse {
    pub cards: Vec<CardSummary>,
    pub total_count: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct CardDetailResponse {
    pub card_id: String,
    pub printing: Printing,
    pub card: Card,
    pub set: CardSet,
    pub aggregates: Vec<AggregatedPrice>,
    pub valuation: Valuation,
}

#[derive(Debug, Default, Deserialize)]
pub struct SetsQuery {
    pub game_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProductsQuery {
    pub q: Option<String>,
    pub game: Option<String>,
    pub in_stock: Option<bool>,
    pub linked_only: Option<bool>,
    pub sort: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncTriggerQuery {
    /// Restrict to sets released in the last N days.
    pub recent_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HarvestTriggerQuery {
    pub stale_hours: Option<i64>,
    pub game: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookSyncQuery {
    pub token: Option<String>,
    pub game_code: Option<String>,
    pub recent_days: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskLaunched {
    pub task_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskLogsResponse {
    pub id: Uuid,
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminStats {
    pub total_cards: i64,
    pub total_printings: i64,
    pub total_users: i64,
    pub total_updates: i64,
    pub total_products: i64,
}
