use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::CardSet;
use crate::error::UpstreamError;

/// One face of a multi-face card object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryFace {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub oracle_id: Option<String>,
    #[serde(default)]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub type_line: Option<String>,
    #[serde(default)]
    pub oracle_text: Option<String>,
    #[serde(default)]
    pub colors: Option<Vec<String>>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub flavor_text: Option<String>,
    #[serde(default)]
    pub image_uris: Option<HashMap<String, String>>,
}

/// Printing object as the registries return it. Pokémon payloads are
/// reshaped into this form by their client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryCard {
    pub id: String,
    #[serde(default)]
    pub oracle_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub released_at: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub cmc: Option<f64>,
    #[serde(default)]
    pub type_line: Option<String>,
    #[serde(default)]
    pub oracle_text: Option<String>,
    #[serde(default)]
    pub colors: Option<Vec<String>>,
    #[serde(default)]
    pub color_identity: Option<Vec<String>>,
    #[serde(default)]
    pub legalities: Option<HashMap<String, String>>,
    #[serde(default)]
    pub rarity: Option<String>,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub collector_number: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub flavor_text: Option<String>,
    #[serde(default)]
    pub image_uris: Option<HashMap<String, String>>,
    /// Kept raw; faces are decoded on demand.
    #[serde(default)]
    pub card_faces: Option<Value>,
    #[serde(default)]
    pub prices: Option<Value>,
    #[serde(default)]
    pub finishes: Vec<String>,
    #[serde(default)]
    pub foil: Option<bool>,
    #[serde(default)]
    pub nonfoil: Option<bool>,
    #[serde(default)]
    pub frame_effects: Vec<String>,
    #[serde(default)]
    pub border_color: Option<String>,
    #[serde(default)]
    pub full_art: Option<bool>,
}

impl RegistryCard {
    pub fn faces(&self) -> Vec<RegistryFace> {
        self.card_faces
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryPage {
    pub data: Vec<RegistryCard>,
    pub has_more: bool,
    /// Opaque continuation handed back to `search_set_page`.
    pub next_page: Option<String>,
}

/// Read-only upstream card registry for one game.
#[async_trait]
pub trait CardRegistry: Send + Sync {
    fn game_code(&self) -> &str;

    /// Politeness delay between paginated requests.
    fn page_delay(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn list_sets(&self) -> Result<Vec<CardSet>, UpstreamError>;

    /// First page when `page` is `None`; otherwise the page the previous
    /// call's `next_page` pointed to. A set the registry does not know is
    /// [`UpstreamError::NotFound`].
    async fn search_set_page(
        &self,
        set_code: &str,
        page: Option<&str>,
    ) -> Result<RegistryPage, UpstreamError>;

    async fn card_by_collector(
        &self,
        set_code: &str,
        collector_number: &str,
    ) -> Result<RegistryCard, UpstreamError>;
}

/// Parse `Retry-After` given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Send and return the body, mapping non-2xx statuses onto [`UpstreamError`].
pub(crate) async fn get_json_bytes(req: reqwest::RequestBuilder) -> Result<Vec<u8>, UpstreamError> {
    let resp = req.header(reqwest::header::ACCEPT, "application/json").send().await?;
    let status = resp.status();
    if !status.is_success() {
        let url = resp.url().to_string();
        let wait = retry_after(resp.headers());
        return Err(UpstreamError::from_status(status.as_u16(), &url, wait));
    }
    Ok(resp.bytes().await?.to_vec())
}

pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T, UpstreamError> {
    let bytes = get_json_bytes(req).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_faces_lazily() {
        let card: RegistryCard = serde_json::from_value(json!({
            "id": "p1",
            "name": "Delver of Secrets // Insectile Aberration",
            "card_faces": [
                {"name": "Delver of Secrets", "mana_cost": "{U}", "oracle_id": "o1"},
                {"name": "Insectile Aberration", "mana_cost": ""}
            ]
        }))
        .unwrap();
        let faces = card.faces();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].oracle_id.as_deref(), Some("o1"));
        assert!(card.finishes.is_empty());
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
    }
}
