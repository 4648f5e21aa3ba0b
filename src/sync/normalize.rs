//! Registry objects to catalog rows.

use chrono::NaiveDate;

use super::registry::{RegistryCard, RegistryFace};
use crate::catalog::{normalize_code, normalize_color, Card, Printing};
use crate::error::UpstreamError;

/// Separator for text synthesized from card faces.
pub const FACE_SEPARATOR: &str = " // ";

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Join one field across faces, skipping faces where it is empty.
pub fn join_faces(faces: &[RegistryFace], field: fn(&RegistryFace) -> &Option<String>) -> Option<String> {
    let parts: Vec<&str> = faces.iter().filter_map(|f| non_empty(field(f))).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(FACE_SEPARATOR))
    }
}

/// Top-level value, else the faces joined.
fn top_or_faces(
    top: &Option<String>,
    faces: &[RegistryFace],
    field: fn(&RegistryFace) -> &Option<String>,
) -> Option<String> {
    non_empty(top)
        .map(str::to_string)
        .or_else(|| join_faces(faces, field))
}

/// Oracle id at the top level, else from the first face.
pub fn oracle_id(rc: &RegistryCard) -> Option<String> {
    non_empty(&rc.oracle_id)
        .map(str::to_string)
        .or_else(|| rc.faces().first().and_then(|f| non_empty(&f.oracle_id).map(str::to_string)))
}

const IMAGE_SIZES: [&str; 4] = ["normal", "large", "png", "small"];

fn pick_image(uris: &Option<std::collections::HashMap<String, String>>) -> Option<String> {
    let uris = uris.as_ref()?;
    IMAGE_SIZES
        .iter()
        .find_map(|k| uris.get(*k))
        .filter(|s| !s.is_empty())
        .cloned()
}

fn colors_of(rc: &RegistryCard, faces: &[RegistryFace]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let sources: Vec<&Vec<String>> = match &rc.colors {
        Some(c) => vec![c],
        None => faces.iter().filter_map(|f| f.colors.as_ref()).collect(),
    };
    for c in sources.into_iter().flatten() {
        let c = normalize_color(c);
        if !c.is_empty() && !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

/// Logical card row. Fails when no oracle id can be recovered.
pub fn to_card(rc: &RegistryCard, game_code: &str) -> Result<Card, UpstreamError> {
    let card_id = oracle_id(rc)
        .ok_or_else(|| UpstreamError::Malformed(format!("printing {} has no oracle id", rc.id)))?;
    let faces = rc.faces();
    Ok(Card {
        card_id,
        game_code: normalize_code(game_code),
        name: rc.name.trim().to_string(),
        oracle_text: top_or_faces(&rc.oracle_text, &faces, |f| &f.oracle_text),
        mana_cost: top_or_faces(&rc.mana_cost, &faces, |f| &f.mana_cost),
        type_line: top_or_faces(&rc.type_line, &faces, |f| &f.type_line),
        rarity: non_empty(&rc.rarity).map(normalize_code),
        cmc: rc.cmc,
        colors: colors_of(rc, &faces),
        color_identity: rc
            .color_identity
            .iter()
            .flatten()
            .map(|c| normalize_color(c))
            .collect(),
        legalities: rc.legalities.clone().unwrap_or_default(),
    })
}

/// Physical printing row under `set_code`.
pub fn to_printing(rc: &RegistryCard, card_id: &str, game_code: &str, set_code: &str) -> Printing {
    let faces = rc.faces();
    let finishes: Vec<String> = rc.finishes.iter().map(|f| normalize_code(f)).collect();
    let has = |name: &str| finishes.iter().any(|f| f == name);
    let is_foil = rc.foil.unwrap_or(false) || has("foil");
    let is_etched = has("etched");
    let is_nonfoil = rc
        .nonfoil
        .unwrap_or_else(|| finishes.is_empty() || has("nonfoil"));

    let mut treatments: Vec<String> = rc.frame_effects.iter().map(|f| normalize_code(f)).collect();
    if rc.border_color.as_deref() == Some("borderless") {
        treatments.push("borderless".to_string());
    }
    if rc.full_art == Some(true) {
        treatments.push("fullart".to_string());
    }
    treatments.dedup();

    Printing {
        printing_id: rc.id.clone(),
        card_id: card_id.to_string(),
        game_code: normalize_code(game_code),
        set_code: normalize_code(set_code),
        collector_number: non_empty(&rc.collector_number).map(str::to_string),
        rarity: non_empty(&rc.rarity).map(normalize_code),
        image_url: pick_image(&rc.image_uris).or_else(|| faces.first().and_then(|f| pick_image(&f.image_uris))),
        artist: non_empty(&rc.artist)
            .map(str::to_string)
            .or_else(|| faces.first().and_then(|f| non_empty(&f.artist).map(str::to_string))),
        flavor_text: top_or_faces(&rc.flavor_text, &faces, |f| &f.flavor_text),
        lang: non_empty(&rc.lang).map(str::to_string),
        released_at: rc
            .released_at
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()),
        card_faces: rc.card_faces.clone(),
        prices: rc.prices.clone(),
        is_foil,
        is_nonfoil,
        is_etched,
        treatments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transform_card() -> RegistryCard {
        serde_json::from_value(json!({
            "id": "p-delver",
            "name": "Delver of Secrets // Insectile Aberration",
            "rarity": "Common",
            "set": "isd",
            "collector_number": "51",
            "released_at": "2011-09-30",
            "finishes": ["nonfoil", "foil"],
            "card_faces": [
                {
                    "name": "Delver of Secrets",
                    "oracle_id": "o-delver",
                    "mana_cost": "{U}",
                    "type_line": "Creature — Human Wizard",
                    "oracle_text": "At the beginning of your upkeep, look at the top card.",
                    "colors": ["U"],
                    "image_uris": {"normal": "https://img/front.jpg"}
                },
                {
                    "name": "Insectile Aberration",
                    "mana_cost": "",
                    "type_line": "Creature — Human Insect",
                    "oracle_text": "Flying",
                    "colors": ["U"]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn multi_face_text_is_joined() {
        let card = to_card(&transform_card(), "MTG").unwrap();
        assert_eq!(card.card_id, "o-delver");
        assert_eq!(card.game_code, "mtg");
        assert_eq!(
            card.type_line.as_deref(),
            Some("Creature — Human Wizard // Creature — Human Insect")
        );
        assert_eq!(
            card.oracle_text.as_deref(),
            Some("At the beginning of your upkeep, look at the top card. // Flying")
        );
        // empty back-face cost is skipped
        assert_eq!(card.mana_cost.as_deref(), Some("{U}"));
        assert_eq!(card.colors, vec!["U".to_string()]);
        assert_eq!(card.rarity.as_deref(), Some("common"));
    }

    #[test]
    fn printing_falls_back_to_face_image() {
        let rc = transform_card();
        let p = to_printing(&rc, "o-delver", "mtg", "ISD");
        assert_eq!(p.image_url.as_deref(), Some("https://img/front.jpg"));
        assert_eq!(p.set_code, "isd");
        assert!(p.is_foil && p.is_nonfoil && !p.is_etched);
        assert_eq!(p.released_at, NaiveDate::from_ymd_opt(2011, 9, 30));
        assert!(p.card_faces.is_some());
    }

    #[test]
    fn top_level_fields_win() {
        let mut rc = transform_card();
        rc.oracle_id = Some("o-top".into());
        rc.type_line = Some("Creature".into());
        let card = to_card(&rc, "mtg").unwrap();
        assert_eq!(card.card_id, "o-top");
        assert_eq!(card.type_line.as_deref(), Some("Creature"));
    }

    #[test]
    fn missing_oracle_id_is_malformed() {
        let rc = RegistryCard {
            id: "p9".into(),
            name: "Mystery".into(),
            ..RegistryCard::default()
        };
        assert!(matches!(to_card(&rc, "mtg"), Err(UpstreamError::Malformed(_))));
    }
}
