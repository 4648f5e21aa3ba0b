//! Variant hints (foil type, art variant, edition, treatment, promo type)
//! detected from listing URLs and free text.
//!
//! Hints annotate an observation; they never change which printing it
//! belongs to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::reference::{GAME_MTG, GAME_POKEMON};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintKind {
    ArtVariant,
    Foil,
    Edition,
    Treatment,
    Promo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub art_variant_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foil_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_type: Option<String>,
}

impl VariantHints {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn slot(&mut self, kind: HintKind) -> &mut Option<String> {
        match kind {
            HintKind::ArtVariant => &mut self.art_variant_type,
            HintKind::Foil => &mut self.foil_type,
            HintKind::Edition => &mut self.edition,
            HintKind::Treatment => &mut self.treatment,
            HintKind::Promo => &mut self.promo_type,
        }
    }

    /// Fill empty fields from `other`; fields already set are kept.
    pub fn merge(mut self, other: VariantHints) -> Self {
        self.art_variant_type = self.art_variant_type.or(other.art_variant_type);
        self.foil_type = self.foil_type.or(other.foil_type);
        self.edition = self.edition.or(other.edition);
        self.treatment = self.treatment.or(other.treatment);
        self.promo_type = self.promo_type.or(other.promo_type);
        self
    }

    pub fn to_value(&self) -> Option<Value> {
        if self.is_empty() {
            None
        } else {
            serde_json::to_value(self).ok()
        }
    }
}

type Keyword = (&'static str, HintKind, &'static str);

// Path segments shared by the marketplaces we scrape.
const URL_SEGMENTS: &[Keyword] = &[
    ("foil", HintKind::Foil, "foil"),
    ("foils", HintKind::Foil, "foil"),
    ("etched", HintKind::Foil, "etched"),
    ("reverse-holo", HintKind::Foil, "reverse_holo"),
    ("alt-art", HintKind::ArtVariant, "alternate_art"),
    ("alternate-art", HintKind::ArtVariant, "alternate_art"),
    ("borderless", HintKind::ArtVariant, "borderless"),
    ("extended-art", HintKind::ArtVariant, "extended_art"),
    ("full-art", HintKind::ArtVariant, "full_art"),
    ("showcase", HintKind::Treatment, "showcase"),
    ("promo", HintKind::Promo, "promo"),
    ("promos", HintKind::Promo, "promo"),
    ("1st-edition", HintKind::Edition, "1st_edition"),
    ("first-edition", HintKind::Edition, "1st_edition"),
];

// TCGplayer folds the finish into the product slug.
const TCGPLAYER_SLUG_SUFFIXES: &[Keyword] = &[
    ("-foil-etched", HintKind::Foil, "etched"),
    ("-etched", HintKind::Foil, "etched"),
    ("-foil", HintKind::Foil, "foil"),
    ("-borderless", HintKind::ArtVariant, "borderless"),
    ("-extended-art", HintKind::ArtVariant, "extended_art"),
    ("-showcase", HintKind::Treatment, "showcase"),
];

const MTG_TEXT: &[Keyword] = &[
    ("foil", HintKind::Foil, "foil"),
    ("etched foil", HintKind::Foil, "etched"),
    ("etched", HintKind::Foil, "etched"),
    ("surge foil", HintKind::Foil, "surge_foil"),
    ("galaxy foil", HintKind::Foil, "galaxy_foil"),
    ("textured foil", HintKind::Foil, "textured_foil"),
    ("borderless", HintKind::ArtVariant, "borderless"),
    ("extended art", HintKind::ArtVariant, "extended_art"),
    ("full art", HintKind::ArtVariant, "full_art"),
    ("alternate art", HintKind::ArtVariant, "alternate_art"),
    ("showcase", HintKind::Treatment, "showcase"),
    ("retro frame", HintKind::Treatment, "retro_frame"),
    ("serialized", HintKind::Treatment, "serialized"),
    ("prerelease", HintKind::Promo, "prerelease"),
    ("promo pack", HintKind::Promo, "promo_pack"),
    ("buy a box", HintKind::Promo, "buy_a_box"),
    ("promo", HintKind::Promo, "promo"),
    ("first edition", HintKind::Edition, "1st_edition"),
];

const POKEMON_TEXT: &[Keyword] = &[
    ("holo", HintKind::Foil, "holo"),
    ("reverse holo", HintKind::Foil, "reverse_holo"),
    ("cosmos holo", HintKind::Foil, "cosmos_holo"),
    ("full art", HintKind::ArtVariant, "full_art"),
    ("alternate art", HintKind::ArtVariant, "alternate_art"),
    ("alt art", HintKind::ArtVariant, "alternate_art"),
    ("special illustration rare", HintKind::ArtVariant, "special_illustration"),
    ("illustration rare", HintKind::ArtVariant, "illustration"),
    ("rainbow rare", HintKind::Treatment, "rainbow_rare"),
    ("secret rare", HintKind::Treatment, "secret_rare"),
    ("gold rare", HintKind::Treatment, "gold_rare"),
    ("1st edition", HintKind::Edition, "1st_edition"),
    ("first edition", HintKind::Edition, "1st_edition"),
    ("shadowless", HintKind::Edition, "shadowless"),
    ("unlimited", HintKind::Edition, "unlimited"),
    ("black star promo", HintKind::Promo, "black_star"),
    ("promo", HintKind::Promo, "promo"),
];

fn text_table(game_code: &str) -> &'static [Keyword] {
    match game_code.trim().to_ascii_lowercase().as_str() {
        GAME_POKEMON => POKEMON_TEXT,
        GAME_MTG => MTG_TEXT,
        _ => &[],
    }
}

fn words(raw: &str) -> Vec<String> {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Apply a keyword table, keeping the longest match per hint kind.
fn apply<'a>(hints: &mut VariantHints, matches: impl Iterator<Item = &'a Keyword>) {
    let mut best: Vec<(HintKind, usize, &'static str)> = Vec::new();
    for &(keyword, kind, value) in matches {
        match best.iter().position(|(k, _, _)| *k == kind) {
            Some(i) if best[i].1 >= keyword.len() => {}
            Some(i) => best[i] = (kind, keyword.len(), value),
            None => best.push((kind, keyword.len(), value)),
        }
    }
    for (kind, _, value) in best {
        let slot = hints.slot(kind);
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }
}

fn text_matches<'a>(
    tokens: &'a [String],
    table: &'static [Keyword],
) -> impl Iterator<Item = &'static Keyword> + 'a {
    table.iter().filter(move |(keyword, _, _)| {
        let needle: Vec<&str> = keyword.split(' ').collect();
        tokens
            .windows(needle.len())
            .any(|w| w.iter().map(String::as_str).eq(needle.iter().copied()))
    })
}

pub fn detect_from_text(text: &str, game_code: &str) -> VariantHints {
    let tokens = words(text);
    let mut hints = VariantHints::default();
    apply(&mut hints, text_matches(&tokens, text_table(game_code)));
    hints
}

pub fn detect_from_url(url: &str, game_code: &str) -> VariantHints {
    let Ok(parsed) = url::Url::parse(url) else {
        return VariantHints::default();
    };
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    let segments: Vec<String> = parsed
        .path_segments()
        .map(|s| s.map(|seg| seg.to_ascii_lowercase()).collect())
        .unwrap_or_default();

    let mut hints = VariantHints::default();
    apply(
        &mut hints,
        URL_SEGMENTS
            .iter()
            .filter(|(keyword, _, _)| segments.iter().any(|s| s == keyword)),
    );
    if host.contains("tcgplayer") {
        if let Some(slug) = segments.last() {
            apply(
                &mut hints,
                TCGPLAYER_SLUG_SUFFIXES
                    .iter()
                    .filter(|(suffix, _, _)| slug.ends_with(suffix)),
            );
        }
    }
    // Query strings such as ?isFoil=Y or ?printing=Foil.
    for (key, value) in parsed.query_pairs() {
        let key = key.to_ascii_lowercase();
        let value = value.to_ascii_lowercase();
        if (key == "isfoil" && matches!(value.as_str(), "y" | "yes" | "true" | "1"))
            || (key == "printing" && value.contains("foil"))
        {
            hints.foil_type.get_or_insert_with(|| "foil".to_string());
        }
    }
    // The product slug reads like a listing title.
    if let Some(slug) = segments.last() {
        let tokens = words(slug);
        apply(&mut hints, text_matches(&tokens, text_table(game_code)));
    }
    hints
}

/// URL hints first, then free-text hints for whatever is still open.
pub fn detect(url: Option<&str>, text: Option<&str>, game_code: &str) -> VariantHints {
    let from_url = url.map(|u| detect_from_url(u, game_code)).unwrap_or_default();
    let from_text = text
        .map(|t| detect_from_text(t, game_code))
        .unwrap_or_default();
    from_url.merge(from_text)
}
