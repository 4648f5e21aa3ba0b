use std::collections::HashMap;

use crate::catalog::Condition;

/// Dictionary used when a provider has no table of its own, and as the
/// second lookup for providers that do.
pub const GENERIC: &str = "generic";

const GENERIC_TABLE: &[(&str, Condition)] = &[
    ("mint", Condition::NearMint),
    ("near mint", Condition::NearMint),
    ("nm", Condition::NearMint),
    ("nm-m", Condition::NearMint),
    ("lightly played", Condition::LightlyPlayed),
    ("slightly played", Condition::LightlyPlayed),
    ("excellent", Condition::LightlyPlayed),
    ("lp", Condition::LightlyPlayed),
    ("sp", Condition::LightlyPlayed),
    ("moderately played", Condition::ModeratelyPlayed),
    ("played", Condition::ModeratelyPlayed),
    ("mp", Condition::ModeratelyPlayed),
    ("heavily played", Condition::HeavilyPlayed),
    ("hp", Condition::HeavilyPlayed),
    ("damaged", Condition::Damaged),
    ("poor", Condition::Damaged),
    ("dmg", Condition::Damaged),
    ("dm", Condition::Damaged),
];

const TCGPLAYER_TABLE: &[(&str, Condition)] = &[
    ("near mint", Condition::NearMint),
    ("near mint foil", Condition::NearMint),
    ("lightly played", Condition::LightlyPlayed),
    ("lightly played foil", Condition::LightlyPlayed),
    ("moderately played", Condition::ModeratelyPlayed),
    ("moderately played foil", Condition::ModeratelyPlayed),
    ("heavily played", Condition::HeavilyPlayed),
    ("heavily played foil", Condition::HeavilyPlayed),
    ("damaged", Condition::Damaged),
    ("damaged foil", Condition::Damaged),
];

// Cardmarket grades one step finer than the store does.
const CARDMARKET_TABLE: &[(&str, Condition)] = &[
    ("mt", Condition::NearMint),
    ("mint", Condition::NearMint),
    ("nm", Condition::NearMint),
    ("near mint", Condition::NearMint),
    ("ex", Condition::LightlyPlayed),
    ("excellent", Condition::LightlyPlayed),
    ("gd", Condition::ModeratelyPlayed),
    ("good", Condition::ModeratelyPlayed),
    ("lp", Condition::ModeratelyPlayed),
    ("light played", Condition::ModeratelyPlayed),
    ("pl", Condition::HeavilyPlayed),
    ("played", Condition::HeavilyPlayed),
    ("po", Condition::Damaged),
    ("poor", Condition::Damaged),
];

const CARDKINGDOM_TABLE: &[(&str, Condition)] = &[
    ("nm", Condition::NearMint),
    ("ex", Condition::LightlyPlayed),
    ("vg", Condition::ModeratelyPlayed),
    ("very good", Condition::ModeratelyPlayed),
    ("g", Condition::HeavilyPlayed),
    ("good", Condition::HeavilyPlayed),
];

/// Per-provider dictionaries translating free-form condition labels into
/// the five store grades. Lookup order: provider exact, generic exact,
/// longest whole-word partial match, then Near Mint.
#[derive(Debug, Default, Clone)]
pub struct ConditionMapper {
    tables: HashMap<String, Vec<(String, Condition)>>,
}

impl ConditionMapper {
    pub fn with_defaults() -> Self {
        Self::default()
            .register(GENERIC, GENERIC_TABLE)
            .register("tcgplayer", TCGPLAYER_TABLE)
            .register("cardmarket", CARDMARKET_TABLE)
            .register("cardkingdom", CARDKINGDOM_TABLE)
    }

    /// Add (or extend) a provider's dictionary. Later entries override
    /// earlier ones with the same label.
    pub fn register(mut self, provider: &str, entries: &[(&str, Condition)]) -> Self {
        let table = self.tables.entry(provider.to_ascii_lowercase()).or_default();
        for (label, cond) in entries {
            let label = clean_label(label);
            table.retain(|(l, _)| *l != label);
            table.push((label, *cond));
        }
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn entries(&self, provider: &str) -> &[(String, Condition)] {
        self.tables
            .get(&provider.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn map(&self, provider: &str, raw: &str) -> Condition {
        self.lookup(provider, raw).unwrap_or(Condition::NearMint)
    }

    /// Like [`Self::map`] but `None` instead of the Near Mint fallback.
    pub fn lookup(&self, provider: &str, raw: &str) -> Option<Condition> {
        let label = clean_label(raw);
        if label.is_empty() {
            return None;
        }
        let provider = provider.to_ascii_lowercase();
        let tables: Vec<&[(String, Condition)]> = [provider.as_str(), GENERIC]
            .iter()
            .filter_map(|p| self.tables.get(*p).map(Vec::as_slice))
            .collect();

        for table in &tables {
            if let Some((_, c)) = table.iter().find(|(l, _)| *l == label) {
                return Some(*c);
            }
        }
        for table in &tables {
            let best = table
                .iter()
                .filter(|(l, _)| contains_phrase(&label, l))
                .max_by_key(|(l, _)| l.len());
            if let Some((_, c)) = best {
                return Some(*c);
            }
        }
        None
    }
}

fn clean_label(raw: &str) -> String {
    raw.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whole-word containment, so "g" never matches inside "good".
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let hay: Vec<&str> = haystack.split(' ').collect();
    let needle: Vec<&str> = phrase.split(' ').collect();
    !needle.is_empty() && hay.windows(needle.len()).any(|w| w == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_then_partial_then_fallback() {
        let m = ConditionMapper::with_defaults();
        assert_eq!(m.map("tcgplayer", "Lightly Played Foil"), Condition::LightlyPlayed);
        assert_eq!(m.map("tcgplayer", "Near Mint - Holofoil"), Condition::NearMint);
        assert_eq!(m.map("cardmarket", "LP"), Condition::ModeratelyPlayed);
        assert_eq!(m.map("unknown-shop", "LP"), Condition::LightlyPlayed);
        assert_eq!(m.map("cardkingdom", "VG"), Condition::ModeratelyPlayed);
        assert_eq!(m.map("cardmarket", "Condition: Excellent (EX)"), Condition::LightlyPlayed);
        assert_eq!(m.map("tcgplayer", "graded 9.5"), Condition::NearMint);
        assert_eq!(m.lookup("tcgplayer", "graded 9.5"), None);
    }

    #[test]
    fn partial_match_prefers_longest_label() {
        let m = ConditionMapper::with_defaults();
        assert_eq!(
            m.map("generic", "card is heavily played but complete"),
            Condition::HeavilyPlayed
        );
    }

    #[test]
    fn every_dictionary_value_is_a_store_grade() {
        let m = ConditionMapper::with_defaults();
        let providers: Vec<String> = m.providers().map(str::to_string).collect();
        for p in providers {
            for (label, cond) in m.entries(&p) {
                assert_eq!(m.map(&p, label), *cond, "{p}: {label}");
                assert!(Condition::ALL.contains(cond));
            }
        }
    }

    #[test]
    fn register_overrides_labels() {
        let m = ConditionMapper::with_defaults().register("cardmarket", &[("lp", Condition::LightlyPlayed)]);
        assert_eq!(m.map("cardmarket", "lp"), Condition::LightlyPlayed);
    }
}
