//! Static reference rows seeded before any dependent table is written.

use super::model::{Condition, GameRow, Source, SourceKind};

pub const GAME_MTG: &str = "mtg";
pub const GAME_POKEMON: &str = "pokemon";

pub const SOURCE_CARDKINGDOM: &str = "cardkingdom";
pub const SOURCE_TCGPLAYER: &str = "tcgplayer";
pub const SOURCE_CARDMARKET: &str = "cardmarket";
pub const SOURCE_GEEKORIUM: &str = "geekorium";
pub const SOURCE_SCRYFALL: &str = "scryfall";

pub struct GameSpec {
    pub code: &'static str,
    pub name: &'static str,
}

pub const GAMES: &[GameSpec] = &[
    GameSpec {
        code: GAME_MTG,
        name: "Magic: The Gathering",
    },
    GameSpec {
        code: GAME_POKEMON,
        name: "Pokémon TCG",
    },
];

pub struct SourceSpec {
    pub id: i16,
    pub code: &'static str,
    pub name: &'static str,
    pub kind: SourceKind,
    pub currency: &'static str,
}

impl SourceSpec {
    pub fn to_source(&self) -> Source {
        Source {
            source_id: self.id,
            code: self.code.to_string(),
            name: self.name.to_string(),
            kind: self.kind,
            currency: self.currency.to_string(),
        }
    }
}

/// Ids are part of the schema contract; never renumber.
pub const SOURCES: &[SourceSpec] = &[
    SourceSpec {
        id: 1,
        code: SOURCE_CARDKINGDOM,
        name: "Card Kingdom",
        kind: SourceKind::Bulk,
        currency: "USD",
    },
    SourceSpec {
        id: 2,
        code: SOURCE_TCGPLAYER,
        name: "TCGplayer",
        kind: SourceKind::Scrape,
        currency: "USD",
    },
    SourceSpec {
        id: 3,
        code: SOURCE_CARDMARKET,
        name: "Cardmarket",
        kind: SourceKind::Scrape,
        currency: "EUR",
    },
    SourceSpec {
        id: 4,
        code: SOURCE_GEEKORIUM,
        name: "Geekorium",
        kind: SourceKind::Internal,
        currency: "USD",
    },
    SourceSpec {
        id: 5,
        code: SOURCE_SCRYFALL,
        name: "Scryfall",
        kind: SourceKind::Bulk,
        currency: "USD",
    },
];

pub fn source_by_code(code: &str) -> Option<&'static SourceSpec> {
    let code = code.trim();
    SOURCES.iter().find(|s| s.code.eq_ignore_ascii_case(code))
}

pub fn source_by_id(id: i16) -> Option<&'static SourceSpec> {
    SOURCES.iter().find(|s| s.id == id)
}

/// Source whose prices count as "store price" in the two-factor valuation.
pub fn store_source() -> &'static SourceSpec {
    &SOURCES[3]
}

/// Primary external market for the two-factor valuation.
pub fn market_source() -> &'static SourceSpec {
    &SOURCES[0]
}

pub fn game_rows() -> Vec<GameRow> {
    GAMES
        .iter()
        .map(|g| GameRow {
            code: g.code.to_string(),
            name: g.name.to_string(),
            is_active: true,
        })
        .collect()
}

pub fn conditions() -> impl Iterator<Item = Condition> {
    Condition::ALL.into_iter()
}
