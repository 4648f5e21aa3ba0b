mod common;

use std::collections::BTreeSet;

use common::*;
use geekorium_core::catalog::{CatalogStore, Condition, MemoryCatalog, PrintingFilters, SortKey};
use geekorium_core::normalization::{format_price, normalize_price, ConditionMapper, Currency};
use proptest::prelude::*;

const RARITIES: &[&str] = &["common", "uncommon", "rare", "mythic"];
const COLORS: &[&str] = &["W", "U", "B", "R", "G"];

/// (name, rarity index, colors) per printing.
type Row = (String, usize, Vec<usize>);

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(f)
}

async fn catalog(rows: &[Row]) -> MemoryCatalog {
    let store = MemoryCatalog::seeded();
    store
        .upsert_sets(&[set_row("mtg", "tst", None)])
        .await
        .unwrap();
    let mut cards = Vec::new();
    let mut printings = Vec::new();
    for (i, (name, rarity, colors)) in rows.iter().enumerate() {
        let mut card = card_row(&format!("c{i}"), "mtg", name);
        card.colors = colors.iter().map(|c| COLORS[*c].to_string()).collect();
        cards.push(card);
        let mut printing = printing_row(&format!("p{i:03}"), &format!("c{i}"), "mtg", "tst");
        printing.rarity = Some(RARITIES[*rarity].to_string());
        printings.push(printing);
    }
    store.upsert_cards(&cards).await.unwrap();
    store.upsert_printings(&printings).await.unwrap();
    store.refresh_materialized_views().await.unwrap();
    store
}

async fn ids(store: &MemoryCatalog, filters: PrintingFilters) -> BTreeSet<String> {
    store
        .list_printings(&filters, SortKey::Name, 1000, 0)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|i| i.printing_id)
        .collect()
}

fn rows() -> impl Strategy<Value = Vec<Row>> {
    prop::collection::vec(
        (
            "[A-Za-z]{3,10}( [A-Za-z]{3,8})?",
            0..RARITIES.len(),
            prop::collection::vec(0..COLORS.len(), 0..3),
        ),
        1..12,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn name_search_ignores_case(rows in rows(), q in "[A-Za-z]{1,3}") {
        block_on(async {
            let store = catalog(&rows).await;
            let search = |q: String| PrintingFilters { q: Some(q), ..PrintingFilters::default() };
            let base = ids(&store, search(q.clone())).await;
            let upper = ids(&store, search(q.to_uppercase())).await;
            let lower = ids(&store, search(q.to_lowercase())).await;
            prop_assert_eq!(&base, &upper);
            prop_assert_eq!(&base, &lower);
            Ok(())
        })?;
    }

    #[test]
    fn filters_compose_as_intersection(
        rows in rows(),
        rarity in 0..RARITIES.len(),
        color in 0..COLORS.len(),
    ) {
        block_on(async {
            let store = catalog(&rows).await;
            let by_rarity = PrintingFilters {
                rarities: vec![RARITIES[rarity].to_uppercase()],
                ..PrintingFilters::default()
            };
            let by_color = PrintingFilters {
                colors: vec![COLORS[color].to_lowercase()],
                ..PrintingFilters::default()
            };
            let both = PrintingFilters {
                rarities: by_rarity.rarities.clone(),
                colors: by_color.colors.clone(),
                ..PrintingFilters::default()
            };
            let a = ids(&store, by_rarity).await;
            let b = ids(&store, by_color).await;
            let expected: BTreeSet<String> = a.intersection(&b).cloned().collect();
            let combined = ids(&store, both).await;
            prop_assert_eq!(expected, combined);
            Ok(())
        })?;
    }

    #[test]
    fn formatted_prices_parse_back(cents in 0u64..100_000_000, eur in any::<bool>()) {
        let currency = if eur { Currency::Eur } else { Currency::Usd };
        let amount = cents as f64 / 100.0;
        let text = format_price(amount, currency);
        let parsed = normalize_price(&text).unwrap();
        prop_assert_eq!(parsed.currency, currency);
        prop_assert!((parsed.amount - amount).abs() < 1e-9, "{} -> {}", text, parsed.amount);
    }

    #[test]
    fn unknown_condition_labels_are_near_mint(label in "[qxzjw]{4,12}", provider in "(tcgplayer|cardmarket|cardkingdom|generic|ebay)") {
        let mapper = ConditionMapper::with_defaults();
        prop_assert_eq!(mapper.map(&provider, &label), Condition::NearMint);
        prop_assert_eq!(mapper.lookup(&provider, &label), None);
    }
}

#[test]
fn every_dictionary_entry_maps_to_its_grade() {
    let mapper = ConditionMapper::with_defaults();
    let providers: Vec<String> = mapper.providers().map(str::to_string).collect();
    assert!(providers.len() >= 4);
    for provider in &providers {
        for (label, grade) in mapper.entries(provider) {
            assert_eq!(mapper.map(provider, label), *grade, "{provider}: {label}");
            assert_eq!(mapper.map(provider, &label.to_uppercase()), *grade);
        }
    }
    assert_eq!(mapper.map("tcgplayer", ""), Condition::NearMint);
}
