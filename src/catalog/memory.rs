//! In-process catalog with the same semantics as the Postgres store.
//! Backs the integration tests and `--dry-run` invocations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::model::*;
use super::reference;
use super::CatalogStore;
use crate::aggregation::{reduce_window, round_cents};
use crate::error::{StoreError, StoreResult};

#[derive(Default)]
struct State {
    games: BTreeMap<String, Game>,
    sets: BTreeMap<(String, String), CardSet>,
    cards: BTreeMap<String, Card>,
    printings: BTreeMap<String, Printing>,
    sources: BTreeMap<i16, Source>,
    history: Vec<PriceHistoryEntry>,
    archive: Vec<PriceHistoryEntry>,
    next_history_id: i64,
    aggregates: BTreeMap<(String, Condition), AggregatedPrice>,
    /// Snapshot rebuilt only by `refresh_materialized_views`.
    view: Vec<PrintingListItem>,
    products: BTreeMap<i64, Product>,
    profiles: HashMap<String, String>,
    alerts: BTreeMap<i64, PriceAlert>,
    notifications: Vec<AlertNotification>,
}

fn effective_at(entry: &PriceHistoryEntry) -> DateTime<Utc> {
    entry.observed_at.unwrap_or_else(|| {
        entry
            .observed_on
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_default()
    })
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
    injected_failures: AtomicU32,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty catalog with games, conditions and sources already present.
    pub fn seeded() -> Self {
        let store = Self::new();
        {
            let mut st = store.lock();
            seed_into(&mut st);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` write calls fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    fn take_fault(&self) -> StoreResult<()> {
        let hit = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(StoreError::Transient("injected failure".into()))
        } else {
            Ok(())
        }
    }

    /// Write a row the way an older writer would, bypassing the upsert path.
    pub fn insert_legacy_history(
        &self,
        printing_id: &str,
        source_id: i16,
        condition: Option<Condition>,
        observed_on: NaiveDate,
        observed_at: Option<DateTime<Utc>>,
        price_usd: f64,
    ) {
        let mut st = self.lock();
        st.next_history_id += 1;
        let id = st.next_history_id;
        st.history.push(PriceHistoryEntry {
            id,
            printing_id: printing_id.to_string(),
            source_id,
            condition,
            price_usd: Some(price_usd),
            price_eur: None,
            stock_quantity: None,
            is_foil: false,
            observed_at,
            observed_on,
            url: None,
            variant: None,
        });
    }

    pub fn add_profile(&self, user_id: &str, role: &str) {
        self.lock()
            .profiles
            .insert(user_id.to_string(), role.to_string());
    }

    pub fn add_alert(&self, mut alert: PriceAlert) -> i64 {
        let mut st = self.lock();
        let id = st.alerts.keys().next_back().copied().unwrap_or(0) + 1;
        alert.alert_id = id;
        st.alerts.insert(id, alert);
        id
    }

    pub fn alert(&self, alert_id: i64) -> Option<PriceAlert> {
        self.lock().alerts.get(&alert_id).cloned()
    }

    pub fn history(&self) -> Vec<PriceHistoryEntry> {
        self.lock().history.clone()
    }

    pub fn archived(&self) -> Vec<PriceHistoryEntry> {
        self.lock().archive.clone()
    }

    pub fn notifications(&self) -> Vec<AlertNotification> {
        self.lock().notifications.clone()
    }

    pub fn aggregate(&self, printing_id: &str, condition: Condition) -> Option<AggregatedPrice> {
        self.lock()
            .aggregates
            .get(&(printing_id.to_string(), condition))
            .cloned()
    }

    pub fn card(&self, card_id: &str) -> Option<Card> {
        self.lock().cards.get(card_id).cloned()
    }

    pub fn printing(&self, printing_id: &str) -> Option<Printing> {
        self.lock().printings.get(printing_id).cloned()
    }
}

fn seed_into(st: &mut State) {
    for row in reference::game_rows() {
        upsert_game(st, &row);
    }
    for spec in reference::SOURCES {
        st.sources.entry(spec.id).or_insert_with(|| spec.to_source());
    }
}

fn upsert_game(st: &mut State, row: &GameRow) -> bool {
    let code = normalize_code(&row.code);
    let next_id = st.games.values().map(|g| g.game_id).max().unwrap_or(0) + 1;
    match st.games.get_mut(&code) {
        Some(game) => {
            game.name = row.name.clone();
            game.is_active = row.is_active;
            false
        }
        None => {
            st.games.insert(
                code.clone(),
                Game {
                    game_id: next_id,
                    code,
                    name: row.name.clone(),
                    is_active: row.is_active,
                },
            );
            true
        }
    }
}

fn count(outcome: &mut UpsertOutcome, inserted: bool) {
    if inserted {
        outcome.inserted += 1;
    } else {
        outcome.updated += 1;
    }
}

impl State {
    fn rebuild_view(&mut self) {
        let mut by_printing: HashMap<&str, Vec<&AggregatedPrice>> = HashMap::new();
        for agg in self.aggregates.values() {
            by_printing
                .entry(agg.printing_id.as_str())
                .or_default()
                .push(agg);
        }
        let mut view = Vec::with_capacity(self.printings.len());
        for p in self.printings.values() {
            // inner join: a printing without its card or set is not listed
            let (Some(card), Some(set)) = (
                self.cards.get(&p.card_id),
                self.sets.get(&(p.game_code.clone(), p.set_code.clone())),
            ) else {
                continue;
            };
            let price = by_printing
                .get(p.printing_id.as_str())
                .and_then(|aggs| headline_price(aggs.iter().copied()));
            view.push(PrintingListItem {
                printing_id: p.printing_id.clone(),
                card_id: card.card_id.clone(),
                name: card.name.clone(),
                type_line: card.type_line.clone(),
                game_code: p.game_code.clone(),
                set_code: p.set_code.clone(),
                set_name: set.name.clone(),
                collector_number: p.collector_number.clone(),
                rarity: p
                    .rarity
                    .as_deref()
                    .or(card.rarity.as_deref())
                    .map(normalize_code),
                colors: card.colors.clone(),
                image_url: p.image_url.clone(),
                price,
                released_at: p.released_at.or(set.release_date),
            });
        }
        self.view = view;
    }
}

fn matches_filters(item: &PrintingListItem, f: &PrintingFilters) -> bool {
    if let Some(q) = &f.q {
        if !contains_ci(&item.name, q) {
            return false;
        }
    }
    if !f.games.is_empty() && !f.games.contains(&item.game_code) {
        return false;
    }
    if !f.sets.is_empty() && !f.sets.contains(&item.set_code) {
        return false;
    }
    if !f.rarities.is_empty() {
        let rarity = item.rarity.as_deref().map(normalize_code).unwrap_or_default();
        if !f.rarities.contains(&rarity) {
            return false;
        }
    }
    if !f.colors.is_empty() && !item.colors.iter().any(|c| f.colors.contains(c)) {
        return false;
    }
    if !f.types.is_empty() {
        let type_line = item.type_line.as_deref().unwrap_or_default();
        if !f.types.iter().any(|t| contains_ci(type_line, t)) {
            return false;
        }
    }
    true
}

fn sort_items(items: &mut [PrintingListItem], sort: SortKey) {
    use std::cmp::Ordering as O;
    // None sorts last in both price directions.
    fn price_cmp(a: Option<f64>, b: Option<f64>, desc: bool) -> O {
        match (a, b) {
            (Some(x), Some(y)) => {
                let o = x.partial_cmp(&y).unwrap_or(O::Equal);
                if desc {
                    o.reverse()
                } else {
                    o
                }
            }
            (Some(_), None) => O::Less,
            (None, Some(_)) => O::Greater,
            (None, None) => O::Equal,
        }
    }
    items.sort_by(|a, b| {
        let primary = match sort {
            SortKey::Name => a.name.cmp(&b.name),
            SortKey::PriceAsc => price_cmp(a.price, b.price, false),
            SortKey::PriceDesc => price_cmp(a.price, b.price, true),
            SortKey::Newest => match (a.released_at, b.released_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => O::Less,
                (None, Some(_)) => O::Greater,
                (None, None) => O::Equal,
            },
        };
        primary.then_with(|| a.printing_id.cmp(&b.printing_id))
    });
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn seed_reference_data(&self) -> StoreResult<()> {
        seed_into(&mut self.lock());
        Ok(())
    }

    async fn upsert_games(&self, rows: &[GameRow]) -> StoreResult<UpsertOutcome> {
        self.take_fault()?;
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            count(&mut outcome, upsert_game(&mut st, row));
        }
        Ok(outcome)
    }

    async fn upsert_sets(&self, rows: &[CardSet]) -> StoreResult<UpsertOutcome> {
        self.take_fault()?;
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            let game_code = normalize_code(&row.game_code);
            if !st.games.contains_key(&game_code) {
                return Err(StoreError::DependencyMissing(format!("game {game_code}")));
            }
            let mut row = row.clone();
            row.game_code = game_code.clone();
            row.set_code = normalize_code(&row.set_code);
            let inserted = st
                .sets
                .insert((game_code, row.set_code.clone()), row)
                .is_none();
            count(&mut outcome, inserted);
        }
        Ok(outcome)
    }

    async fn upsert_cards(&self, rows: &[Card]) -> StoreResult<UpsertOutcome> {
        self.take_fault()?;
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            let game_code = normalize_code(&row.game_code);
            if !st.games.contains_key(&game_code) {
                return Err(StoreError::DependencyMissing(format!("game {game_code}")));
            }
            if let Some(existing) = st.cards.get(&row.card_id) {
                if existing.game_code != game_code {
                    return Err(StoreError::IntegrityViolation(format!(
                        "card {} already belongs to game {}",
                        row.card_id, existing.game_code
                    )));
                }
            }
            let mut row = row.clone();
            row.game_code = game_code;
            let inserted = st.cards.insert(row.card_id.clone(), row).is_none();
            count(&mut outcome, inserted);
        }
        Ok(outcome)
    }

    async fn upsert_printings(&self, rows: &[Printing]) -> StoreResult<UpsertOutcome> {
        self.take_fault()?;
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            let game_code = normalize_code(&row.game_code);
            let set_code = normalize_code(&row.set_code);
            let Some(card) = st.cards.get(&row.card_id) else {
                return Err(StoreError::DependencyMissing(format!("card {}", row.card_id)));
            };
            if !st.sets.contains_key(&(game_code.clone(), set_code.clone())) {
                return Err(StoreError::DependencyMissing(format!(
                    "set {game_code}/{set_code}"
                )));
            }
            if card.game_code != game_code {
                return Err(StoreError::IntegrityViolation(format!(
                    "printing {} joins card of game {} to set of game {}",
                    row.printing_id, card.game_code, game_code
                )));
            }
            let mut row = row.clone();
            row.game_code = game_code;
            row.set_code = set_code;
            let inserted = st.printings.insert(row.printing_id.clone(), row).is_none();
            count(&mut outcome, inserted);
        }
        Ok(outcome)
    }

    async fn insert_price_history(&self, rows: &[PriceObservation]) -> StoreResult<UpsertOutcome> {
        self.take_fault()?;
        let rows = dedupe_observations(rows.to_vec());
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in &rows {
            if !st.printings.contains_key(&row.printing_id) {
                return Err(StoreError::DependencyMissing(format!(
                    "printing {}",
                    row.printing_id
                )));
            }
            if !st.sources.contains_key(&row.source_id) {
                return Err(StoreError::DependencyMissing(format!("source {}", row.source_id)));
            }
            let day = row.observed_on();
            let existing = st.history.iter().position(|e| {
                e.printing_id == row.printing_id
                    && e.source_id == row.source_id
                    && e.condition == Some(row.condition)
                    && e.observed_on == day
            });
            match existing {
                Some(slot) => {
                    let entry = &mut st.history[slot];
                    if entry.observed_at.map_or(true, |at| at <= row.observed_at) {
                        entry.price_usd = row.price_usd;
                        entry.price_eur = row.price_eur;
                        entry.stock_quantity = row.stock_quantity;
                        entry.is_foil = row.is_foil;
                        entry.observed_at = Some(row.observed_at);
                        entry.url = row.url.clone();
                        entry.variant = row.variant.clone();
                        outcome.updated += 1;
                    }
                }
                None => {
                    st.next_history_id += 1;
                    let id = st.next_history_id;
                    st.history.push(PriceHistoryEntry {
                        id,
                        printing_id: row.printing_id.clone(),
                        source_id: row.source_id,
                        condition: Some(row.condition),
                        price_usd: row.price_usd,
                        price_eur: row.price_eur,
                        stock_quantity: row.stock_quantity,
                        is_foil: row.is_foil,
                        observed_at: Some(row.observed_at),
                        observed_on: day,
                        url: row.url.clone(),
                        variant: row.variant.clone(),
                    });
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn upsert_aggregates(&self, rows: &[AggregatedPrice]) -> StoreResult<UpsertOutcome> {
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            if !st.printings.contains_key(&row.printing_id) {
                return Err(StoreError::DependencyMissing(format!(
                    "printing {}",
                    row.printing_id
                )));
            }
            let inserted = st
                .aggregates
                .insert((row.printing_id.clone(), row.condition), row.clone())
                .is_none();
            count(&mut outcome, inserted);
        }
        Ok(outcome)
    }

    async fn refresh_aggregates(&self, since: NaiveDate) -> StoreResult<u64> {
        let mut st = self.lock();
        let fresh = reduce_window(st.history.iter(), since, Utc::now());
        let written = fresh.len() as u64;
        for agg in fresh {
            st.aggregates
                .insert((agg.printing_id.clone(), agg.condition), agg);
        }
        // keys whose history is gone entirely (archived) lose their aggregate
        let State {
            aggregates, history, ..
        } = &mut *st;
        aggregates.retain(|(printing_id, condition), _| {
            history
                .iter()
                .any(|e| &e.printing_id == printing_id && e.condition == Some(*condition))
        });
        Ok(written)
    }

    async fn refresh_materialized_views(&self) -> StoreResult<()> {
        self.lock().rebuild_view();
        Ok(())
    }

    async fn list_games(&self) -> StoreResult<Vec<Game>> {
        let mut games: Vec<Game> = self.lock().games.values().cloned().collect();
        games.sort_by_key(|g| g.game_id);
        Ok(games)
    }

    async fn list_sets(&self, game_code: Option<&str>) -> StoreResult<Vec<SetWithGame>> {
        let st = self.lock();
        let wanted = game_code.map(normalize_code);
        let mut out: Vec<SetWithGame> = st
            .sets
            .values()
            .filter(|s| wanted.as_ref().map_or(true, |g| &s.game_code == g))
            .filter_map(|s| {
                st.games.get(&s.game_code).map(|g| SetWithGame {
                    set: s.clone(),
                    game_name: g.name.clone(),
                    game_is_active: g.is_active,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b.set
                .release_date
                .cmp(&a.set.release_date)
                .then_with(|| a.set.set_code.cmp(&b.set.set_code))
        });
        Ok(out)
    }

    async fn sets_for_sync(
        &self,
        game_code: &str,
        since: Option<NaiveDate>,
    ) -> StoreResult<Vec<CardSet>> {
        let st = self.lock();
        let game_code = normalize_code(game_code);
        let mut out: Vec<CardSet> = st
            .sets
            .values()
            .filter(|s| s.game_code == game_code)
            .filter(|s| match since {
                Some(cutoff) => s.release_date.map_or(false, |d| d >= cutoff),
                None => true,
            })
            .cloned()
            .collect();
        // newest first, undated last
        out.sort_by(|a, b| match (a.release_date, b.release_date) {
            (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.set_code.cmp(&b.set_code)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.set_code.cmp(&b.set_code),
        });
        Ok(out)
    }

    async fn list_printings(
        &self,
        filters: &PrintingFilters,
        sort: SortKey,
        limit: i64,
        offset: i64,
    ) -> StoreResult<PrintingPage> {
        let filters = filters.normalized();
        let st = self.lock();
        let mut items: Vec<PrintingListItem> = st
            .view
            .iter()
            .filter(|item| matches_filters(item, &filters))
            .cloned()
            .collect();
        sort_items(&mut items, sort);
        let total_count = items.len() as i64;
        let items = items
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok(PrintingPage { items, total_count })
    }

    async fn get_printing_detail(&self, printing_id: &str) -> StoreResult<Option<PrintingDetail>> {
        let st = self.lock();
        let Some(printing) = st.printings.get(printing_id) else {
            return Ok(None);
        };
        let (Some(card), Some(set)) = (
            st.cards.get(&printing.card_id),
            st.sets
                .get(&(printing.game_code.clone(), printing.set_code.clone())),
        ) else {
            return Ok(None);
        };
        let aggregates = st
            .aggregates
            .values()
            .filter(|a| a.printing_id == printing_id)
            .cloned()
            .collect();
        Ok(Some(PrintingDetail {
            printing: printing.clone(),
            card: card.clone(),
            set: set.clone(),
            aggregates,
        }))
    }

    async fn printing_refs(&self, query: &PrintingRefQuery) -> StoreResult<Vec<PrintingRef>> {
        let st = self.lock();
        let game = query.game_code.as_deref().map(normalize_code);
        let refs = st
            .printings
            .values()
            .filter(|p| query.after.as_ref().map_or(true, |a| &p.printing_id > a))
            .filter(|p| game.as_ref().map_or(true, |g| &p.game_code == g))
            .filter(|p| {
                query
                    .ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&p.printing_id))
            })
            .filter(|p| match query.stale_for {
                Some((source_id, since)) => !st.history.iter().any(|e| {
                    e.printing_id == p.printing_id
                        && e.source_id == source_id
                        && effective_at(e) >= since
                }),
                None => true,
            })
            .filter_map(|p| {
                let card = st.cards.get(&p.card_id)?;
                let set = st.sets.get(&(p.game_code.clone(), p.set_code.clone()))?;
                Some(PrintingRef {
                    printing_id: p.printing_id.clone(),
                    card_id: p.card_id.clone(),
                    name: card.name.clone(),
                    game_code: p.game_code.clone(),
                    set_code: p.set_code.clone(),
                    set_name: set.name.clone(),
                    collector_number: p.collector_number.clone(),
                    is_foil: p.is_foil,
                    is_nonfoil: p.is_nonfoil,
                    prices: p.prices.clone(),
                })
            })
            .take(query.limit.max(0) as usize)
            .collect();
        Ok(refs)
    }

    async fn latest_prices(
        &self,
        printing_ids: &[String],
        source_id: i16,
    ) -> StoreResult<HashMap<String, LatestPrice>> {
        let st = self.lock();
        let mut out: HashMap<String, LatestPrice> = HashMap::new();
        for e in &st.history {
            if e.source_id != source_id || !printing_ids.contains(&e.printing_id) {
                continue;
            }
            let Some(price) = e.price_usd.filter(|p| *p > 0.0) else {
                continue;
            };
            let at = effective_at(e);
            let newer = out
                .get(&e.printing_id)
                .map_or(true, |cur| at > cur.observed_at);
            if newer {
                out.insert(
                    e.printing_id.clone(),
                    LatestPrice {
                        price_usd: price,
                        observed_at: at,
                    },
                );
            }
        }
        Ok(out)
    }

    async fn aggregates_for(&self, printing_ids: &[String]) -> StoreResult<Vec<AggregatedPrice>> {
        Ok(self
            .lock()
            .aggregates
            .values()
            .filter(|a| printing_ids.contains(&a.printing_id))
            .cloned()
            .collect())
    }

    async fn recent_prices(
        &self,
        printing_ids: &[String],
        since: NaiveDate,
    ) -> StoreResult<HashMap<String, Vec<f64>>> {
        let st = self.lock();
        let mut out: HashMap<String, Vec<f64>> = HashMap::new();
        for e in &st.history {
            if e.observed_on < since || !printing_ids.contains(&e.printing_id) {
                continue;
            }
            if let Some(p) = e.price_usd.filter(|p| *p > 0.0) {
                out.entry(e.printing_id.clone()).or_default().push(p);
            }
        }
        Ok(out)
    }

    async fn list_products(&self, filters: &ProductFilters) -> StoreResult<ProductPage> {
        let st = self.lock();
        let game = filters.game.as_deref().map(normalize_code);
        let mut items: Vec<Product> = st
            .products
            .values()
            .filter(|p| {
                filters
                    .q
                    .as_deref()
                    .map_or(true, |q| contains_ci(&p.name, q.trim()))
            })
            .filter(|p| game.as_ref().map_or(true, |g| &normalize_code(&p.game_code) == g))
            .filter(|p| match filters.in_stock {
                Some(true) => p.stock > 0,
                Some(false) => p.stock <= 0,
                None => true,
            })
            .filter(|p| !filters.linked_only || p.printing_id.is_some())
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            let primary = match filters.sort {
                ProductSort::Name => a.name.cmp(&b.name),
                ProductSort::PriceAsc => a.price.total_cmp(&b.price),
                ProductSort::PriceDesc => b.price.total_cmp(&a.price),
                ProductSort::Newest => b.updated_at.cmp(&a.updated_at),
                ProductSort::Stock => b.stock.cmp(&a.stock),
            };
            primary.then_with(|| a.product_id.cmp(&b.product_id))
        });
        let total_count = items.len() as i64;
        let items = items
            .into_iter()
            .skip(filters.offset.max(0) as usize)
            .take(filters.limit.max(0) as usize)
            .collect();
        Ok(ProductPage { items, total_count })
    }

    async fn upsert_products(&self, rows: &[Product]) -> StoreResult<UpsertOutcome> {
        let mut st = self.lock();
        let mut outcome = UpsertOutcome::default();
        for row in rows {
            if let Some(pid) = &row.printing_id {
                if !st.printings.contains_key(pid) {
                    return Err(StoreError::DependencyMissing(format!("printing {pid}")));
                }
            }
            let inserted = st.products.insert(row.product_id, row.clone()).is_none();
            count(&mut outcome, inserted);
        }
        Ok(outcome)
    }

    async fn stats(&self) -> StoreResult<CatalogStats> {
        let st = self.lock();
        Ok(CatalogStats {
            games: st.games.len() as i64,
            sets: st.sets.len() as i64,
            cards: st.cards.len() as i64,
            printings: st.printings.len() as i64,
            price_history: st.history.len() as i64,
            aggregates: st.aggregates.len() as i64,
            products: st.products.len() as i64,
            users: st.profiles.len() as i64,
        })
    }

    async fn active_alerts(&self) -> StoreResult<Vec<PriceAlert>> {
        Ok(self
            .lock()
            .alerts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect())
    }

    async fn mark_alert_triggered(
        &self,
        alert_id: i64,
        at: DateTime<Utc>,
        deactivate: bool,
    ) -> StoreResult<()> {
        let mut st = self.lock();
        let alert = st
            .alerts
            .get_mut(&alert_id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {alert_id}")))?;
        alert.last_triggered_at = Some(at);
        if deactivate {
            alert.is_active = false;
        }
        Ok(())
    }

    async fn record_notification(&self, notification: &AlertNotification) -> StoreResult<()> {
        let mut st = self.lock();
        if !st.alerts.contains_key(&notification.alert_id) {
            return Err(StoreError::DependencyMissing(format!(
                "alert {}",
                notification.alert_id
            )));
        }
        st.notifications.push(notification.clone());
        Ok(())
    }

    async fn repair_price_history(&self) -> StoreResult<RepairSummary> {
        let mut st = self.lock();
        let mut summary = RepairSummary::default();
        let before = st.history.len();
        let snapshot = st.history.clone();
        st.history.retain(|e| {
            e.condition.is_some()
                || !snapshot.iter().any(|o| {
                    o.condition == Some(Condition::NearMint)
                        && o.printing_id == e.printing_id
                        && o.source_id == e.source_id
                        && o.observed_on == e.observed_on
                })
        });
        summary.duplicates_removed = (before - st.history.len()) as u64;
        // two legacy rows for the same key: keep the first, drop the rest
        let mut seen: Vec<(String, i16, NaiveDate)> = Vec::new();
        let mut extra = 0u64;
        st.history.retain(|e| {
            if e.condition.is_some() {
                return true;
            }
            let key = (e.printing_id.clone(), e.source_id, e.observed_on);
            if seen.contains(&key) {
                extra += 1;
                false
            } else {
                seen.push(key);
                true
            }
        });
        summary.duplicates_removed += extra;
        for e in st.history.iter_mut() {
            if e.condition.is_none() {
                e.condition = Some(Condition::NearMint);
                summary.conditions_filled += 1;
            }
            if e.observed_at.is_none() {
                e.observed_at = e.observed_on.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
                summary.timestamps_filled += 1;
            }
        }
        Ok(summary)
    }

    async fn fill_usd_from_eur(&self, eur_usd: f64) -> StoreResult<u64> {
        let mut st = self.lock();
        let mut filled = 0;
        for e in st.history.iter_mut() {
            if let (None, Some(eur)) = (e.price_usd, e.price_eur.filter(|p| *p > 0.0)) {
                e.price_usd = Some(round_cents(eur * eur_usd));
                filled += 1;
            }
        }
        Ok(filled)
    }

    async fn archive_price_history(&self, cutoff: NaiveDate) -> StoreResult<u64> {
        let mut st = self.lock();
        let (old, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut st.history)
            .into_iter()
            .partition(|e| e.observed_on < cutoff);
        st.history = keep;
        let moved = old.len() as u64;
        st.archive.extend(old);
        Ok(moved)
    }

    async fn resolve_profile_role(&self, user_id: &str) -> StoreResult<Option<String>> {
        Ok(self.lock().profiles.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(code: &str) -> CardSet {
        CardSet {
            game_code: "MTG".into(),
            set_code: code.into(),
            name: format!("Set {code}"),
            release_date: NaiveDate::from_ymd_opt(2024, 10, 1),
            card_count: Some(1),
            printed_size: None,
            set_type: Some("expansion".into()),
            is_digital: false,
            is_promo: false,
            icon_uri: None,
        }
    }

    fn card(id: &str, game: &str) -> Card {
        Card {
            card_id: id.into(),
            game_code: game.into(),
            name: "Lightning Bolt".into(),
            oracle_text: None,
            mana_cost: Some("{R}".into()),
            type_line: Some("Instant".into()),
            rarity: Some("common".into()),
            cmc: Some(1.0),
            colors: vec!["R".into()],
            color_identity: vec!["R".into()],
            legalities: HashMap::new(),
        }
    }

    fn printing(id: &str, card_id: &str, game: &str, set_code: &str) -> Printing {
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

    #[tokio::test]
    async fn upserts_require_parents() {
        let store = MemoryCatalog::seeded();
        let err = store
            .upsert_printings(&[printing("P1", "O1", "mtg", "ecl")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DependencyMissing(_)));

        store.upsert_sets(&[set("ECL")]).await.unwrap();
        store.upsert_cards(&[card("O1", "mtg")]).await.unwrap();
        let out = store
            .upsert_printings(&[printing("P1", "O1", "mtg", "ecl")])
            .await
            .unwrap();
        assert_eq!(out.inserted, 1);
        let again = store
            .upsert_printings(&[printing("P1", "O1", "mtg", "ecl")])
            .await
            .unwrap();
        assert_eq!(again, UpsertOutcome { inserted: 0, updated: 1 });
    }

    #[tokio::test]
    async fn card_and_set_must_share_game() {
        let store = MemoryCatalog::seeded();
        store.upsert_sets(&[set("ecl")]).await.unwrap();
        store.upsert_cards(&[card("pk1", "pokemon")]).await.unwrap();
        let err = store
            .upsert_printings(&[printing("P9", "pk1", "mtg", "ecl")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_consumed() {
        let store = MemoryCatalog::seeded();
        store.fail_next_writes(1);
        assert!(store.upsert_sets(&[set("ecl")]).await.unwrap_err().is_transient());
        assert!(store.upsert_sets(&[set("ecl")]).await.is_ok());
    }
}
