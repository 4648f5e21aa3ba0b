//! Catalog synchronizer: walk a game's sets against its upstream registry
//! and upsert cards and printings.

pub mod normalize;
pub mod pokemon;
pub mod registry;
pub mod scryfall;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::instrument;

use crate::catalog::{normalize_code, Card, CardSet, CatalogStore, Printing, UpsertOutcome};
use crate::error::{StoreError, UpstreamError};
use crate::retry::{retry_async, RetryPolicy};
use crate::tasks::{Cancelled, TaskContext};

pub use pokemon::PokemonTcgClient;
pub use registry::{CardRegistry, RegistryCard, RegistryFace, RegistryPage};
pub use scryfall::ScryfallClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "days")]
pub enum SyncMode {
    Full,
    /// Only sets released within the last N days.
    Recent(u32),
}

impl SyncMode {
    pub fn since(self, today: NaiveDate) -> Option<NaiveDate> {
        match self {
            SyncMode::Full => None,
            SyncMode::Recent(days) => Some(today - ChronoDuration::days(i64::from(days))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub game: String,
    pub sets_processed: u64,
    pub sets_skipped: u64,
    pub sets_failed: u64,
    pub failed_sets: Vec<String>,
    pub cards_processed: u64,
    pub printings_processed: u64,
    /// Registry objects dropped for missing identity or similar.
    pub items_skipped: u64,
    pub cards: UpsertOutcome,
    pub printings: UpsertOutcome,
    pub sets: UpsertOutcome,
}

#[derive(Debug)]
enum SetFailure {
    Upstream(UpstreamError),
    Store(StoreError),
    Cancelled,
}

impl std::fmt::Display for SetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetFailure::Upstream(e) => write!(f, "upstream: {e}"),
            SetFailure::Store(e) => write!(f, "store: {e}"),
            SetFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

enum SetOutcome {
    Synced,
    Skipped,
}

/// Rows gathered for one set, deduped by identity.
#[derive(Default)]
struct Batch {
    cards: IndexMap<String, Card>,
    printings: IndexMap<String, Printing>,
}

impl Batch {
    fn len(&self) -> usize {
        self.printings.len().max(self.cards.len())
    }

    fn is_empty(&self) -> bool {
        self.cards.is_empty() && self.printings.is_empty()
    }
}

pub struct Synchronizer {
    store: Arc<dyn CatalogStore>,
    registries: HashMap<String, Arc<dyn CardRegistry>>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn CatalogStore>, retry: RetryPolicy, batch_size: usize) -> Self {
        Self {
            store,
            registries: HashMap::new(),
            retry,
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn CardRegistry>) -> Self {
        self.registries
            .insert(normalize_code(registry.game_code()), registry);
        self
    }

    pub fn games(&self) -> Vec<String> {
        let mut games: Vec<String> = self.registries.keys().cloned().collect();
        games.sort();
        games
    }

    pub fn registry(&self, game_code: &str) -> Option<Arc<dyn CardRegistry>> {
        self.registries.get(&normalize_code(game_code)).cloned()
    }

    /// Bring one game's sets, cards and printings in line with the registry.
    #[instrument(skip(self, ctx), fields(game = %game_code, task_id = ?ctx.task_id()))]
    pub async fn sync_game(&self, game_code: &str, mode: SyncMode, ctx: &TaskContext) -> Result<SyncSummary> {
        let game = normalize_code(game_code);
        let registry = self
            .registry(&game)
            .ok_or_else(|| anyhow!("no registry configured for game '{game}'"))?;
        let mut summary = SyncSummary {
            game: game.clone(),
            ..SyncSummary::default()
        };

        if self.store.sets_for_sync(&game, None).await?.is_empty() {
            ctx.info(format!("no sets stored for {game}; bootstrapping from registry"));
            summary.sets += self.refresh_sets(registry.as_ref(), ctx).await?;
        }

        let since = mode.since(Utc::now().date_naive());
        let mut sets = self.store.sets_for_sync(&game, since).await?;
        // newest first, undated last
        sets.sort_by(|a, b| match (a.release_date, b.release_date) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        ctx.info(format!("syncing {} sets for {game} ({mode:?})", sets.len()));

        for set in &sets {
            ctx.check_cancelled()?;
            match self.sync_set(registry.as_ref(), set, ctx, &mut summary).await {
                Ok(SetOutcome::Synced) => summary.sets_processed += 1,
                Ok(SetOutcome::Skipped) => {
                    summary.sets_skipped += 1;
                    ctx.info(format!("set {} unknown upstream; skipped", set.set_code));
                }
                Err(SetFailure::Cancelled) => return Err(Cancelled.into()),
                Err(err) => {
                    summary.sets_failed += 1;
                    summary.failed_sets.push(set.set_code.clone());
                    ctx.error(format!("set {} failed: {err}", set.set_code));
                }
            }
        }

        ctx.check_cancelled()?;
        match self.refresh_sets(registry.as_ref(), ctx).await {
            Ok(outcome) => summary.sets += outcome,
            Err(err) => ctx.warn(format!("set metadata refresh failed: {err}")),
        }

        ctx.info(format!(
            "sync {game} done: {} sets, {} skipped, {} failed, {} cards, {} printings",
            summary.sets_processed,
            summary.sets_skipped,
            summary.sets_failed,
            summary.cards_processed,
            summary.printings_processed
        ));
        Ok(summary)
    }

    /// Upsert the registry's set list for the registry's game.
    pub async fn refresh_sets(&self, registry: &dyn CardRegistry, ctx: &TaskContext) -> Result<UpsertOutcome> {
        let game = normalize_code(registry.game_code());
        let fetched = retry_async(&self.retry, "registry.list_sets", move || registry.list_sets()).await?;
        let rows: Vec<CardSet> = fetched
            .into_iter()
            .map(|mut s| {
                s.game_code = game.clone();
                s.set_code = normalize_code(&s.set_code);
                s
            })
            .collect();
        let store = self.store.as_ref();
        let rows = rows.as_slice();
        let outcome = retry_async(&self.retry, "store.upsert_sets", move || store.upsert_sets(rows)).await?;
        ctx.info(format!("{} set rows upserted for {game}", outcome.total()));
        Ok(outcome)
    }

    /// Fetch and upsert individual printings by (set, collector number).
    /// Unknown printings are skipped with a warning.
    pub async fn sync_printings(
        &self,
        game_code: &str,
        refs: &[(String, String)],
        ctx: &TaskContext,
    ) -> Result<SyncSummary> {
        let game = normalize_code(game_code);
        let registry = self
            .registry(&game)
            .ok_or_else(|| anyhow!("no registry configured for game '{game}'"))?;
        let mut summary = SyncSummary {
            game: game.clone(),
            ..SyncSummary::default()
        };
        let mut batch = Batch::default();
        for (set_code, number) in refs {
            ctx.check_cancelled()?;
            let reg = registry.as_ref();
            let (set_code, number) = (set_code.as_str(), number.as_str());
            match retry_async(&self.retry, "registry.card_by_collector", move || {
                reg.card_by_collector(set_code, number)
            })
            .await
            {
                Ok(rc) => self.collect(&rc, &game, set_code, &mut batch, ctx, &mut summary),
                Err(e) if e.is_not_found() => {
                    summary.items_skipped += 1;
                    ctx.warn(format!("printing {set_code}/{number} not found upstream"));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.flush(&mut batch, &mut summary).await?;
        Ok(summary)
    }

    async fn sync_set(
        &self,
        registry: &dyn CardRegistry,
        set: &CardSet,
        ctx: &TaskContext,
        summary: &mut SyncSummary,
    ) -> std::result::Result<SetOutcome, SetFailure> {
        let mut batch = Batch::default();
        let mut page: Option<String> = None;
        let mut first = true;
        let mut fetched = 0usize;

        loop {
            if ctx.is_cancelled() {
                return Err(SetFailure::Cancelled);
            }
            let set_code = set.set_code.as_str();
            let page_ref = page.as_deref();
            let result = retry_async(&self.retry, "registry.search_set_page", move || {
                registry.search_set_page(set_code, page_ref)
            })
            .await;
            let data = match result {
                Ok(p) => p,
                Err(e) if e.is_not_found() && first => return Ok(SetOutcome::Skipped),
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(SetFailure::Upstream(e)),
            };
            first = false;
            fetched += data.data.len();

            for rc in &data.data {
                self.collect(rc, &set.game_code, &set.set_code, &mut batch, ctx, summary);
            }
            if batch.len() >= self.batch_size {
                self.flush(&mut batch, summary).await.map_err(SetFailure::Store)?;
            }

            match data.next_page {
                Some(next) if data.has_more => {
                    page = Some(next);
                    tokio::time::sleep(registry.page_delay()).await;
                }
                _ => break,
            }
        }

        self.flush(&mut batch, summary).await.map_err(SetFailure::Store)?;
        ctx.info(format!("set {}: {fetched} printings fetched", set.set_code));
        Ok(SetOutcome::Synced)
    }

    fn collect(
        &self,
        rc: &RegistryCard,
        game: &str,
        set_code: &str,
        batch: &mut Batch,
        ctx: &TaskContext,
        summary: &mut SyncSummary,
    ) {
        match normalize::to_card(rc, game) {
            Ok(card) => {
                let printing = normalize::to_printing(rc, &card.card_id, game, set_code);
                batch.cards.insert(card.card_id.clone(), card);
                batch.printings.insert(printing.printing_id.clone(), printing);
            }
            Err(err) => {
                summary.items_skipped += 1;
                ctx.warn(format!("skipping {}: {err}", rc.id));
            }
        }
    }

    /// Cards, then printings.
    async fn flush(&self, batch: &mut Batch, summary: &mut SyncSummary) -> std::result::Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let cards: Vec<Card> = batch.cards.drain(..).map(|(_, c)| c).collect();
        let printings: Vec<Printing> = batch.printings.drain(..).map(|(_, p)| p).collect();
        let store = self.store.as_ref();
        let (cards, printings) = (cards.as_slice(), printings.as_slice());

        let c = retry_async(&self.retry, "store.upsert_cards", move || store.upsert_cards(cards)).await?;
        let p = retry_async(&self.retry, "store.upsert_printings", move || {
            store.upsert_printings(printings)
        })
        .await?;
        summary.cards_processed += cards.len() as u64;
        summary.printings_processed += printings.len() as u64;
        summary.cards += c;
        summary.printings += p;
        Ok(())
    }
}
