//! Payload parsing and filter evaluation.
//!
//! Payloads arrive in feed order. Each one is decoded and evaluated on the
//! worker pool against the current [`ScanContext`]; matches then pass the
//! dedup index, the cursor is committed, and accepted matches go to the
//! result handler. A payload that fails to decode or evaluate is captured to
//! disk and skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::currency::CurrencySnapshot;
use crate::feed::{FeedDownloader, FeedPayload, NextResult};
use crate::filter::CompiledFilter;
use crate::item::{Item, StashSnapshot, StashTab};
use crate::monitoring::health::HealthState;
use crate::scanner::results::{ItemMatch, ResultHandler, StashContext};
use crate::state::StateStore;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a payload is evaluated against. Built by the update scheduler
/// and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ScanContext {
    /// Active filters in evaluation order.
    pub filters: Vec<Arc<CompiledFilter>>,
    pub currency: Arc<CurrencySnapshot>,
    /// Items listed above this price are skipped.
    pub budget: Option<Decimal>,
}

/// Per-payload statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseStats {
    pub change_id: String,
    pub tabs: usize,
    pub league_tabs: usize,
    pub items: usize,
    pub matches: usize,
    pub accepted: usize,
    pub parse_ms: f64,
    pub items_per_second: f64,
}

/// Result of decoding and evaluating one payload.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub tabs: usize,
    pub league_tabs: usize,
    pub items: usize,
    pub matches: Vec<ItemMatch>,
}

fn evaluate_item(raw_item: &crate::item::RawItem, tab: &StashTab, ctx: &ScanContext) -> Option<ItemMatch> {
    let item = Item::from_raw(raw_item, tab, &ctx.currency);
    if let (Some(budget), Some(price)) = (ctx.budget, item.price) {
        if price > budget {
            return None;
        }
    }

    // first match wins
    let filter = ctx.filters.iter().find(|f| f.check(&item))?;
    Some(ItemMatch {
        item,
        stash: StashContext::from_tab(tab),
        filter_id: filter.id.clone(),
        filter_title: filter.title.clone(),
    })
}

/// Evaluate every item of `tabs` in parallel on the current rayon pool.
pub fn evaluate_tabs(tabs: &[StashTab], ctx: &ScanContext) -> Vec<ItemMatch> {
    tabs.par_iter()
        .flat_map_iter(|tab| {
            tab.items
                .iter()
                .filter_map(move |raw_item| evaluate_item(raw_item, tab, ctx))
        })
        .collect()
}

/// Decode a payload and evaluate its tabs for `league`.
pub fn evaluate_payload(body: &[u8], league: &str, ctx: &ScanContext) -> serde_json::Result<Evaluation> {
    let snapshot = StashSnapshot::from_slice(body)?;
    let tabs = snapshot.stashes.len();
    let league_tabs = snapshot.league_tabs(league);
    let items = league_tabs.iter().map(|tab| tab.items.len()).sum();
    let matches = evaluate_tabs(&league_tabs, ctx);

    Ok(Evaluation {
        tabs,
        league_tabs: league_tabs.len(),
        items,
        matches,
    })
}

/// Write a payload that failed to parse to `<dir>/<change-id>-<uuid>.json`.
pub fn capture_payload(dir: &Path, payload: &FeedPayload) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create error directory: {}", dir.display()))?;
    let path = dir.join(format!("{}-{}.json", payload.change_id, Uuid::new_v4()));
    std::fs::write(&path, &payload.body)
        .with_context(|| format!("Failed to write payload capture: {}", path.display()))?;
    Ok(path)
}

type EvaluateFn = fn(&[u8], &str, &ScanContext) -> serde_json::Result<Evaluation>;

pub struct ParserDispatcher {
    league: String,
    evaluate: EvaluateFn,
    pool: Arc<rayon::ThreadPool>,
    state: StateStore,
    handler: Arc<dyn ResultHandler>,
    context: watch::Receiver<Arc<ScanContext>>,
    error_dir: PathBuf,
    health: Option<HealthState>,
}

impl ParserDispatcher {
    pub fn new(
        league: impl Into<String>,
        workers: usize,
        state: StateStore,
        handler: Arc<dyn ResultHandler>,
        context: watch::Receiver<Arc<ScanContext>>,
        error_dir: PathBuf,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("scan-worker-{i}"))
            .build()
            .context("Failed to create worker pool")?;

        Ok(Self {
            league: league.into(),
            evaluate: evaluate_payload,
            pool: Arc::new(pool),
            state,
            handler,
            context,
            error_dir,
            health: None,
        })
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    #[cfg(test)]
    fn with_evaluator(mut self, evaluate: EvaluateFn) -> Self {
        self.evaluate = evaluate;
        self
    }

    fn capture(&self, payload: &FeedPayload) {
        match capture_payload(&self.error_dir, payload) {
            Ok(path) => info!(path = %path.display(), "Payload captured"),
            Err(e) => warn!(error = %e, "Failed to capture payload"),
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Give the state store back, e.g. to close it on shutdown.
    pub fn into_state(self) -> StateStore {
        self.state
    }

    /// Consume payloads until `stop` fires or the downloader closes.
    pub async fn run(&mut self, downloader: &mut FeedDownloader, stop: &CancellationToken) {
        info!(league = %self.league, workers = self.pool.current_num_threads(), "Parser dispatcher started");

        loop {
            if stop.is_cancelled() {
                break;
            }
            let payload = tokio::select! {
                _ = stop.cancelled() => break,
                result = downloader.next_result(POLL_TIMEOUT) => match result {
                    NextResult::Payload(payload) => payload,
                    NextResult::Timeout => continue,
                    NextResult::Closed => {
                        info!("Feed closed, dispatcher stopping");
                        break;
                    }
                },
            };

            if let Err(e) = self.process(&payload).await {
                error!(error = %e, change_id = %payload.change_id, "Failed processing payload");
            }
            if let Some(health) = &self.health {
                health.record_downloader(downloader.stats()).await;
            }
        }

        info!("Parser dispatcher stopped");
    }

    /// Process one payload end to end and commit its state.
    pub async fn process(&mut self, payload: &FeedPayload) -> Result<ParseStats> {
        let started = Instant::now();
        let ctx = self.context.borrow().clone();
        let pool = self.pool.clone();
        let league = self.league.clone();
        let body = payload.body.clone();
        let evaluate = self.evaluate;

        let outcome = tokio::task::spawn_blocking(move || {
            pool.install(|| evaluate(&body, &league, &ctx))
        })
        .await;

        // the payload is skipped either way so the cursor still moves on
        let evaluation = match outcome {
            Ok(Ok(evaluation)) => evaluation,
            Ok(Err(e)) => {
                error!(error = %e, change_id = %payload.change_id, "Failed to parse payload");
                self.capture(payload);
                Evaluation::default()
            }
            Err(e) => {
                error!(error = %e, change_id = %payload.change_id, "Payload evaluation failed");
                self.capture(payload);
                Evaluation::default()
            }
        };

        let mut accepted = Vec::new();
        for m in &evaluation.matches {
            let price = m.item.listing.as_ref().map(|l| l.raw.as_str());
            if self.state.add_item(&m.item.id, price, &m.stash.account_name) {
                accepted.push(m);
            }
        }
        self.state.save_state(&payload.next_change_id)?;

        for m in &accepted {
            if let Err(e) = self.handler.handle(m).await {
                warn!(error = %e, item = %m.item.id, "Result handler failed");
            }
        }

        let elapsed = started.elapsed();
        let secs = elapsed.as_secs_f64();
        let stats = ParseStats {
            change_id: payload.change_id.to_string(),
            tabs: evaluation.tabs,
            league_tabs: evaluation.league_tabs,
            items: evaluation.items,
            matches: evaluation.matches.len(),
            accepted: accepted.len(),
            parse_ms: secs * 1000.0,
            items_per_second: if secs > 0.0 { evaluation.items as f64 / secs } else { 0.0 },
        };
        debug!(
            change_id = %stats.change_id,
            tabs = stats.tabs,
            league_tabs = stats.league_tabs,
            items = stats.items,
            matches = stats.matches,
            accepted = stats.accepted,
            parse_ms = stats.parse_ms,
            items_per_second = stats.items_per_second,
            "Payload processed"
        );
        if let Some(health) = &self.health {
            health.record_parse(&stats).await;
        }
        Ok(stats)
    }
}
