//! Scanner lifecycle.
//!
//! Startup refreshes whatever is due, compiles filters and resolves the
//! initial feed position. Then three actors run until the stop signal: the
//! feed downloader, the parser dispatcher and the update scheduler. A
//! downloader that ends on its own is restarted from the last committed
//! cursor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ScanMode, Secrets};
use crate::currency::rates::{NinjaRateSource, RateSource};
use crate::currency::CurrencyTable;
use crate::error::ScanError;
use crate::feed::latest::wait_for_latest_change_id;
use crate::feed::{ChangeId, FeedDownloader};
use crate::filter::{FilterCompiler, ItemPriceSource, NinjaItemSource};
use crate::monitoring::alerts::WebhookNotifier;
use crate::monitoring::health::{spawn_health_server, HealthState};
use crate::scanner::dispatcher::{ParserDispatcher, ScanContext};
use crate::scanner::results::{FanOutHandler, LogResultHandler, ResultHandler};
use crate::scanner::updater::{Services, SharedServices, UpdateScheduler, DEFAULT_TICK};
use crate::state::StateStore;

pub struct Scanner {
    config: AppConfig,
    services: SharedServices,
    handler: Arc<dyn ResultHandler>,
    health: HealthState,
    http: reqwest::Client,
    update_tick: Duration,
}

impl Scanner {
    pub fn new(
        config: AppConfig,
        rates: Arc<dyn RateSource>,
        items: Option<Arc<dyn ItemPriceSource>>,
        handler: Arc<dyn ResultHandler>,
    ) -> Result<Self> {
        let currency = CurrencyTable::new(
            &config.currency,
            Some(config.scanner.currency_file()),
            rates,
        );
        let filters = FilterCompiler::new(&config.filters, config.scanner.auto_filters_file(), items);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.feed.request_timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            health: HealthState::new(&config.scanner.league),
            services: Arc::new(Mutex::new(Services { currency, filters })),
            config,
            handler,
            http,
            update_tick: DEFAULT_TICK,
        })
    }

    /// Wire up the poe.ninja sources and the log and webhook handlers.
    pub fn from_config(config: AppConfig, secrets: &Secrets) -> Result<Self> {
        let league = config.scanner.league.clone();
        let rates = Arc::new(NinjaRateSource::new(&config.currency.rates_url, &league)?);
        let items: Option<Arc<dyn ItemPriceSource>> = if config.filters.item_prices_urls.is_empty() {
            None
        } else {
            Some(Arc::new(NinjaItemSource::new(
                config.filters.item_prices_urls.clone(),
                &league,
            )?))
        };

        let webhook = WebhookNotifier::new(
            secrets.discord_webhook_url.clone(),
            config.monitoring.webhook_enabled,
        );
        let handler = Arc::new(FanOutHandler::new(vec![
            Arc::new(LogResultHandler),
            Arc::new(webhook),
        ]));

        Self::new(config, rates, items, handler)
    }

    pub fn with_update_tick(mut self, tick: Duration) -> Self {
        self.update_tick = tick;
        self
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Shared currency table and filter compiler, for read-only inspection.
    pub fn services(&self) -> SharedServices {
        self.services.clone()
    }

    async fn prepare(&self) -> Result<Arc<ScanContext>> {
        let mut services = self.services.lock().await;

        services.currency.load()?;
        if services.currency.needs_update() {
            match services.currency.update(false, false).await {
                Ok(_) => info!("Currency rates updated"),
                Err(e) => {
                    error!(error = %e, "Currency update failed");
                    if !services.currency.is_initialized() {
                        return Err(ScanError::NoCurrencyRates.into());
                    }
                    warn!("Using currency rates from the local copy");
                }
            }
        }

        services.filters.load()?;
        if services.filters.needs_update() {
            if let Err(e) = services.filters.update_auto(false).await {
                error!(error = %e, "Generated filter update failed");
            }
        }

        let ctx = services.build_context()?;
        self.health.record_filters(ctx.filters.len()).await;
        Ok(ctx)
    }

    /// Pick the starting change id, fetching the head of the feed when there
    /// is no cursor or the scan starts from the latest position.
    async fn resolve_start(&self, state: &mut StateStore, stop: &CancellationToken) -> Result<ChangeId> {
        let saved = state.change_id().cloned();
        if let (Some(saved), ScanMode::Resume) = (&saved, self.config.scanner.mode) {
            return Ok(saved.clone());
        }

        info!("Fetching latest change id");
        let Some(latest) =
            wait_for_latest_change_id(&self.http, &self.config.feed.latest_id_url, stop).await
        else {
            return Err(ScanError::NoInitialChangeId.into());
        };

        match saved {
            Some(saved) if saved.delta(&latest) <= 0 => {
                info!(saved = %saved, latest = %latest, "Saved change id is more recent, continuing");
                Ok(saved)
            }
            _ => {
                state.save_state(&latest)?;
                Ok(latest)
            }
        }
    }

    /// Run until `stop` fires. Returns an error only for startup failures.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        info!(league = %self.config.scanner.league, "Scan initializing");

        let ctx = self.prepare().await?;

        let mut state = StateStore::new(self.config.scanner.state_dir());
        state.load_state()?;
        let start = match self.resolve_start(&mut state, &stop).await {
            Ok(start) => start,
            Err(e) => {
                state.close()?;
                return Err(e);
            }
        };

        let (context_tx, context_rx) = watch::channel(ctx);
        let mut dispatcher = ParserDispatcher::new(
            &self.config.scanner.league,
            self.config.scanner.worker_count(),
            state,
            self.handler.clone(),
            context_rx,
            self.config.scanner.error_dir(),
        )?
        .with_health(self.health.clone());

        let health_handle = (!self.config.monitoring.health_addr.is_empty()).then(|| {
            spawn_health_server(self.config.monitoring.health_addr.clone(), self.health.clone())
        });
        let status_handle = spawn_status_log(
            self.health.clone(),
            Duration::from_secs(self.config.scanner.status_interval_seconds.max(1)),
            stop.clone(),
        );

        let updater = UpdateScheduler::new(self.services.clone(), context_tx, self.update_tick)
            .with_health(self.health.clone());
        let updater_handle = tokio::spawn(updater.run(stop.clone()));

        info!(start = %start, "Scanning started");
        self.health.set_status("scanning").await;

        while !stop.is_cancelled() {
            let Some(cursor) = dispatcher.state().change_id().cloned() else {
                error!("State has no change id");
                break;
            };
            let mut downloader = match FeedDownloader::start(
                &self.config.feed,
                cursor,
                self.config.feed.skip_ahead,
                &stop,
            ) {
                Ok(downloader) => downloader,
                Err(e) => {
                    error!(error = %e, "Failed to start feed downloader");
                    break;
                }
            };

            dispatcher.run(&mut downloader, &stop).await;
            downloader.join().await;

            if !stop.is_cancelled() {
                warn!("Feed downloader ended abruptly, restarting it");
            }
        }

        // drain: the dispatcher is done, so no save can race the close
        stop.cancel();
        if let Err(e) = updater_handle.await {
            warn!(error = %e, "Update scheduler ended abnormally");
        }
        status_handle.abort();
        if let Some(handle) = health_handle {
            handle.abort();
        }

        let mut state = dispatcher.into_state();
        state.close()?;
        self.health.set_status("stopped").await;
        info!("Scanning stopped");
        Ok(())
    }
}

fn spawn_status_log(
    health: HealthState,
    every: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => health.log_status().await,
            }
        }
    })
}
