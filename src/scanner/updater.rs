//! Periodic refresh of currency rates and generated filters.
//!
//! The scheduler owns nothing the dispatcher reads directly: after a refresh
//! it recompiles under the compile lock and publishes a new immutable
//! [`ScanContext`]. In-flight evaluation keeps using the previous one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::currency::CurrencyTable;
use crate::error::ScanError;
use crate::filter::FilterCompiler;
use crate::monitoring::health::HealthState;
use crate::scanner::dispatcher::ScanContext;

pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Currency table and filter compiler, guarded together by the compile lock.
pub struct Services {
    pub currency: CurrencyTable,
    pub filters: FilterCompiler,
}

pub type SharedServices = Arc<Mutex<Services>>;

impl Services {
    /// Compile every filter against the current rates.
    pub fn build_context(&mut self) -> Result<Arc<ScanContext>, ScanError> {
        let currency = self.currency.snapshot();
        let summary = self.filters.compile_all(&currency);
        if summary.active == 0 {
            return Err(ScanError::NoActiveFilters);
        }
        Ok(Arc::new(ScanContext {
            filters: self.filters.active(),
            currency,
            budget: self.filters.budget(),
        }))
    }
}

pub struct UpdateScheduler {
    services: SharedServices,
    context_tx: watch::Sender<Arc<ScanContext>>,
    interval: Duration,
    health: Option<HealthState>,
}

impl UpdateScheduler {
    pub fn new(
        services: SharedServices,
        context_tx: watch::Sender<Arc<ScanContext>>,
        interval: Duration,
    ) -> Self {
        Self {
            services,
            context_tx,
            interval,
            health: None,
        }
    }

    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    /// Refresh whatever is due. Returns true if a new context was published.
    pub async fn tick(&self, force: bool) -> bool {
        let mut services = self.services.lock().await;
        let mut changed = false;

        if force || services.currency.needs_update() {
            match services.currency.update(force, false).await {
                Ok(updated) => changed |= updated,
                Err(e) => warn!(error = %e, "Currency update failed"),
            }
        }
        if force || services.filters.needs_update() {
            match services.filters.update_auto(force).await {
                Ok(updated) => changed |= updated,
                Err(e) => warn!(error = %e, "Generated filter update failed"),
            }
        }

        if !changed {
            debug!("Nothing to update");
            return false;
        }

        match services.build_context() {
            Ok(ctx) => {
                let active = ctx.filters.len();
                self.context_tx.send_replace(ctx);
                info!(active, "Published recompiled filters");
                if let Some(health) = &self.health {
                    health.record_filters(active).await;
                }
                true
            }
            Err(e) => {
                error!(error = %e, "Recompile left no active filters, keeping the previous set");
                false
            }
        }
    }

    pub async fn run(self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately and startup already refreshed
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(false).await;
                }
            }
        }
        debug!("Update scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfidenceLevel, CurrencyConfig, FiltersConfig};
    use crate::currency::rates::{RateSnapshot, StaticRates};
    use crate::filter::definition::{Criteria, Filter, AUTO_CATEGORY};
    use crate::filter::ItemPriceSource;
    use anyhow::Result;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::path::Path;

    struct FixedItems(Vec<Filter>);

    #[async_trait]
    impl ItemPriceSource for FixedItems {
        async fn fetch_filters(&self) -> Result<Vec<Filter>> {
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn generated(id: &str, price: &str) -> Filter {
        let mut filter = Filter::new(
            id,
            id,
            Criteria {
                price_max: Some(price.to_string()),
                ..Criteria::default()
            },
        );
        filter.category = AUTO_CATEGORY.to_string();
        filter
    }

    async fn services(dir: &Path, items: Vec<Filter>) -> Services {
        let mut currency = CurrencyTable::new(
            &CurrencyConfig {
                rates_url: String::new(),
                update_interval_minutes: 30,
                confidence_level: ConfidenceLevel::Low,
            },
            Some(dir.join("currency.json")),
            Arc::new(StaticRates::new(RateSnapshot {
                rates: [("Exalted Orb".to_string(), dec!(150))].into_iter().collect(),
                aliases: Vec::new(),
            })),
        );
        currency.load().unwrap();
        currency.update(true, false).await.unwrap();

        let mut filters = FilterCompiler::new(
            &FiltersConfig {
                user_file: dir.join("filters.json"),
                config_file: dir.join("filter_config.json"),
                item_prices_urls: Vec::new(),
                update_interval_minutes: 10,
            },
            dir.join("auto.json"),
            Some(Arc::new(FixedItems(items))),
        );
        filters.load().unwrap();
        Services { currency, filters }
    }

    #[tokio::test]
    async fn test_tick_publishes_new_context() {
        let dir = tempfile::tempdir().unwrap();
        let mut services = services(dir.path(), vec![generated("_mirror", "2 exa")]).await;
        assert!(matches!(services.build_context(), Err(ScanError::NoActiveFilters)));

        let initial = Arc::new(ScanContext {
            filters: Vec::new(),
            currency: services.currency.snapshot(),
            budget: None,
        });
        let (tx, rx) = watch::channel(initial);
        let scheduler = UpdateScheduler::new(Arc::new(Mutex::new(services)), tx, DEFAULT_TICK);

        // generated filters were never fetched, so they are due
        assert!(scheduler.tick(false).await);
        let ctx = rx.borrow().clone();
        assert_eq!(ctx.filters.len(), 1);
        assert_eq!(ctx.filters[0].price_max(), Some(dec!(240)));

        // nothing due now
        assert!(!scheduler.tick(false).await);
    }

    #[tokio::test]
    async fn test_tick_keeps_previous_context_without_active_filters() {
        let dir = tempfile::tempdir().unwrap();
        // below the default 1 exalted threshold
        let services = services(dir.path(), vec![generated("_cheap", "5 chaos")]).await;
        let initial = Arc::new(ScanContext {
            filters: Vec::new(),
            currency: services.currency.snapshot(),
            budget: Some(dec!(1)),
        });
        let (tx, rx) = watch::channel(initial);
        let scheduler = UpdateScheduler::new(Arc::new(Mutex::new(services)), tx, DEFAULT_TICK);

        assert!(!scheduler.tick(true).await);
        assert_eq!(rx.borrow().budget, Some(dec!(1)));
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path(), Vec::new()).await;
        let initial = Arc::new(ScanContext {
            filters: Vec::new(),
            currency: services.currency.snapshot(),
            budget: None,
        });
        let (tx, _rx) = watch::channel(initial);
        let scheduler = UpdateScheduler::new(Arc::new(Mutex::new(services)), tx, Duration::from_millis(10));

        let stop = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
