//! External currency rate sources.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Rates in the base unit plus any aliases the source knows about.
#[derive(Debug, Clone, Default)]
pub struct RateSnapshot {
    pub rates: HashMap<String, Decimal>,
    /// (alias, canonical name) pairs.
    pub aliases: Vec<(String, String)>,
}

/// Where observed currency rates come from.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Fetch rates, dropping entries traded fewer than `min_count` times.
    async fn fetch_rates(&self, min_count: u64) -> Result<RateSnapshot>;

    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverviewResponse {
    #[serde(default)]
    lines: Vec<OverviewLine>,
    #[serde(default)]
    currency_details: Vec<CurrencyDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverviewLine {
    currency_type_name: String,
    chaos_equivalent: f64,
    receive: Option<TradeSample>,
    pay: Option<TradeSample>,
}

#[derive(Debug, Deserialize)]
struct TradeSample {
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CurrencyDetail {
    name: String,
    trade_id: Option<String>,
}

impl OverviewLine {
    fn volume(&self) -> u64 {
        let receive = self.receive.as_ref().map_or(0, |s| s.count);
        let pay = self.pay.as_ref().map_or(0, |s| s.count);
        receive.max(pay)
    }
}

fn to_snapshot(response: OverviewResponse, min_count: u64) -> RateSnapshot {
    let rates = response
        .lines
        .into_iter()
        .filter(|line| line.volume() >= min_count)
        .filter_map(|line| {
            let rate = Decimal::try_from(line.chaos_equivalent).ok()?.round_dp(4);
            Some((line.currency_type_name, rate))
        })
        .collect();

    let aliases = response
        .currency_details
        .into_iter()
        .filter_map(|d| Some((d.trade_id?, d.name)))
        .collect();

    RateSnapshot { rates, aliases }
}

/// Currency overview endpoint of poe.ninja.
pub struct NinjaRateSource {
    http: reqwest::Client,
    url: String,
    league: String,
}

impl NinjaRateSource {
    pub fn new(url: impl Into<String>, league: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create rate source HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
            league: league.into(),
        })
    }
}

#[async_trait]
impl RateSource for NinjaRateSource {
    #[instrument(skip(self), fields(league = %self.league))]
    async fn fetch_rates(&self, min_count: u64) -> Result<RateSnapshot> {
        let response: OverviewResponse = self
            .http
            .get(&self.url)
            .query(&[("league", self.league.as_str()), ("type", "Currency")])
            .send()
            .await
            .context("Rate source request failed")?
            .error_for_status()
            .context("Rate source returned an error")?
            .json()
            .await
            .context("Failed to decode rate source response")?;

        let total = response.lines.len();
        let snapshot = to_snapshot(response, min_count);
        debug!(total, kept = snapshot.rates.len(), "Fetched currency rates");
        Ok(snapshot)
    }

    fn name(&self) -> &str {
        "poe.ninja"
    }
}

/// Fixed rates, for offline runs.
pub struct StaticRates {
    snapshot: RateSnapshot,
}

impl StaticRates {
    pub fn new(snapshot: RateSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl RateSource for StaticRates {
    async fn fetch_rates(&self, _min_count: u64) -> Result<RateSnapshot> {
        Ok(self.snapshot.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}
