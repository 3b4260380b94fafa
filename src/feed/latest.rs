//! Bootstrap the feed cursor from the current head of the feed.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::feed::change_id::ChangeId;

const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct FeedStatsResponse {
    next_change_id: String,
}

/// Fetch the most recent change id from the stats endpoint.
#[instrument(skip(http))]
pub async fn fetch_latest_change_id(http: &reqwest::Client, url: &str) -> Result<ChangeId> {
    let response = http
        .get(url)
        .send()
        .await
        .context("Failed to reach change id endpoint")?
        .error_for_status()
        .context("Change id endpoint returned an error")?;

    let stats: FeedStatsResponse = response
        .json()
        .await
        .context("Failed to decode change id response")?;

    ChangeId::new(stats.next_change_id).context("Change id endpoint returned a malformed id")
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// Retry [`fetch_latest_change_id`] with exponential backoff until it
/// succeeds. Returns `None` if `stop` fires first.
pub async fn wait_for_latest_change_id(
    http: &reqwest::Client,
    url: &str,
    stop: &CancellationToken,
) -> Option<ChangeId> {
    let mut attempt = 0u32;
    loop {
        match fetch_latest_change_id(http, url).await {
            Ok(id) => {
                info!(id = %id, "Obtained latest change id");
                return Some(id);
            }
            Err(e) => {
                attempt += 1;
                let delay = backoff(attempt);
                warn!(
                    error = %e,
                    attempt,
                    retry_in_s = delay.as_secs(),
                    "Failed to get latest change id"
                );
                tokio::select! {
                    _ = stop.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
