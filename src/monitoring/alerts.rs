//! Discord webhook alerts.
//!
//! Posts accepted matches, and the occasional scanner notice, to a Discord
//! webhook. Delivery failures are logged and never reach the dispatcher.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::scanner::results::{ItemMatch, ResultHandler};

/// Discord webhook client.
pub struct WebhookNotifier {
    webhook_url: Option<String>,
    http: reqwest::Client,
    enabled: bool,
}

/// Discord webhook message format.
#[derive(Debug, Serialize)]
struct DiscordMessage {
    content: String,
    username: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>, enabled: bool) -> Self {
        Self {
            enabled: enabled && webhook_url.is_some(),
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    /// Send a raw message to Discord.
    pub async fn send(&self, message: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let Some(ref url) = self.webhook_url else {
            return Ok(());
        };

        let payload = DiscordMessage {
            content: message.to_string(),
            username: "Stash Scanner".to_string(),
        };

        match self.http.post(url).json(&payload).send().await {
            Ok(response) => {
                if !response.status().is_success() {
                    warn!(
                        status = %response.status(),
                        "Discord webhook returned non-success status"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to send Discord alert");
            }
        }

        Ok(())
    }

    /// Alert: the scan stopped on a fatal error.
    pub async fn scan_stopped(&self, reason: &str) -> Result<()> {
        self.send(&format!("**Scan stopped**\n{reason}")).await
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

pub fn match_message(m: &ItemMatch) -> String {
    format!(
        "**{}**\n{}\nSeller: {}\n`{}`",
        m.filter_title,
        m.summary(),
        m.stash.account_name,
        m.whisper_message()
    )
}

#[async_trait]
impl ResultHandler for WebhookNotifier {
    async fn handle(&self, m: &ItemMatch) -> Result<()> {
        self.send(&match_message(m)).await
    }
}
