//! Match delivery.
//!
//! The dispatcher hands every accepted match to a [`ResultHandler`]. Handlers
//! run after the payload's state is committed, so a slow handler delays the
//! next payload but never leaves the dedup index half written.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::item::{Item, StashTab};

/// Where an item was listed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StashContext {
    pub account_name: String,
    pub last_character_name: String,
    pub stash_name: String,
}

impl StashContext {
    pub fn from_tab(tab: &StashTab) -> Self {
        Self {
            account_name: tab.account_name.clone().unwrap_or_default(),
            last_character_name: tab.last_character_name.clone().unwrap_or_default(),
            stash_name: tab.stash.clone().unwrap_or_default(),
        }
    }
}

/// An item claimed by a filter and accepted by the dedup index.
#[derive(Debug, Clone)]
pub struct ItemMatch {
    pub item: Item,
    pub stash: StashContext,
    pub filter_id: String,
    pub filter_title: String,
}

impl ItemMatch {
    /// In-game whisper asking the seller for the item.
    pub fn whisper_message(&self) -> String {
        let stack = if self.item.stack_size > 1 {
            format!("{} ", self.item.stack_size)
        } else {
            String::new()
        };
        let price = self
            .item
            .listing
            .as_ref()
            .map(|l| format!(" for {} {}", l.amount.normalize(), l.currency))
            .unwrap_or_default();

        format!(
            "@{} Hi, I would like to buy your {}{} listed{} in {} (stash tab \"{}\"; position: left {}, top {})",
            self.stash.last_character_name,
            stack,
            self.item.name,
            price,
            self.item.league.as_deref().unwrap_or_default(),
            self.stash.stash_name,
            self.item.x.saturating_add(1),
            self.item.y.saturating_add(1),
        )
    }

    /// Short two-line summary for notifications: stack and name, then the
    /// price as the seller wrote it.
    pub fn summary(&self) -> String {
        let stack = if self.item.stack_size > 1 {
            format!("{} ", self.item.stack_size)
        } else {
            String::new()
        };
        let price = self.item.listing.as_ref().map(|l| l.raw.as_str()).unwrap_or("");
        format!("{}{}\n{}", stack, self.item.name, price)
            .trim()
            .to_string()
    }
}

/// Receiver of accepted matches.
#[async_trait]
pub trait ResultHandler: Send + Sync {
    async fn handle(&self, item: &ItemMatch) -> Result<()>;
}

/// Logs every match at INFO.
pub struct LogResultHandler;

#[async_trait]
impl ResultHandler for LogResultHandler {
    async fn handle(&self, m: &ItemMatch) -> Result<()> {
        info!(
            filter = %m.filter_title,
            item = %m.item.name,
            price = m.item.listing.as_ref().map(|l| l.raw.as_str()).unwrap_or(""),
            seller = %m.stash.account_name,
            whisper = %m.whisper_message(),
            "Item matched"
        );
        Ok(())
    }
}

/// Forwards matches over a channel, for an embedding UI.
pub struct ChannelResultHandler {
    tx: mpsc::UnboundedSender<ItemMatch>,
}

impl ChannelResultHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ItemMatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ResultHandler for ChannelResultHandler {
    async fn handle(&self, m: &ItemMatch) -> Result<()> {
        if self.tx.send(m.clone()).is_err() {
            warn!(item = %m.item.id, "Match receiver dropped");
        }
        Ok(())
    }
}

/// Calls every inner handler in order. A failing handler does not stop the
/// others.
pub struct FanOutHandler {
    handlers: Vec<Arc<dyn ResultHandler>>,
}

impl FanOutHandler {
    pub fn new(handlers: Vec<Arc<dyn ResultHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl ResultHandler for FanOutHandler {
    async fn handle(&self, m: &ItemMatch) -> Result<()> {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(m).await {
                warn!(error = %e, item = %m.item.id, "Result handler failed");
            }
        }
        Ok(())
    }
}
