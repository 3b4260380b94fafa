use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::MonitoringConfig;
use crate::monitoring::messages::MessageLayer;

/// Install the global subscriber: JSON logs, plus the message sink if given.
pub fn init_logging(config: &MonitoringConfig, messages: Option<MessageLayer>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(messages)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}
