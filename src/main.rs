use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use stash_scanner::config::{AppConfig, ScanMode, DEFAULT_CONFIG_PATH};
use stash_scanner::monitoring::alerts::WebhookNotifier;
use stash_scanner::monitoring::logger;
use stash_scanner::scanner::Scanner;

#[derive(Debug, Parser)]
#[command(name = "stash-scanner", version, about = "Scans the public stash feed for items matching your filters")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Ignore the saved position and start from the head of the feed.
    #[arg(long)]
    from_latest: bool,

    /// Override the configured league.
    #[arg(long)]
    league: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (mut config, secrets) = AppConfig::load(&cli.config)?;
    if let Some(league) = cli.league {
        config.scanner.league = league;
    }
    if cli.from_latest {
        config.scanner.mode = ScanMode::Latest;
    }

    logger::init_logging(&config.monitoring, None)?;

    tracing::info!(
        league = %config.scanner.league,
        mode = ?config.scanner.mode,
        workers = config.scanner.worker_count(),
        "Stash scanner starting"
    );

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Stop requested");
                stop.cancel();
            }
        });
    }

    let notifier = WebhookNotifier::new(
        secrets.discord_webhook_url.clone(),
        config.monitoring.webhook_enabled,
    );
    let scanner = Scanner::from_config(config, &secrets)?;

    match scanner.run(stop.clone()).await {
        Ok(()) => Ok(()),
        Err(e) if stop.is_cancelled() => {
            tracing::info!(reason = %e, "Stopped before scanning started");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Scan stopped");
            notifier.scan_stopped(&e.to_string()).await?;
            Err(e)
        }
    }
}
