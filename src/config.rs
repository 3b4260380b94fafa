use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub scanner: ScannerConfig,
    pub feed: FeedConfig,
    pub currency: CurrencyConfig,
    pub filters: FiltersConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Continue from the persisted cursor.
    Resume,
    /// Ignore the persisted cursor and start from the current head of the feed.
    Latest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    pub league: String,
    pub mode: ScanMode,
    /// Worker threads for filter evaluation, 0 = available cores minus one.
    pub workers: usize,
    pub data_dir: PathBuf,
    pub status_interval_seconds: u64,
}

impl ScannerConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn error_dir(&self) -> PathBuf {
        self.data_dir.join("errors")
    }

    pub fn currency_file(&self) -> PathBuf {
        self.data_dir.join("currency.json")
    }

    pub fn auto_filters_file(&self) -> PathBuf {
        self.data_dir.join("auto_filters.json")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub base_url: String,
    pub connections: usize,
    pub request_delay_ms: u64,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub skip_ahead: bool,
    pub sufficient_delta: u64,
    pub skip_timeout_seconds: u64,
    pub queue_capacity: usize,
    pub latest_id_url: String,
}

impl FeedConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn skip_timeout(&self) -> Duration {
        Duration::from_secs(self.skip_timeout_seconds)
    }
}

/// Minimum trade volume an observed rate needs before it is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    pub fn threshold(self) -> u64 {
        match self {
            ConfidenceLevel::Low => 1,
            ConfidenceLevel::Medium => 5,
            ConfidenceLevel::High => 10,
            ConfidenceLevel::VeryHigh => 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    pub rates_url: String,
    pub update_interval_minutes: i64,
    pub confidence_level: ConfidenceLevel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FiltersConfig {
    pub user_file: PathBuf,
    pub config_file: PathBuf,
    #[serde(default)]
    pub item_prices_urls: Vec<String>,
    pub update_interval_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub health_addr: String,
    pub webhook_enabled: bool,
}

/// Secrets loaded exclusively from environment variables.
pub struct Secrets {
    pub discord_webhook_url: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, overlaying environment variables for secrets.
    pub fn load(config_path: &Path) -> Result<(Self, Secrets)> {
        dotenvy::dotenv().ok();

        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Ok((config, Secrets::from_env()))
    }
}
