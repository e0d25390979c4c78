use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use adwatch_extract::{FilterPolicy, FilterSet, PolicyWarning};
use adwatch_storage::{
    CommandFetcherConfig, CommandPageFetcher, FetchError, HttpFetcherConfig, HttpPageFetcher,
    PageFetcher, RetryPlan, DEFAULT_READY_SELECTOR, DEFAULT_USER_AGENT,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "adwatch.yaml";
/// Upper bound for both retention windows, roughly a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub retention_days: u32,
    pub item_cap: usize,
    pub title: String,
    pub link: String,
    pub description: String,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            retention_days: 7,
            item_cap: 100,
            title: "Marketplace Listing Feed".to_string(),
            link: "http://monitor.local/rss".to_string(),
            description: "New listings on monitored marketplace searches".to_string(),
        }
    }
}

impl FeedSettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    Http,
    Command,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherSettings {
    pub kind: FetcherKind,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub ready_selector: String,
    /// Renderer program followed by its arguments; the URL is appended.
    pub command: Vec<String>,
    pub pause_between_sources_ms: u64,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            kind: FetcherKind::Http,
            timeout_secs: 20,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ready_selector: DEFAULT_READY_SELECTOR.to_string(),
            command: Vec::new(),
            pause_between_sources_ms: 2000,
        }
    }
}

impl FetcherSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pause_between_sources(&self) -> Duration {
        Duration::from_millis(self.pause_between_sources_ms)
    }

    pub fn build(&self) -> Result<Arc<dyn PageFetcher>, FetchError> {
        match self.kind {
            FetcherKind::Http => Ok(Arc::new(HttpPageFetcher::new(HttpFetcherConfig {
                timeout: self.timeout(),
                user_agent: self.user_agent.clone(),
                ready_selector: self.ready_selector.clone(),
                retry: RetryPlan::default(),
            })?)),
            FetcherKind::Command => {
                let (program, args) = self
                    .command
                    .split_first()
                    .map(|(p, a)| (p.clone(), a.to_vec()))
                    .unwrap_or_default();
                Ok(Arc::new(CommandPageFetcher::new(CommandFetcherConfig {
                    program,
                    args,
                    timeout: self.timeout(),
                    ready_selector: self.ready_selector.clone(),
                })?))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_server_ip")]
    server_ip: String,
    #[serde(default = "default_server_port")]
    server_port: u16,
    currency: String,
    #[serde(default = "default_refresh_interval_minutes")]
    refresh_interval_minutes: u64,
    #[serde(default = "default_database_url")]
    database_url: String,
    #[serde(default)]
    feed: FeedSettings,
    #[serde(default = "default_ledger_retention_days")]
    ledger_retention_days: u32,
    #[serde(default)]
    snapshot_dir: Option<PathBuf>,
    #[serde(default)]
    fetcher: FetcherSettings,
    #[serde(default)]
    url_filters: serde_yaml::Mapping,
}

fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    5000
}

fn default_refresh_interval_minutes() -> u64 {
    15
}

fn default_database_url() -> String {
    "sqlite://adwatch.db".to_string()
}

fn default_ledger_retention_days() -> u32 {
    14
}

/// One monitored search page with its normalized keyword policy.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url: String,
    pub policy: FilterPolicy,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub server_ip: String,
    pub server_port: u16,
    pub currency: String,
    pub refresh_interval: Duration,
    pub database_url: String,
    pub feed: FeedSettings,
    pub ledger_retention_days: u32,
    pub snapshot_dir: Option<PathBuf>,
    pub fetcher: FetcherSettings,
    /// In configured order.
    pub sources: Vec<SourceConfig>,
}

impl MonitorConfig {
    /// Path from `ADWATCH_CONFIG`, falling back to `./adwatch.yaml`.
    pub fn path_from_env() -> PathBuf {
        std::env::var("ADWATCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates YAML text. Policy problems are logged and
    /// normalized away here, once.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;

        let mut sources = Vec::with_capacity(raw.url_filters.len());
        for (key, value) in &raw.url_filters {
            let url = key
                .as_str()
                .ok_or_else(|| ConfigError::Invalid(format!("source URL must be a string, got {key:?}")))?
                .trim()
                .to_string();
            let (policy, warnings) = FilterPolicy::from_value(value);
            log_policy_warnings(&url, &warnings);
            sources.push(SourceConfig { url, policy });
        }

        let config = Self {
            server_ip: raw.server_ip,
            server_port: raw.server_port,
            currency: raw.currency.trim().to_string(),
            refresh_interval: Duration::from_secs(raw.refresh_interval_minutes.saturating_mul(60)),
            database_url: raw.database_url,
            feed: raw.feed,
            ledger_retention_days: raw.ledger_retention_days,
            snapshot_dir: raw.snapshot_dir,
            fetcher: raw.fetcher,
            sources,
        };
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(port) = std::env::var("ADWATCH_SERVER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.server_port = port;
        }
        if let Ok(dir) = std::env::var("ADWATCH_SNAPSHOT_DIR") {
            self.snapshot_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.currency.trim().is_empty() {
            return invalid("currency must not be empty");
        }
        if self.refresh_interval.is_zero() {
            return invalid("refresh_interval_minutes must be greater than zero");
        }
        if self.feed.item_cap == 0 {
            return invalid("feed.item_cap must be greater than zero");
        }
        for (key, days) in [
            ("feed.retention_days", self.feed.retention_days),
            ("ledger_retention_days", self.ledger_retention_days),
        ] {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be between 1 and {MAX_RETENTION_DAYS} days, got {days}"
                )));
            }
        }
        if self.fetcher.timeout_secs == 0 {
            return invalid("fetcher.timeout_secs must be greater than zero");
        }
        if self.fetcher.kind == FetcherKind::Command && self.fetcher.command.is_empty() {
            return invalid("fetcher.command is required when fetcher.kind is `command`");
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.url.is_empty() {
                return invalid("source URLs must not be empty");
            }
            if !seen.insert(source.url.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source URL {}", source.url)));
            }
        }
        Ok(())
    }

    pub fn ledger_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ledger_retention_days))
    }

    pub fn filter_set(&self) -> FilterSet {
        let mut set = FilterSet::new();
        for source in &self.sources {
            set.insert(source.url.clone(), source.policy.clone());
        }
        set
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }
}

fn log_policy_warnings(source_url: &str, warnings: &[PolicyWarning]) {
    for warning in warnings {
        warn!(source = source_url, "{warning}");
    }
}
