//! Ingestion orchestration: configuration, the run guard, the pass
//! coordinator and its scheduler.

mod config;
mod discovery;
mod guard;
mod pass;
mod schedule;

use std::sync::Arc;

use adwatch_storage::SqliteLedger;
use anyhow::{Context, Result};

pub use config::{
    ConfigError, FeedSettings, FetcherKind, FetcherSettings, MonitorConfig, SourceConfig, DEFAULT_CONFIG_PATH,
    MAX_RETENTION_DAYS,
};
pub use discovery::{DiscoveredListing, DiscoverySink, LoggingDiscoverySink};
pub use guard::{RunGuard, RunPermit};
pub use pass::{Clock, IngestionCoordinator, PassOutcome, PassState, PassSummary};
pub use schedule::build_scheduler;

pub const CRATE_NAME: &str = "adwatch-sync";

/// The wired-up monitor: ledger plus the coordinator that feeds it.
pub struct Monitor {
    pub config: MonitorConfig,
    pub store: Arc<SqliteLedger>,
    pub coordinator: Arc<IngestionCoordinator>,
}

impl Monitor {
    pub async fn open(config: MonitorConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteLedger::connect(&config.database_url)
                .await
                .with_context(|| format!("opening ledger at {}", config.database_url))?,
        );
        let fetcher = config.fetcher.build().context("building page fetcher")?;
        let coordinator =
            IngestionCoordinator::new(&config, store.clone(), fetcher).context("building listing extractor")?;
        Ok(Self {
            config,
            store,
            coordinator: Arc::new(coordinator),
        })
    }

    pub async fn scheduler(&self) -> Result<tokio_cron_scheduler::JobScheduler> {
        build_scheduler(Arc::clone(&self.coordinator), self.config.refresh_interval).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_storage::ListingStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_file_ledger_and_runs_a_pass() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("adwatch.db");
        let yaml = format!(
            "currency: \"$\"\ndatabase_url: \"sqlite://{}\"\nfetcher:\n  pause_between_sources_ms: 0\n",
            db.display()
        );
        let monitor = Monitor::open(MonitorConfig::from_yaml_str(&yaml).unwrap()).await.unwrap();
        monitor.store.health_check().await.unwrap();

        let outcome = monitor.coordinator.run_pass().await;
        let summary = outcome.summary().expect("completed");
        assert_eq!(summary.sources_attempted, 0);
        assert_eq!(summary.pruned, Some(0));
        monitor.close().await;
        assert!(db.exists());
    }
}
