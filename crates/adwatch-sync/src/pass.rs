use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use adwatch_core::{retention_cutoff, LedgerEntry, ListingId, ListingRecord};
use adwatch_extract::{ExtractError, ExtractorConfig, FilterSet, ListingExtractor, Verdict};
use adwatch_storage::{FetchError, InsertOutcome, ListingStore, PageFetcher, SnapshotStore, StoreError, TouchOutcome};
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{MonitorConfig, SourceConfig};
use crate::discovery::{DiscoveredListing, DiscoverySink, LoggingDiscoverySink};
use crate::guard::RunGuard;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_attempted: usize,
    pub sources_failed: usize,
    pub candidates_extracted: usize,
    pub filtered_out: usize,
    /// Listings already handled earlier in the same pass under another source.
    pub duplicates_skipped: usize,
    pub new_listings: usize,
    pub touched: usize,
    pub refreshed: usize,
    pub store_errors: usize,
    pub pruned: Option<u64>,
    pub prune_error: Option<String>,
    pub discoveries: Vec<DiscoveredListing>,
}

impl PassSummary {
    fn new(pass_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id,
            started_at,
            finished_at: started_at,
            sources_attempted: 0,
            sources_failed: 0,
            candidates_extracted: 0,
            filtered_out: 0,
            duplicates_skipped: 0,
            new_listings: 0,
            touched: 0,
            refreshed: 0,
            store_errors: 0,
            pruned: None,
            prune_error: None,
            discoveries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// Another pass held the run guard. Not an error.
    Skipped,
    Completed(PassSummary),
    Failed { pass_id: Uuid, error: String },
}

impl PassOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    pub fn summary(&self) -> Option<&PassSummary> {
        match self {
            Self::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct SourceBatch {
    extracted: usize,
    rejected: usize,
    accepted: Vec<ListingRecord>,
}

enum Sighting {
    Discovered(LedgerEntry),
    Touched,
    Refreshed,
    /// The entry disappeared between lookup and update, e.g. a concurrent prune.
    Vanished,
}

/// Runs ingestion passes: fetch every source in order, extract and filter
/// candidates, then record each sighting in the ledger.
pub struct IngestionCoordinator {
    sources: Vec<SourceConfig>,
    filters: FilterSet,
    extractor: ListingExtractor,
    store: Arc<dyn ListingStore>,
    fetcher: Arc<dyn PageFetcher>,
    snapshots: Option<SnapshotStore>,
    discovery: Box<dyn DiscoverySink>,
    guard: RunGuard,
    state: Mutex<PassState>,
    ledger_retention: chrono::Duration,
    pause_between_sources: Duration,
    clock: Clock,
}

impl IngestionCoordinator {
    pub fn new(
        config: &MonitorConfig,
        store: Arc<dyn ListingStore>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<Self, ExtractError> {
        Ok(Self {
            sources: config.sources.clone(),
            filters: config.filter_set(),
            extractor: ListingExtractor::new(ExtractorConfig::new(config.currency.clone()))?,
            store,
            fetcher,
            snapshots: config.snapshot_dir.as_ref().map(SnapshotStore::new),
            discovery: Box::<LoggingDiscoverySink>::default(),
            guard: RunGuard::new(),
            state: Mutex::new(PassState::Idle),
            ledger_retention: config.ledger_retention(),
            pause_between_sources: config.fetcher.pause_between_sources(),
            clock: Arc::new(Utc::now),
        })
    }

    pub fn with_discovery_sink(mut self, sink: Box<dyn DiscoverySink>) -> Self {
        self.discovery = sink;
        self
    }

    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn guard(&self) -> &RunGuard {
        &self.guard
    }

    /// State of the most recent pass.
    pub fn state(&self) -> PassState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: PassState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Runs one pass unless another is in flight. Never returns an error:
    /// failures, panics included, are reported through [`PassOutcome::Failed`].
    pub async fn run_pass(&self) -> PassOutcome {
        let Some(mut permit) = self.guard.try_acquire() else {
            warn!("previous ingestion pass still running; skipping this execution");
            return PassOutcome::Skipped;
        };

        let pass_id = Uuid::new_v4();
        self.set_state(PassState::Running);
        let result = AssertUnwindSafe(self.execute(pass_id).instrument(info_span!("ingestion_pass", %pass_id)))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!("ingestion pass panicked: {}", panic_message(&*panic))));

        let outcome = match result {
            Ok(summary) => {
                info!(
                    %pass_id,
                    sources = summary.sources_attempted,
                    sources_failed = summary.sources_failed,
                    new = summary.new_listings,
                    touched = summary.touched,
                    refreshed = summary.refreshed,
                    store_errors = summary.store_errors,
                    "ingestion pass completed"
                );
                self.set_state(PassState::Completed);
                PassOutcome::Completed(summary)
            }
            Err(err) => {
                error!(%pass_id, "ingestion pass failed: {err:#}");
                self.set_state(PassState::Failed);
                PassOutcome::Failed {
                    pass_id,
                    error: format!("{err:#}"),
                }
            }
        };
        permit.release();
        outcome
    }

    async fn execute(&self, pass_id: Uuid) -> anyhow::Result<PassSummary> {
        let mut summary = PassSummary::new(pass_id, self.now());
        self.store
            .health_check()
            .await
            .context("listing store unavailable at pass start")?;
        info!(sources = self.sources.len(), "fetching new listings");

        let mut handled: HashSet<ListingId> = HashSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            if index > 0 && !self.pause_between_sources.is_zero() {
                tokio::time::sleep(self.pause_between_sources).await;
            }
            summary.sources_attempted += 1;

            let markup = match self.fetch_source(&source.url).await {
                Ok(markup) => markup,
                Err(err) => {
                    error!(source = %source.url, "fetch failed, skipping source: {err}");
                    summary.sources_failed += 1;
                    continue;
                }
            };
            let seen_at = self.now();
            self.snapshot(seen_at, &source.url, &markup).await;

            let batch = match self.extract_candidates(&source.url, &markup) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(source = %source.url, "no listings extracted: {err}");
                    summary.sources_failed += 1;
                    continue;
                }
            };
            summary.candidates_extracted += batch.extracted;
            summary.filtered_out += batch.rejected;

            for record in batch.accepted {
                let listing_id = record.listing_id();
                if handled.contains(&listing_id) {
                    summary.duplicates_skipped += 1;
                    continue;
                }
                match self.record_sighting(&listing_id, &record, seen_at).await {
                    Ok(Sighting::Discovered(entry)) => {
                        let discovered = DiscoveredListing::from(&entry);
                        self.discovery.on_discovery(&discovered);
                        summary.discoveries.push(discovered);
                        summary.new_listings += 1;
                    }
                    Ok(Sighting::Touched) => summary.touched += 1,
                    Ok(Sighting::Refreshed) => summary.refreshed += 1,
                    Ok(Sighting::Vanished) => {
                        warn!(%listing_id, "ledger entry vanished before update");
                        summary.store_errors += 1;
                        continue;
                    }
                    Err(err) => {
                        error!(%listing_id, listing_url = %record.listing_url, "store error, skipping listing: {err}");
                        summary.store_errors += 1;
                        continue;
                    }
                }
                handled.insert(listing_id);
            }
        }

        let cutoff = retention_cutoff(self.now(), self.ledger_retention);
        match self.store.prune(cutoff).await {
            Ok(deleted) => {
                info!(deleted, "pruned stale ledger entries");
                summary.pruned = Some(deleted);
            }
            Err(err) => {
                error!("prune failed: {err}");
                summary.prune_error = Some(err.to_string());
            }
        }

        summary.finished_at = self.now();
        Ok(summary)
    }

    /// One scoped session per source, closed whatever the fetch result.
    async fn fetch_source(&self, url: &str) -> Result<String, FetchError> {
        let mut session = self.fetcher.open_session().await?;
        let result = session.fetch(url).await;
        session.close().await;
        result
    }

    async fn snapshot(&self, fetched_at: DateTime<Utc>, source_url: &str, markup: &str) {
        let Some(snapshots) = &self.snapshots else {
            return;
        };
        match snapshots.store_page(fetched_at, source_url, markup).await {
            Ok(snapshot) => debug!(path = %snapshot.relative_path.display(), "stored page snapshot"),
            Err(err) => warn!(source = source_url, "page snapshot failed: {err:#}"),
        }
    }

    /// Parsed documents are not `Send`, so extraction stays synchronous and
    /// hands back owned records.
    fn extract_candidates(&self, source_url: &str, markup: &str) -> Result<SourceBatch, ExtractError> {
        let page = self.extractor.parse(markup)?;
        let mut batch = SourceBatch::default();
        for record in self.extractor.extract(&page, source_url) {
            batch.extracted += 1;
            match self.filters.evaluate(source_url, &record.title) {
                Verdict::Pass => batch.accepted.push(record),
                Verdict::Reject { level } => {
                    debug!(failed_level = level, title = %record.title, "filtered out");
                    batch.rejected += 1;
                }
            }
        }
        Ok(batch)
    }

    async fn record_sighting(
        &self,
        listing_id: &ListingId,
        record: &ListingRecord,
        seen_at: DateTime<Utc>,
    ) -> Result<Sighting, StoreError> {
        let Some(existing) = self.store.get(listing_id).await? else {
            let entry = LedgerEntry::first_sighting(record, seen_at);
            return match self.store.upsert_first_seen(&entry).await? {
                InsertOutcome::Created => Ok(Sighting::Discovered(entry)),
                InsertOutcome::AlreadyExists => {
                    debug!(%listing_id, "lost first-insert race, touching instead");
                    Ok(touched(self.store.touch(listing_id, seen_at).await?, Sighting::Touched))
                }
            };
        };

        if existing.title != record.title || existing.price != record.price {
            Ok(touched(self.store.refresh(record, seen_at).await?, Sighting::Refreshed))
        } else {
            Ok(touched(self.store.touch(listing_id, seen_at).await?, Sighting::Touched))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn touched(outcome: TouchOutcome, on_update: Sighting) -> Sighting {
    match outcome {
        TouchOutcome::Updated => on_update,
        TouchOutcome::Missing => Sighting::Vanished,
    }
}
