//! Durable listing ledger, page fetchers and page snapshot storage for adwatch.

mod fetch;
mod ledger;
mod snapshot;

pub use fetch::{
    request_failure, status_failure, CommandFetcherConfig, CommandPageFetcher, FetchError, FetchFailure,
    FetchSession, HttpFetcherConfig, HttpPageFetcher, PageFetcher, ReadyMarker, RetryPlan,
    DEFAULT_READY_SELECTOR, DEFAULT_USER_AGENT,
};
pub use ledger::{InsertOutcome, ListingStore, SqliteLedger, StoreError, TouchOutcome};
pub use snapshot::{PageSnapshot, SnapshotStore};

pub const CRATE_NAME: &str = "adwatch-storage";
