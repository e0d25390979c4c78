use adwatch_core::{LedgerEntry, ListingId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

/// A listing recorded in the ledger for the first time during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredListing {
    pub listing_id: ListingId,
    pub source_url: String,
    pub listing_url: String,
    pub title: String,
    pub price: String,
    pub first_seen: DateTime<Utc>,
}

impl From<&LedgerEntry> for DiscoveredListing {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            listing_id: entry.listing_id.clone(),
            source_url: entry.source_url.clone(),
            listing_url: entry.listing_url.clone(),
            title: entry.title.clone(),
            price: entry.price.clone(),
            first_seen: entry.first_seen,
        }
    }
}

/// Notified once per newly created ledger entry. Implementations must not
/// block the pass.
pub trait DiscoverySink: Send + Sync {
    fn on_discovery(&self, listing: &DiscoveredListing);
}

#[derive(Debug, Default)]
pub struct LoggingDiscoverySink;

impl DiscoverySink for LoggingDiscoverySink {
    fn on_discovery(&self, listing: &DiscoveredListing) {
        info!(
            listing_id = %listing.listing_id,
            source = %listing.source_url,
            price = %listing.price,
            "new listing detected: {}",
            listing.title
        );
    }
}
