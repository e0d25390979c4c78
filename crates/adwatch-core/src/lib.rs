//! Core domain model for adwatch: listings, ledger entries and feed items.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "adwatch-core";

/// Fixed-width UTC layout used for persisted timestamps. Every value has the
/// same length, so lexical order matches chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc)))
}

/// Start of a retention window ending at `now`, never earlier than the Unix
/// epoch so the persisted form stays fixed-width.
pub fn retention_cutoff(now: DateTime<Utc>, retention: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(retention)
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |cutoff| cutoff.max(DateTime::<Utc>::UNIX_EPOCH))
}

/// A listing candidate pulled out of one search page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub source_url: String,
    pub listing_url: String,
    pub title: String,
    pub price: String,
}

impl ListingRecord {
    pub fn listing_id(&self) -> ListingId {
        ListingId::for_url(&self.listing_url)
    }
}

/// Content-derived dedup key: hex SHA-256 of the canonical listing URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    pub fn for_url(listing_url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(listing_url.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an identity read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable record of a listing's first and latest sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub listing_id: ListingId,
    pub source_url: String,
    pub listing_url: String,
    pub title: String,
    pub price: String,
    pub first_seen: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

impl LedgerEntry {
    /// Entry for a listing seen for the first time at `at`.
    pub fn first_sighting(record: &ListingRecord, at: DateTime<Utc>) -> Self {
        Self {
            listing_id: record.listing_id(),
            source_url: record.source_url.clone(),
            listing_url: record.listing_url.clone(),
            title: record.title.clone(),
            price: record.price.clone(),
            first_seen: at,
            last_checked: at,
        }
    }
}

/// One item of the syndication feed, derived 1:1 from a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub guid: ListingId,
    pub published_at: DateTime<Utc>,
}

impl From<&LedgerEntry> for FeedItem {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            title: format!("{} - {}", entry.title, entry.price),
            link: entry.listing_url.clone(),
            description: format!("Price: {} | Title: {}", entry.price, entry.title),
            guid: entry.listing_id.clone(),
            published_at: entry.last_checked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> ListingRecord {
        ListingRecord {
            source_url: "https://facebook.com/marketplace/search?query=bike".into(),
            listing_url: "https://facebook.com/marketplace/item/123/".into(),
            title: "Vintage Bike $120".into(),
            price: "$120".into(),
        }
    }

    #[test]
    fn listing_id_is_stable_per_url() {
        let a = ListingId::for_url("https://facebook.com/marketplace/item/1/");
        let b = ListingId::for_url("https://facebook.com/marketplace/item/1/");
        let c = ListingId::for_url("https://facebook.com/marketplace/item/2/");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn timestamps_round_trip_and_sort_lexically() {
        let early = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let late = early + chrono::Duration::milliseconds(500);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert_eq!(a, "2026-02-24T12:00:00.000000Z");
        assert!(a < b);
        assert_eq!(parse_timestamp(&b).unwrap(), late);
        assert_eq!(
            parse_timestamp("2026-02-24T12:00:00+00:00").unwrap(),
            early
        );
    }

    #[test]
    fn retention_cutoff_saturates_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        assert_eq!(
            retention_cutoff(now, chrono::Duration::days(7)),
            Utc.with_ymd_and_hms(2026, 2, 17, 12, 0, 0).single().unwrap()
        );
        let cutoff = retention_cutoff(now, chrono::Duration::days(4_000_000_000));
        assert_eq!(cutoff, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            retention_cutoff(now, chrono::Duration::days(1_000_000)),
            DateTime::<Utc>::UNIX_EPOCH
        );
        assert_eq!(format_timestamp(cutoff).len(), format_timestamp(now).len());
    }

    #[test]
    fn feed_item_formats_title_and_description() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap();
        let entry = LedgerEntry::first_sighting(&record(), at);
        assert_eq!(entry.first_seen, entry.last_checked);

        let item = FeedItem::from(&entry);
        assert_eq!(item.title, "Vintage Bike $120 - $120");
        assert_eq!(item.description, "Price: $120 | Title: Vintage Bike $120");
        assert_eq!(item.link, "https://facebook.com/marketplace/item/123/");
        assert_eq!(item.guid, record().listing_id());
        assert_eq!(item.published_at, at);
    }
}
