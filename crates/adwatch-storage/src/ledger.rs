use std::str::FromStr;
use std::time::Duration;

use adwatch_core::{format_timestamp, parse_timestamp, LedgerEntry, ListingId, ListingRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt ledger row {listing_id}: {reason}")]
    CorruptRow { listing_id: String, reason: String },
}

/// Result of a first-sighting insert. `AlreadyExists` means another writer got
/// there first; the existing `first_seen` is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Updated,
    Missing,
}

/// Ledger of known listings. Every mutating call is a single atomic statement
/// against one entry; there are no cross-entry transactions.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Cheap round trip used before a pass starts.
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn get(&self, listing_id: &ListingId) -> Result<Option<LedgerEntry>, StoreError>;

    async fn upsert_first_seen(&self, entry: &LedgerEntry) -> Result<InsertOutcome, StoreError>;

    /// Moves `last_checked` forward to `at`. Never moves it backwards.
    async fn touch(&self, listing_id: &ListingId, at: DateTime<Utc>) -> Result<TouchOutcome, StoreError>;

    /// Like `touch`, also replacing title and price with the latest sighting.
    async fn refresh(&self, record: &ListingRecord, at: DateTime<Utc>) -> Result<TouchOutcome, StoreError>;

    /// Entries with `last_checked >= since`, newest first.
    async fn recent(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Deletes entries with `last_checked < older_than`.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    ad_id: String,
    source_url: String,
    listing_url: String,
    title: String,
    price: String,
    first_seen: String,
    last_checked: String,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, err: chrono::ParseError| StoreError::CorruptRow {
            listing_id: row.ad_id.clone(),
            reason: format!("{field}: {err}"),
        };
        let first_seen = parse_timestamp(&row.first_seen).map_err(|e| corrupt("first_seen", e))?;
        let last_checked = parse_timestamp(&row.last_checked).map_err(|e| corrupt("last_checked", e))?;
        Ok(LedgerEntry {
            listing_id: ListingId::from_stored(row.ad_id),
            source_url: row.source_url,
            listing_url: row.listing_url,
            title: row.title,
            price: row.price,
            first_seen,
            last_checked,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT ad_id, source_url, listing_url, title, price, first_seen, last_checked FROM ad_changes";

/// SQLite-backed ledger (`ad_changes` table).
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Opens (creating if needed) the database at `database_url` and applies
    /// the embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Single-connection in-memory ledger; the database lives as long as the pool.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ListingStore for SqliteLedger {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, listing_id: &ListingId) -> Result<Option<LedgerEntry>, StoreError> {
        let row = sqlx::query_as::<_, LedgerRow>(&format!("{SELECT_COLUMNS} WHERE ad_id = ?"))
            .bind(listing_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(LedgerEntry::try_from).transpose()
    }

    async fn upsert_first_seen(&self, entry: &LedgerEntry) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO ad_changes (source_url, listing_url, ad_id, title, price, first_seen, last_checked)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (ad_id) DO NOTHING
            "#,
        )
        .bind(&entry.source_url)
        .bind(&entry.listing_url)
        .bind(entry.listing_id.as_str())
        .bind(&entry.title)
        .bind(&entry.price)
        .bind(format_timestamp(entry.first_seen))
        .bind(format_timestamp(entry.last_checked))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Created
        })
    }

    async fn touch(&self, listing_id: &ListingId, at: DateTime<Utc>) -> Result<TouchOutcome, StoreError> {
        let result = sqlx::query(
            "UPDATE ad_changes SET last_checked = MAX(last_checked, ?) WHERE ad_id = ?",
        )
        .bind(format_timestamp(at))
        .bind(listing_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(touch_outcome(result.rows_affected()))
    }

    async fn refresh(&self, record: &ListingRecord, at: DateTime<Utc>) -> Result<TouchOutcome, StoreError> {
        let listing_id = record.listing_id();
        let result = sqlx::query(
            r#"
            UPDATE ad_changes
               SET title = ?,
                   price = ?,
                   last_checked = MAX(last_checked, ?)
             WHERE ad_id = ?
            "#,
        )
        .bind(&record.title)
        .bind(&record.price)
        .bind(format_timestamp(at))
        .bind(listing_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(touch_outcome(result.rows_affected()))
    }

    async fn recent(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerRow>(&format!(
            "{SELECT_COLUMNS} WHERE last_checked >= ? ORDER BY last_checked DESC, id DESC LIMIT ?"
        ))
        .bind(format_timestamp(since))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM ad_changes WHERE last_checked < ?")
            .bind(format_timestamp(older_than))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn touch_outcome(rows_affected: u64) -> TouchOutcome {
    if rows_affected == 0 {
        TouchOutcome::Missing
    } else {
        TouchOutcome::Updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn record(n: u32) -> ListingRecord {
        ListingRecord {
            source_url: "https://facebook.com/marketplace/search?query=bike".into(),
            listing_url: format!("https://facebook.com/marketplace/item/{n}/"),
            title: format!("Bike {n}"),
            price: format!("${n}"),
        }
    }

    #[tokio::test]
    async fn insert_then_duplicate_insert_reports_already_exists() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let first = LedgerEntry::first_sighting(&record(1), at(1));
        assert_eq!(ledger.upsert_first_seen(&first).await.unwrap(), InsertOutcome::Created);

        let racing = LedgerEntry::first_sighting(&record(1), at(2));
        assert_eq!(
            ledger.upsert_first_seen(&racing).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        let stored = ledger.get(&first.listing_id).await.unwrap().unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn touch_moves_last_checked_forward_only() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let entry = LedgerEntry::first_sighting(&record(2), at(3));
        ledger.upsert_first_seen(&entry).await.unwrap();

        assert_eq!(ledger.touch(&entry.listing_id, at(5)).await.unwrap(), TouchOutcome::Updated);
        ledger.touch(&entry.listing_id, at(4)).await.unwrap();

        let stored = ledger.get(&entry.listing_id).await.unwrap().unwrap();
        assert_eq!(stored.first_seen, at(3));
        assert_eq!(stored.last_checked, at(5));

        let missing = ListingId::for_url("https://facebook.com/marketplace/item/404/");
        assert_eq!(ledger.touch(&missing, at(6)).await.unwrap(), TouchOutcome::Missing);
        assert!(ledger.get(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_replaces_title_and_price() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let entry = LedgerEntry::first_sighting(&record(3), at(1));
        ledger.upsert_first_seen(&entry).await.unwrap();

        let mut changed = record(3);
        changed.title = "Bike 3 (price drop)".into();
        changed.price = "$2".into();
        assert_eq!(ledger.refresh(&changed, at(2)).await.unwrap(), TouchOutcome::Updated);

        let stored = ledger.get(&entry.listing_id).await.unwrap().unwrap();
        assert_eq!(stored.title, "Bike 3 (price drop)");
        assert_eq!(stored.price, "$2");
        assert_eq!(stored.first_seen, at(1));
        assert_eq!(stored.last_checked, at(2));
    }

    #[tokio::test]
    async fn recent_is_windowed_ordered_and_capped() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        for (n, hour) in [(1, 1), (2, 4), (3, 2), (4, 3)] {
            let entry = LedgerEntry::first_sighting(&record(n), at(hour));
            ledger.upsert_first_seen(&entry).await.unwrap();
        }

        let rows = ledger.recent(at(2), 10).await.unwrap();
        let titles: Vec<_> = rows.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Bike 2", "Bike 4", "Bike 3"]);

        let capped = ledger.recent(at(0), 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].title, "Bike 2");
    }

    #[tokio::test]
    async fn prune_removes_entries_strictly_before_cutoff() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        for (n, hour) in [(1, 1), (2, 2), (3, 3)] {
            let entry = LedgerEntry::first_sighting(&record(n), at(hour));
            ledger.upsert_first_seen(&entry).await.unwrap();
        }

        assert_eq!(ledger.prune(at(2)).await.unwrap(), 1);
        let left: Vec<_> = ledger
            .recent(at(0), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(left, vec!["Bike 3".to_string(), "Bike 2".to_string()]);
        assert_eq!(ledger.prune(at(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn file_backed_ledger_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

        let entry = LedgerEntry::first_sighting(&record(9), at(1));
        {
            let ledger = SqliteLedger::connect(&url).await.unwrap();
            ledger.health_check().await.unwrap();
            ledger.upsert_first_seen(&entry).await.unwrap();
            ledger.close().await;
        }

        let reopened = SqliteLedger::connect(&url).await.unwrap();
        assert_eq!(reopened.get(&entry.listing_id).await.unwrap(), Some(entry));
    }
}
