use std::sync::Arc;

use adwatch_core::{retention_cutoff, FeedItem};
use adwatch_storage::ListingStore;
use adwatch_sync::FeedSettings;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("serializing rss document: {0}")]
    Serialize(String),
}

/// Stateless: every build is a fresh read of the ledger.
#[derive(Clone)]
pub struct FeedAssembler {
    store: Arc<dyn ListingStore>,
    retention: chrono::Duration,
    item_cap: usize,
}

impl FeedAssembler {
    pub fn new(store: Arc<dyn ListingStore>, settings: &FeedSettings) -> Self {
        Self {
            store,
            retention: settings.retention(),
            item_cap: settings.item_cap,
        }
    }

    pub async fn build_feed(&self) -> Vec<FeedItem> {
        self.build_feed_at(Utc::now()).await
    }

    /// Entries checked within the retention window, newest first. A store
    /// failure yields an empty feed rather than an error.
    pub async fn build_feed_at(&self, now: DateTime<Utc>) -> Vec<FeedItem> {
        match self.store.recent(retention_cutoff(now, self.retention), self.item_cap).await {
            Ok(entries) => entries.iter().map(FeedItem::from).collect(),
            Err(err) => {
                warn!("listing store unavailable, serving empty feed: {err}");
                Vec::new()
            }
        }
    }
}

/// Channel-level metadata of the RSS document.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub title: String,
    pub link: String,
    pub description: String,
}

impl From<&FeedSettings> for ChannelInfo {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            title: settings.title.clone(),
            link: settings.link.clone(),
            description: settings.description.clone(),
        }
    }
}

#[derive(Serialize)]
struct RssDocument<'a> {
    #[serde(rename = "@version")]
    version: &'static str,
    channel: RssChannel<'a>,
}

#[derive(Serialize)]
struct RssChannel<'a> {
    title: &'a str,
    link: &'a str,
    description: &'a str,
    #[serde(rename = "lastBuildDate")]
    last_build_date: String,
    generator: &'static str,
    #[serde(rename = "item")]
    items: Vec<RssItem<'a>>,
}

#[derive(Serialize)]
struct RssItem<'a> {
    title: &'a str,
    link: &'a str,
    description: &'a str,
    guid: RssGuid<'a>,
    #[serde(rename = "pubDate")]
    pub_date: String,
}

#[derive(Serialize)]
struct RssGuid<'a> {
    #[serde(rename = "@isPermaLink")]
    is_perma_link: bool,
    #[serde(rename = "$text")]
    value: &'a str,
}

fn local_rfc2822(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).to_rfc2822()
}

/// Renders an RSS 2.0 document. Dates are shown in the server's local zone.
pub fn render_rss(channel: &ChannelInfo, items: &[FeedItem], built_at: DateTime<Utc>) -> Result<String, FeedError> {
    let document = RssDocument {
        version: "2.0",
        channel: RssChannel {
            title: &channel.title,
            link: &channel.link,
            description: &channel.description,
            last_build_date: local_rfc2822(built_at),
            generator: concat!("adwatch ", env!("CARGO_PKG_VERSION")),
            items: items
                .iter()
                .map(|item| RssItem {
                    title: &item.title,
                    link: &item.link,
                    description: &item.description,
                    guid: RssGuid {
                        is_perma_link: false,
                        value: item.guid.as_str(),
                    },
                    pub_date: local_rfc2822(item.published_at),
                })
                .collect(),
        },
    };
    let body = quick_xml::se::to_string_with_root("rss", &document).map_err(|e| FeedError::Serialize(e.to_string()))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_core::{LedgerEntry, ListingId, ListingRecord};
    use adwatch_storage::SqliteLedger;
    use chrono::TimeZone;

    fn record(item: u32, title: &str, price: &str) -> ListingRecord {
        ListingRecord {
            source_url: "https://facebook.com/marketplace/nyc/search?query=bike".into(),
            listing_url: format!("https://facebook.com/marketplace/item/{item}/"),
            title: title.into(),
            price: price.into(),
        }
    }

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    fn channel() -> ChannelInfo {
        ChannelInfo::from(&FeedSettings::default())
    }

    #[tokio::test]
    async fn feed_is_windowed_newest_first_and_capped() {
        let store = Arc::new(SqliteLedger::in_memory().await.unwrap());
        for (item, day) in [(1, 1), (2, 12), (3, 14), (4, 10)] {
            let entry = LedgerEntry::first_sighting(&record(item, &format!("Bike {item}"), "$10"), t(day));
            store.upsert_first_seen(&entry).await.unwrap();
        }
        let settings = FeedSettings {
            item_cap: 2,
            ..FeedSettings::default()
        };
        let assembler = FeedAssembler::new(store, &settings);

        let items = assembler.build_feed_at(t(15)).await;
        let titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Bike 3 - $10", "Bike 2 - $10"]);
    }

    #[tokio::test]
    async fn bike_entry_maps_to_feed_item() {
        let store = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let bike = record(42, "Vintage Bike $120", "$120");
        store
            .upsert_first_seen(&LedgerEntry::first_sighting(&bike, t(3)))
            .await
            .unwrap();
        let items = FeedAssembler::new(store, &FeedSettings::default())
            .build_feed_at(t(4))
            .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Vintage Bike $120 - $120");
        assert_eq!(items[0].description, "Price: $120 | Title: Vintage Bike $120");
        assert_eq!(items[0].link, bike.listing_url);
        assert_eq!(items[0].guid, ListingId::for_url(&bike.listing_url));
        assert_eq!(items[0].published_at, t(3));
    }

    #[tokio::test]
    async fn oversized_retention_window_keeps_every_entry() {
        let store = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let entry = LedgerEntry::first_sighting(&record(1, "Bike 1", "$10"), t(1));
        store.upsert_first_seen(&entry).await.unwrap();
        let settings = FeedSettings {
            retention_days: u32::MAX,
            ..FeedSettings::default()
        };

        let items = FeedAssembler::new(store, &settings).build_feed_at(t(15)).await;
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn rss_document_escapes_text_and_marks_guid_as_opaque() {
        let item = FeedItem {
            title: "Tools & <parts> - $5".into(),
            link: "https://facebook.com/marketplace/item/5/".into(),
            description: "Price: $5 | Title: Tools & <parts>".into(),
            guid: ListingId::from_stored("abc123"),
            published_at: t(2),
        };
        let xml = render_rss(&channel(), &[item], t(3)).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<rss version=\"2.0\">"));
        assert!(xml.contains("<title>Tools &amp; &lt;parts&gt; - $5</title>"));
        assert!(xml.contains("<guid isPermaLink=\"false\">abc123</guid>"));
        assert!(xml.contains("<link>https://facebook.com/marketplace/item/5/</link>"));

        let pub_date = xml
            .split("<pubDate>")
            .nth(1)
            .and_then(|rest| rest.split("</pubDate>").next())
            .unwrap();
        assert_eq!(DateTime::parse_from_rfc2822(pub_date).unwrap(), t(2));
    }

    #[test]
    fn empty_feed_is_still_a_well_formed_channel() {
        let xml = render_rss(&channel(), &[], t(3)).unwrap();
        assert!(xml.contains("<channel><title>Marketplace Listing Feed</title>"));
        assert!(!xml.contains("<item>"));
        assert!(xml.ends_with("</channel></rss>"));
    }
}
