use std::collections::HashSet;

use adwatch_core::ListingRecord;
use scraper::{html::Select, ElementRef, Html, Selector};
use thiserror::Error;

pub const DEFAULT_BASE_ORIGIN: &str = "https://facebook.com";
pub const DEFAULT_LISTING_PATH_PREFIX: &str = "/marketplace/item/";

const ANCHOR_SELECTOR: &str = "a[href]";
const TITLE_SELECTOR: &str = r#"span[style*="-webkit-line-clamp"]"#;
const PRICE_SELECTOR: &str = r#"span[dir="auto"]"#;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("page markup is empty")]
    EmptyMarkup,
    #[error("invalid selector: {0}")]
    Selector(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Origin prefixed onto every canonical listing path.
    pub base_origin: String,
    pub listing_path_prefix: String,
    /// A price must start with this symbol unless it is a "free" listing.
    pub currency: String,
}

impl ExtractorConfig {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            base_origin: DEFAULT_BASE_ORIGIN.to_string(),
            listing_path_prefix: DEFAULT_LISTING_PATH_PREFIX.to_string(),
            currency: currency.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListingExtractor {
    config: ExtractorConfig,
    anchor: Selector,
    title: Selector,
    price: Selector,
}

/// A parsed search page. Extraction borrows from it, so records are produced
/// lazily in document order.
pub struct ParsedPage {
    document: Html,
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector(e.to_string()))
}

impl ListingExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self, ExtractError> {
        Ok(Self {
            config,
            anchor: parse_selector(ANCHOR_SELECTOR)?,
            title: parse_selector(TITLE_SELECTOR)?,
            price: parse_selector(PRICE_SELECTOR)?,
        })
    }

    /// Parses raw markup. Markup with nothing to parse is a recoverable error;
    /// the caller treats the page as yielding no listings.
    pub fn parse(&self, markup: &str) -> Result<ParsedPage, ExtractError> {
        if markup.trim().is_empty() {
            return Err(ExtractError::EmptyMarkup);
        }
        Ok(ParsedPage {
            document: Html::parse_document(markup),
        })
    }

    pub fn extract<'a>(&'a self, page: &'a ParsedPage, source_url: &'a str) -> Listings<'a> {
        Listings {
            anchors: page.document.select(&self.anchor),
            extractor: self,
            source_url,
            seen: HashSet::new(),
        }
    }

    /// Parse + extract in one go, collecting every accepted record.
    pub fn extract_all(&self, markup: &str, source_url: &str) -> Result<Vec<ListingRecord>, ExtractError> {
        let page = self.parse(markup)?;
        Ok(self.extract(&page, source_url).collect())
    }

    /// Strips query string and fragment, keeps only listing paths, and
    /// re-anchors them on the configured origin.
    pub fn canonicalize_href(&self, href: &str) -> Option<String> {
        let href = href.trim();
        let bare = href.split(['?', '#']).next().unwrap_or_default();
        let path = match bare
            .strip_prefix("https://")
            .or_else(|| bare.strip_prefix("http://"))
            .or_else(|| bare.strip_prefix("//"))
        {
            Some(rest) => &rest[rest.find('/')?..],
            None => bare,
        };
        if !path.starts_with(&self.config.listing_path_prefix) {
            return None;
        }
        Some(format!(
            "{}{}",
            self.config.base_origin.trim_end_matches('/'),
            path
        ))
    }

    pub fn price_accepted(&self, price: &str) -> bool {
        price.starts_with(&self.config.currency) || price.to_lowercase().contains("free")
    }

    fn candidate(&self, anchor: ElementRef<'_>, source_url: &str) -> Option<ListingRecord> {
        let listing_url = self.canonicalize_href(anchor.value().attr("href")?)?;

        let title_el = anchor.select(&self.title).next()?;
        // The title label may itself sit inside a dir=auto wrapper; skip those.
        let price_el = anchor.select(&self.price).find(|candidate| {
            candidate.id() != title_el.id()
                && !title_el.ancestors().any(|node| node.id() == candidate.id())
        })?;

        let title = stripped_text(title_el);
        let price = stripped_text(price_el);
        if title.is_empty() || price.is_empty() || !self.price_accepted(&price) {
            return None;
        }

        Some(ListingRecord {
            source_url: source_url.to_string(),
            listing_url,
            title,
            price,
        })
    }
}

/// Concatenates the element's text nodes with surrounding whitespace removed.
fn stripped_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct Listings<'a> {
    anchors: Select<'a, 'a>,
    extractor: &'a ListingExtractor,
    source_url: &'a str,
    seen: HashSet<String>,
}

impl Iterator for Listings<'_> {
    type Item = ListingRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for anchor in self.anchors.by_ref() {
            let Some(record) = self.extractor.candidate(anchor, self.source_url) else {
                continue;
            };
            if self.seen.insert(record.listing_url.clone()) {
                return Some(record);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "https://facebook.com/marketplace/nyc/search?query=bike";

    fn extractor(currency: &str) -> ListingExtractor {
        ListingExtractor::new(ExtractorConfig::new(currency)).unwrap()
    }

    fn card(href: &str, title: &str, price: &str) -> String {
        format!(
            r#"<a class="x1i10hfl" href="{href}">
                 <div><span dir="auto"><span>{price}</span></span></div>
                 <div><span dir="auto"><span style="-webkit-box-orient: vertical; -webkit-line-clamp: 2;">{title}</span></span></div>
               </a>"#
        )
    }

    fn page(cards: &[String]) -> String {
        format!("<html><body><div>{}</div></body></html>", cards.join("\n"))
    }

    #[test]
    fn extracts_title_price_and_canonical_link() {
        let html = page(&[card("/marketplace/item/123/?ref=search&x=1", "Vintage Bike", "$120")]);
        let records = extractor("$").extract_all(&html, SOURCE).unwrap();
        assert_eq!(
            records,
            vec![ListingRecord {
                source_url: SOURCE.into(),
                listing_url: "https://facebook.com/marketplace/item/123/".into(),
                title: "Vintage Bike".into(),
                price: "$120".into(),
            }]
        );
    }

    #[test]
    fn currency_gate_accepts_symbol_and_free() {
        let ex = extractor("$");
        assert!(ex.price_accepted("$50"));
        assert!(!ex.price_accepted("€50"));
        assert!(ex.price_accepted("Free"));
        assert!(extractor("€").price_accepted("FREE"));
    }

    #[test]
    fn drops_candidates_with_foreign_currency_or_missing_fields() {
        let missing_title = r#"<a href="/marketplace/item/9/"><span dir="auto">$5</span></a>"#.to_string();
        let html = page(&[
            card("/marketplace/item/1/", "Lamp", "€50"),
            card("/marketplace/item/2/", "Chair", "Free"),
            missing_title,
        ]);
        let records = extractor("$").extract_all(&html, SOURCE).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Chair");
        assert_eq!(records[0].price, "Free");
    }

    #[test]
    fn ignores_non_listing_links() {
        let html = page(&[
            card("/marketplace/category/vehicles/", "Vehicles", "$1"),
            card("https://www.facebook.com/marketplace/item/77/?ref=x", "Desk", "$40"),
        ]);
        let records = extractor("$").extract_all(&html, SOURCE).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].listing_url, "https://facebook.com/marketplace/item/77/");
    }

    #[test]
    fn same_link_twice_on_one_page_keeps_first() {
        let html = page(&[
            card("/marketplace/item/5/?a=1", "First Title", "$10"),
            card("/marketplace/item/5/?a=2", "Second Title", "$11"),
            card("/marketplace/item/6/", "Other", "$12"),
        ]);
        let records = extractor("$").extract_all(&html, SOURCE).unwrap();
        let titles: Vec<_> = records.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["First Title", "Other"]);
    }

    #[test]
    fn extraction_is_lazy_and_in_document_order() {
        let ex = extractor("$");
        let html = page(&[
            card("/marketplace/item/1/", "One", "$1"),
            card("/marketplace/item/2/", "Two", "$2"),
        ]);
        let parsed = ex.parse(&html).unwrap();
        let mut listings = ex.extract(&parsed, SOURCE);
        assert_eq!(listings.next().map(|r| r.title), Some("One".to_string()));
        assert_eq!(listings.next().map(|r| r.title), Some("Two".to_string()));
        assert!(listings.next().is_none());
    }

    #[test]
    fn empty_markup_is_recoverable_error() {
        let ex = extractor("$");
        assert!(matches!(ex.parse("   \n"), Err(ExtractError::EmptyMarkup)));
        let records = ex.extract_all("<html><body><p>nothing</p></body></html>", SOURCE).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn text_is_joined_without_whitespace_padding() {
        let html = page(&[card("/marketplace/item/3/", "  Road   Bike ", " $ 300 ")]);
        let records = extractor("$").extract_all(&html, SOURCE).unwrap();
        assert_eq!(records[0].title, "Road   Bike");
        assert_eq!(records[0].price, "$ 300");
    }
}
