//! Listing extraction from rendered search pages + per-source keyword filters.

mod extract;
mod filter;

pub use extract::{
    ExtractError, ExtractorConfig, ListingExtractor, Listings, ParsedPage, DEFAULT_BASE_ORIGIN,
    DEFAULT_LISTING_PATH_PREFIX,
};
pub use filter::{FilterLevel, FilterPolicy, FilterSet, PolicyWarning, Verdict};

pub const CRATE_NAME: &str = "adwatch-extract";
