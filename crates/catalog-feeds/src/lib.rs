//! Upstream catalog feeds: the paginated item list, per-item price history,
//! the bulk current-price list and icon images.
//!
//! Every feed is delimited text. [`EchoesApi`] reads them over HTTP and
//! [`FixtureFeed`] reads the same payloads from disk.

use std::collections::BTreeMap;

use async_trait::async_trait;
use catalog_core::{CurrentPrice, ItemId, RawHistoryRow, RawItemRecord};
use catalog_storage::FetchError;
use thiserror::Error;

pub mod echoes;
pub mod fixture;
pub mod parse;

pub use echoes::{EchoesApi, EchoesEndpoints};
pub use fixture::{FeedCall, FixtureFeed};
pub use parse::{parse_current_prices, parse_history, parse_item_page};

pub const CRATE_NAME: &str = "catalog-feeds";

/// One page of the item feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPage {
    /// The body was empty after trimming.
    Empty,
    /// A header row and nothing else.
    HeaderOnly,
    Rows(Vec<RawItemRecord>),
}

impl ItemPage {
    pub fn rows(&self) -> &[RawItemRecord] {
        match self {
            Self::Rows(rows) => rows,
            Self::Empty | Self::HeaderOnly => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{feed} returned status {status}")]
    Status { feed: &'static str, status: u16 },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl FeedError {
    /// The HTTP status behind this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Fetch(err) => err.status(),
            Self::Status { status, .. } => Some(*status),
            Self::Csv(_) | Self::Anyhow(_) => None,
        }
    }
}

#[async_trait]
pub trait CatalogFeed: Send + Sync {
    fn feed_id(&self) -> &'static str;

    /// Fetch item page `page`, counting from 1.
    async fn fetch_item_page(&self, page: u32) -> Result<ItemPage, FeedError>;

    /// The full price series for one item. No rows means no history.
    async fn fetch_item_history(&self, item_id: &str) -> Result<Vec<RawHistoryRow>, FeedError>;

    async fn fetch_current_prices(&self) -> Result<BTreeMap<ItemId, CurrentPrice>, FeedError>;

    async fn fetch_icon(&self, icon_id: &str) -> Result<IconImage, FeedError>;
}
