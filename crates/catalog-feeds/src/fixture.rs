use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use catalog_core::{CurrentPrice, ItemId, RawHistoryRow};

use crate::parse::{parse_current_prices, parse_history, parse_item_page};
use crate::{CatalogFeed, FeedError, IconImage, ItemPage};

/// A request the fixture feed has served, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedCall {
    ItemPage(u32),
    History(ItemId),
    CurrentPrices,
    Icon(String),
}

/// Serves feed payloads from memory, loaded from a directory or built up in
/// tests. Pages past the last one are empty, unknown items have no history
/// and unknown icons answer 404.
#[derive(Debug, Default)]
pub struct FixtureFeed {
    pages: Vec<String>,
    histories: HashMap<ItemId, String>,
    current_prices: String,
    icons: HashMap<String, Vec<u8>>,
    page_statuses: HashMap<u32, u16>,
    page_failures: HashSet<u32>,
    failing_icons: HashSet<String>,
    failing_histories: HashSet<ItemId>,
    calls: Mutex<Vec<FeedCall>>,
}

impl FixtureFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `items/page_N.csv` (from 1 until the first gap), `history/<id>.csv`,
    /// `current_prices.csv` and `icons/<icon_id>.png`.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut feed = Self::new();

        for page in 1.. {
            let path = root.join("items").join(format!("page_{page}.csv"));
            if !path.exists() {
                break;
            }
            feed.pages.push(
                fs::read_to_string(&path)
                    .with_context(|| format!("reading fixture page {}", path.display()))?,
            );
        }

        for (stem, path) in dir_entries(&root.join("history"), "csv")? {
            let body = fs::read_to_string(&path)
                .with_context(|| format!("reading fixture history {}", path.display()))?;
            feed.histories.insert(stem, body);
        }

        let prices_path = root.join("current_prices.csv");
        if prices_path.exists() {
            feed.current_prices = fs::read_to_string(&prices_path)
                .with_context(|| format!("reading {}", prices_path.display()))?;
        }

        for (stem, path) in dir_entries(&root.join("icons"), "png")? {
            let bytes =
                fs::read(&path).with_context(|| format!("reading fixture icon {}", path.display()))?;
            feed.icons.insert(stem, bytes);
        }

        Ok(feed)
    }

    pub fn with_page(mut self, csv: impl Into<String>) -> Self {
        self.pages.push(csv.into());
        self
    }

    pub fn with_history(mut self, item_id: &str, csv: impl Into<String>) -> Self {
        self.histories.insert(item_id.to_string(), csv.into());
        self
    }

    pub fn with_current_prices(mut self, csv: impl Into<String>) -> Self {
        self.current_prices = csv.into();
        self
    }

    pub fn with_icon(mut self, icon_id: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.icons.insert(icon_id.to_string(), bytes.into());
        self
    }

    /// Answer `page` with a non-success status instead of its body.
    pub fn with_page_status(mut self, page: u32, status: u16) -> Self {
        self.page_statuses.insert(page, status);
        self
    }

    /// Fail `page` the way a dropped connection does: an error with no status.
    pub fn with_page_failure(mut self, page: u32) -> Self {
        self.page_failures.insert(page);
        self
    }

    pub fn with_failing_icon(mut self, icon_id: &str) -> Self {
        self.failing_icons.insert(icon_id.to_string());
        self
    }

    pub fn with_failing_history(mut self, item_id: &str) -> Self {
        self.failing_histories.insert(item_id.to_string());
        self
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn calls(&self) -> Vec<FeedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn history_requests(&self) -> Vec<ItemId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FeedCall::History(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn icon_requests(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                FeedCall::Icon(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: FeedCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

fn dir_entries(dir: &Path, extension: &str) -> Result<Vec<(String, std::path::PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            entries.push((stem.to_string(), path.clone()));
        }
    }
    entries.sort();
    Ok(entries)
}

#[async_trait]
impl CatalogFeed for FixtureFeed {
    fn feed_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_item_page(&self, page: u32) -> Result<ItemPage, FeedError> {
        self.record(FeedCall::ItemPage(page));
        if let Some(status) = self.page_statuses.get(&page) {
            return Err(FeedError::Status {
                feed: "items",
                status: *status,
            });
        }
        if self.page_failures.contains(&page) {
            return Err(anyhow::anyhow!("connection reset while reading page {page}").into());
        }
        let body = page
            .checked_sub(1)
            .and_then(|idx| self.pages.get(idx as usize))
            .map(String::as_str)
            .unwrap_or_default();
        Ok(parse_item_page(body)?)
    }

    async fn fetch_item_history(&self, item_id: &str) -> Result<Vec<RawHistoryRow>, FeedError> {
        self.record(FeedCall::History(item_id.to_string()));
        if self.failing_histories.contains(item_id) {
            return Err(FeedError::Status {
                feed: "history",
                status: 503,
            });
        }
        Ok(self
            .histories
            .get(item_id)
            .map(|body| parse_history(body))
            .unwrap_or_default())
    }

    async fn fetch_current_prices(&self) -> Result<BTreeMap<ItemId, CurrentPrice>, FeedError> {
        self.record(FeedCall::CurrentPrices);
        Ok(parse_current_prices(&self.current_prices))
    }

    async fn fetch_icon(&self, icon_id: &str) -> Result<IconImage, FeedError> {
        self.record(FeedCall::Icon(icon_id.to_string()));
        if self.failing_icons.contains(icon_id) {
            return Err(FeedError::Status {
                feed: "icons",
                status: 503,
            });
        }
        match self.icons.get(icon_id) {
            Some(bytes) => Ok(IconImage {
                bytes: bytes.clone(),
                content_type: "image/png".to_string(),
            }),
            None => Err(FeedError::Status {
                feed: "icons",
                status: 404,
            }),
        }
    }
}
