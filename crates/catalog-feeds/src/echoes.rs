use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use catalog_core::{CurrentPrice, ItemId, RawHistoryRow};
use catalog_storage::HttpFetcher;

use crate::parse::{parse_current_prices, parse_history, parse_item_page};
use crate::{CatalogFeed, FeedError, IconImage, ItemPage};

const ITEMS_API: &str = "echoes-items";
const HISTORY_API: &str = "echoes-history";
const PRICES_API: &str = "echoes-prices";
const ICONS_API: &str = "echoes-icons";

const CSV_ACCEPT: &str = "text/csv";
const DEFAULT_ICON_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoesEndpoints {
    pub items_url: String,
    pub history_url: String,
    pub current_prices_url: String,
    /// Icon source URL with an `{icon_id}` placeholder.
    pub icon_url_template: String,
}

/// The public market API, read as CSV.
#[derive(Debug, Clone)]
pub struct EchoesApi {
    http: Arc<HttpFetcher>,
    endpoints: EchoesEndpoints,
}

impl EchoesApi {
    pub fn new(http: Arc<HttpFetcher>, endpoints: EchoesEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn item_page_query(page: u32) -> Vec<(&'static str, String)> {
        vec![
            ("page", page.to_string()),
            ("order[name]", "asc".to_string()),
            ("order[categoryName]", "asc".to_string()),
            ("order[groupName]", "asc".to_string()),
            ("exists[weekly_average_price]", "true".to_string()),
        ]
    }

    pub fn icon_url(&self, icon_id: &str) -> String {
        self.endpoints.icon_url_template.replace("{icon_id}", icon_id)
    }
}

#[async_trait]
impl CatalogFeed for EchoesApi {
    fn feed_id(&self) -> &'static str {
        "echoes"
    }

    async fn fetch_item_page(&self, page: u32) -> Result<ItemPage, FeedError> {
        let response = self
            .http
            .get(
                ITEMS_API,
                &self.endpoints.items_url,
                &Self::item_page_query(page),
                Some(CSV_ACCEPT),
            )
            .await?;
        Ok(parse_item_page(&response.text())?)
    }

    async fn fetch_item_history(&self, item_id: &str) -> Result<Vec<RawHistoryRow>, FeedError> {
        let query = [("page", "1".to_string()), ("itemId", item_id.to_string())];
        let response = self
            .http
            .get(HISTORY_API, &self.endpoints.history_url, &query, Some(CSV_ACCEPT))
            .await?;
        Ok(parse_history(&response.text()))
    }

    async fn fetch_current_prices(&self) -> Result<BTreeMap<ItemId, CurrentPrice>, FeedError> {
        let response = self
            .http
            .get(PRICES_API, &self.endpoints.current_prices_url, &[], Some(CSV_ACCEPT))
            .await?;
        Ok(parse_current_prices(&response.text()))
    }

    async fn fetch_icon(&self, icon_id: &str) -> Result<IconImage, FeedError> {
        let url = self.icon_url(icon_id);
        let response = self.http.get(ICONS_API, &url, &[], None).await?;
        let content_type = response
            .content_type
            .filter(|ct| ct.starts_with("image/"))
            .unwrap_or_else(|| DEFAULT_ICON_CONTENT_TYPE.to_string());
        Ok(IconImage {
            bytes: response.body,
            content_type,
        })
    }
}
