use catalog_feeds::{CatalogFeed, ItemPage};
use serde::Serialize;
use tracing::{info, warn};

use crate::merge::{MergeEngine, PageMergeStats};

/// Why the item feed stopped being read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PaginationEnd {
    EmptyPage { page: u32 },
    HeaderOnly { page: u32 },
    HttpStatus { page: u32, status: u16 },
    Failed { page: u32, error: String },
    PageLimit { pages: u32 },
}

impl PaginationEnd {
    /// True when the feed was exhausted rather than cut short.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::EmptyPage { .. } | Self::HeaderOnly { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationReport {
    pub pages_merged: u32,
    pub rows_seen: usize,
    pub end: PaginationEnd,
}

/// Read pages 1, 2, ... into `engine` until the feed ends. Never fails: a
/// transport error ends the loop and keeps what was merged so far.
pub async fn fetch_and_merge(
    feed: &dyn CatalogFeed,
    engine: &mut MergeEngine,
    max_pages: Option<u32>,
) -> PaginationReport {
    let mut pages_merged = 0u32;
    let mut rows_seen = 0usize;
    let mut page = 1u32;

    let end = loop {
        if let Some(limit) = max_pages {
            if pages_merged >= limit {
                warn!(limit, "page limit reached; stopping item feed");
                break PaginationEnd::PageLimit { pages: limit };
            }
        }

        match feed.fetch_item_page(page).await {
            Ok(ItemPage::Empty) => break PaginationEnd::EmptyPage { page },
            Ok(ItemPage::HeaderOnly) => break PaginationEnd::HeaderOnly { page },
            Ok(ItemPage::Rows(rows)) => {
                let PageMergeStats {
                    new,
                    updated,
                    unchanged,
                    skipped_missing_id,
                } = engine.merge_page(&rows);
                info!(page, rows = rows.len(), new, updated, unchanged, skipped_missing_id, "merged item page");
                rows_seen += rows.len();
                pages_merged += 1;
                page += 1;
            }
            Err(err) => match err.status() {
                Some(status) => {
                    warn!(page, status, error = %err, "item feed returned non-success status");
                    break PaginationEnd::HttpStatus { page, status };
                }
                None => {
                    warn!(page, error = %err, "item feed request failed");
                    break PaginationEnd::Failed {
                        page,
                        error: err.to_string(),
                    };
                }
            },
        }
    };

    info!(pages_merged, rows_seen, end = ?end, "item feed finished");
    PaginationReport {
        pages_merged,
        rows_seen,
        end,
    }
}

#[cfg(test)]
mod tests {
    use catalog_feeds::{FeedCall, FixtureFeed};

    use super::*;
    use crate::merge::ItemMapping;

    const HEADER: &str =
        "id,name,category_name,group_name,weekly_average_price,icon_id,date_created,date_updated";

    fn page(rows: &[&str]) -> String {
        let mut body = format!("{HEADER}\n");
        for row in rows {
            body.push_str(row);
            body.push('\n');
        }
        body
    }

    #[tokio::test]
    async fn stops_on_empty_page_and_keeps_merged_items() {
        let feed = FixtureFeed::new()
            .with_page(page(&["1,Sword,Weapon,Blades,10.5,,,2024-01-01T00:00:00+00:00"]))
            .with_page(page(&["2,Shield,Armor,Plates,5,,,2024-01-01T00:00:00+00:00"]));
        let mut engine = MergeEngine::new(ItemMapping::new());

        let report = fetch_and_merge(&feed, &mut engine, None).await;

        assert_eq!(report.pages_merged, 2);
        assert_eq!(report.end, PaginationEnd::EmptyPage { page: 3 });
        assert!(report.end.is_clean());
        assert_eq!(engine.items().len(), 2);
    }

    #[tokio::test]
    async fn stops_on_header_only_page() {
        let feed = FixtureFeed::new()
            .with_page(page(&["1,Sword,Weapon,Blades,10.5,,,2024-01-01T00:00:00+00:00"]))
            .with_page(page(&[]))
            .with_page(page(&["3,Never,Read,Row,1,,,2024-01-01T00:00:00+00:00"]));
        let mut engine = MergeEngine::new(ItemMapping::new());

        let report = fetch_and_merge(&feed, &mut engine, None).await;

        assert_eq!(report.end, PaginationEnd::HeaderOnly { page: 2 });
        assert!(!engine.items().contains_key("3"));
    }

    #[tokio::test]
    async fn non_success_status_ends_the_loop_without_losing_pages() {
        let feed = FixtureFeed::new()
            .with_page(page(&["1,Sword,Weapon,Blades,10.5,,,2024-01-01T00:00:00+00:00"]))
            .with_page(page(&["2,Shield,Armor,Plates,5,,,2024-01-01T00:00:00+00:00"]))
            .with_page_status(2, 502);
        let mut engine = MergeEngine::new(ItemMapping::new());

        let report = fetch_and_merge(&feed, &mut engine, None).await;

        assert_eq!(report.end, PaginationEnd::HttpStatus { page: 2, status: 502 });
        assert!(!report.end.is_clean());
        assert_eq!(engine.items().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_ends_the_loop_and_keeps_merged_items() {
        let feed = FixtureFeed::new()
            .with_page(page(&["1,Sword,Weapon,Blades,10.5,,,2024-01-01T00:00:00+00:00"]))
            .with_page(page(&["2,Shield,Armor,Plates,5,,,2024-01-01T00:00:00+00:00"]))
            .with_page_failure(2);
        let mut engine = MergeEngine::new(ItemMapping::new());

        let report = fetch_and_merge(&feed, &mut engine, None).await;

        match &report.end {
            PaginationEnd::Failed { page, error } => {
                assert_eq!(*page, 2);
                assert!(error.contains("connection reset"));
            }
            other => panic!("unexpected end {other:?}"),
        }
        assert!(!report.end.is_clean());
        assert_eq!(report.pages_merged, 1);
        assert!(engine.items().contains_key("1"));
        assert!(!engine.items().contains_key("2"));
    }

    #[tokio::test]
    async fn page_limit_caps_requests() {
        let feed = FixtureFeed::new()
            .with_page(page(&["1,Sword,Weapon,Blades,10.5,,,2024-01-01T00:00:00+00:00"]))
            .with_page(page(&["2,Shield,Armor,Plates,5,,,2024-01-01T00:00:00+00:00"]));
        let mut engine = MergeEngine::new(ItemMapping::new());

        let report = fetch_and_merge(&feed, &mut engine, Some(1)).await;

        assert_eq!(report.end, PaginationEnd::PageLimit { pages: 1 });
        assert_eq!(feed.calls(), vec![FeedCall::ItemPage(1)]);
    }
}
