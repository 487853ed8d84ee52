//! Last-writer-wins merge of fetched item pages into the prior catalog.
//!
//! Timestamps are compared as strings. The feed emits one fixed ISO 8601
//! layout, so lexical order is chronological order.

use std::collections::{BTreeMap, BTreeSet};

use catalog_core::{CatalogItem, ChangeClassification, ItemId, RawItemRecord};
use serde::Serialize;
use tracing::{debug, warn};

pub type ItemMapping = BTreeMap<ItemId, CatalogItem>;
pub type Classifications = BTreeMap<ItemId, ChangeClassification>;

/// Counts for the rows of a single page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageMergeStats {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_missing_id: usize,
}

/// Decide what a single fetched row does to the mapping.
pub fn merge_record(mapping: &mut ItemMapping, id: &str, raw: &RawItemRecord) -> ChangeClassification {
    match mapping.get_mut(id) {
        None => {
            mapping.insert(id.to_string(), CatalogItem::from_raw(id, raw));
            ChangeClassification::New
        }
        Some(stored) => {
            let stored_updated = stored.date_updated.as_deref().unwrap_or_default();
            match raw.date_updated() {
                Some(fetched) if !stored_updated.is_empty() && fetched > stored_updated => {
                    stored.overwrite_from(raw);
                    ChangeClassification::Updated
                }
                _ => ChangeClassification::Unchanged,
            }
        }
    }
}

/// Merge one page into `prior`, returning the new mapping and a tag for every
/// keyed row on the page.
pub fn merge(mut prior: ItemMapping, fetched_page: &[RawItemRecord]) -> (ItemMapping, Classifications) {
    let mut classifications = Classifications::new();
    for raw in fetched_page {
        let Some(id) = raw.item_id() else {
            continue;
        };
        let tag = merge_record(&mut prior, id, raw);
        classifications
            .entry(id.to_string())
            .and_modify(|existing| *existing = existing.strongest(tag))
            .or_insert(tag);
    }
    (prior, classifications)
}

/// Accumulates merge state across every page of a run.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    items: ItemMapping,
    classifications: Classifications,
    fetch_order: Vec<ItemId>,
    skipped_missing_id: usize,
    malformed_prices: usize,
}

/// The finished merge, ready for propagation.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub items: ItemMapping,
    pub classifications: Classifications,
    /// Fetched ids in first-seen order, followed by prior ids the feed did not return.
    pub processing_order: Vec<ItemId>,
    pub skipped_missing_id: usize,
    pub malformed_prices: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub not_in_feed: usize,
    pub skipped_missing_id: usize,
    pub malformed_prices: usize,
}

impl MergeEngine {
    pub fn new(prior: ItemMapping) -> Self {
        Self {
            items: prior,
            ..Self::default()
        }
    }

    pub fn items(&self) -> &ItemMapping {
        &self.items
    }

    pub fn classification(&self, id: &str) -> Option<ChangeClassification> {
        self.classifications.get(id).copied()
    }

    pub fn merge_page(&mut self, page: &[RawItemRecord]) -> PageMergeStats {
        let mut stats = PageMergeStats::default();
        for raw in page {
            let Some(id) = raw.item_id() else {
                debug!(name = raw.name.as_deref().unwrap_or("unknown"), "skipping row without id");
                stats.skipped_missing_id += 1;
                continue;
            };
            if raw.has_malformed_price() {
                warn!(
                    item_id = id,
                    price = raw.weekly_average_price.as_deref().unwrap_or_default(),
                    "weekly_average_price is not numeric; storing NULL"
                );
                self.malformed_prices += 1;
            }

            let tag = merge_record(&mut self.items, id, raw);
            match tag {
                ChangeClassification::New => stats.new += 1,
                ChangeClassification::Updated => stats.updated += 1,
                ChangeClassification::Unchanged => stats.unchanged += 1,
            }
            match self.classifications.get_mut(id) {
                Some(existing) => *existing = existing.strongest(tag),
                None => {
                    self.classifications.insert(id.to_string(), tag);
                    self.fetch_order.push(id.to_string());
                }
            }
        }
        self.skipped_missing_id += stats.skipped_missing_id;
        stats
    }

    pub fn finish(self) -> MergeOutcome {
        let fetched: BTreeSet<&ItemId> = self.fetch_order.iter().collect();
        let mut processing_order = self.fetch_order.clone();
        processing_order.extend(
            self.items
                .keys()
                .filter(|id| !fetched.contains(id))
                .cloned(),
        );
        MergeOutcome {
            processing_order,
            items: self.items,
            classifications: self.classifications,
            skipped_missing_id: self.skipped_missing_id,
            malformed_prices: self.malformed_prices,
        }
    }
}

impl MergeOutcome {
    pub fn counts(&self) -> MergeCounts {
        let mut counts = MergeCounts {
            skipped_missing_id: self.skipped_missing_id,
            malformed_prices: self.malformed_prices,
            ..MergeCounts::default()
        };
        for tag in self.classifications.values() {
            match tag {
                ChangeClassification::New => counts.new += 1,
                ChangeClassification::Updated => counts.updated += 1,
                ChangeClassification::Unchanged => counts.unchanged += 1,
            }
        }
        counts.not_in_feed = self.items.len().saturating_sub(self.classifications.len());
        counts
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn raw(id: &str, date_updated: &str, price: &str) -> RawItemRecord {
        RawItemRecord {
            id: Some(id.to_string()),
            name: Some("Sword".to_string()),
            category_name: Some("Weapon".to_string()),
            group_name: Some("Blades".to_string()),
            weekly_average_price: Some(price.to_string()),
            icon_id: None,
            date_created: Some("2023-12-01T00:00:00+00:00".to_string()),
            date_updated: Some(date_updated.to_string()),
        }
    }

    fn prior_with_sword() -> ItemMapping {
        let (prior, _) = merge(
            ItemMapping::new(),
            &[raw("1", "2024-01-01T00:00:00+00:00", "10.5")],
        );
        prior
    }

    #[test]
    fn unseen_id_is_new() {
        let (items, tags) = merge(
            ItemMapping::new(),
            &[raw("1", "2024-01-01T00:00:00+00:00", "10.5")],
        );
        assert_eq!(tags["1"], ChangeClassification::New);
        assert_eq!(items["1"].name, "Sword");
        assert_eq!(items["1"].weekly_average_price, Some(dec!(10.5)));
    }

    #[test]
    fn newer_timestamp_updates() {
        let (items, tags) = merge(
            prior_with_sword(),
            &[raw("1", "2024-01-02T00:00:00+00:00", "12.0")],
        );
        assert_eq!(tags["1"], ChangeClassification::Updated);
        assert_eq!(items["1"].weekly_average_price, Some(dec!(12.0)));
        assert_eq!(items["1"].date_updated.as_deref(), Some("2024-01-02T00:00:00+00:00"));
    }

    #[test]
    fn equal_or_older_timestamp_leaves_item_untouched() {
        let prior = prior_with_sword();
        for ts in ["2024-01-01T00:00:00+00:00", "2023-12-31T00:00:00+00:00"] {
            let (items, tags) = merge(prior.clone(), &[raw("1", ts, "99")]);
            assert_eq!(tags["1"], ChangeClassification::Unchanged);
            assert_eq!(items["1"], prior["1"]);
        }
    }

    #[test]
    fn missing_fetched_timestamp_is_unchanged() {
        let mut record = raw("1", "", "99");
        record.date_updated = None;
        let (items, tags) = merge(prior_with_sword(), &[record]);
        assert_eq!(tags["1"], ChangeClassification::Unchanged);
        assert_eq!(items["1"].weekly_average_price, Some(dec!(10.5)));
    }

    #[test]
    fn empty_stored_timestamp_is_never_overwritten() {
        let mut prior = prior_with_sword();
        if let Some(item) = prior.get_mut("1") {
            item.date_updated = None;
        }
        let (items, tags) = merge(prior, &[raw("1", "2024-01-02T00:00:00+00:00", "12.0")]);
        assert_eq!(tags["1"], ChangeClassification::Unchanged);
        assert_eq!(items["1"].weekly_average_price, Some(dec!(10.5)));
    }

    #[test]
    fn date_created_survives_every_update() {
        let mut update = raw("1", "2024-02-01T00:00:00+00:00", "12.0");
        update.date_created = Some("2030-01-01T00:00:00+00:00".to_string());
        let (items, _) = merge(prior_with_sword(), &[update]);
        assert_eq!(
            items["1"].date_created.as_deref(),
            Some("2023-12-01T00:00:00+00:00")
        );
    }

    #[test]
    fn update_keeps_the_durable_icon_key() {
        let mut prior = prior_with_sword();
        if let Some(item) = prior.get_mut("1") {
            item.mark_icon_stored("icons/77.png");
        }
        let (items, _) = merge(prior, &[raw("1", "2024-02-01T00:00:00+00:00", "12.0")]);
        assert_eq!(items["1"].icon_asset_key(), Some("icons/77.png"));
        assert!(items["1"].icon_downloaded);
    }

    #[test]
    fn engine_accumulates_pages_and_skips_rows_without_id() {
        let mut engine = MergeEngine::new(prior_with_sword());
        let first = engine.merge_page(&[
            raw("2", "2024-01-01T00:00:00+00:00", "1"),
            raw("", "2024-01-01T00:00:00+00:00", "1"),
        ]);
        assert_eq!(first.new, 1);
        assert_eq!(first.skipped_missing_id, 1);

        // Same id again on a later page: first-seen NEW is kept.
        let second = engine.merge_page(&[
            raw("2", "2024-03-01T00:00:00+00:00", "bad"),
            raw("1", "2024-01-01T00:00:00+00:00", "10.5"),
        ]);
        assert_eq!(second.updated, 1);
        assert_eq!(second.unchanged, 1);
        assert_eq!(engine.classification("2"), Some(ChangeClassification::New));
        assert_eq!(engine.items()["2"].weekly_average_price, None);

        let outcome = engine.finish();
        assert_eq!(outcome.processing_order, vec!["2".to_string(), "1".to_string()]);
        let counts = outcome.counts();
        assert_eq!(counts.new, 1);
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.skipped_missing_id, 1);
        assert_eq!(counts.malformed_prices, 1);
    }

    #[test]
    fn prior_items_missing_from_feed_are_processed_last() {
        let mut engine = MergeEngine::new(prior_with_sword());
        engine.merge_page(&[raw("9", "2024-01-01T00:00:00+00:00", "3")]);
        let outcome = engine.finish();
        assert_eq!(outcome.processing_order, vec!["9".to_string(), "1".to_string()]);
        assert_eq!(outcome.counts().not_in_feed, 1);
    }
}
