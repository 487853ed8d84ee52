//! Pushes the merged catalog out to its dependents: icons to the asset store,
//! items to the relational store and price observations to item history.
//!
//! Every step is safe to repeat. Failures are counted per item and never
//! stop the items that follow.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use catalog_core::{CatalogItem, ChangeClassification, CurrentPrice, HistoryRecord, ItemId, RawHistoryRow};
use catalog_feeds::CatalogFeed;
use catalog_storage::{row_text, sanitize_key_segment, AssetStore, LocalAssetDir, RelationalStore, StorageError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::merge::{Classifications, ItemMapping};
use crate::schema::{INSERT_HISTORY, SELECT_LATEST_HISTORY, UPSERT_ITEM};

/// Local file name for a staged icon.
pub fn icon_file_name(icon_id: &str) -> String {
    format!("{}.png", sanitize_key_segment(icon_id.trim()))
}

/// Durable key for an icon. Depends only on the icon id, never on the item.
pub fn icon_asset_key(icon_id: &str) -> String {
    format!("icons/{}", icon_file_name(icon_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconOutcome {
    NoIcon,
    AlreadyPresent,
    Stored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    Updated,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub inserted: usize,
    pub skipped_rows: usize,
    pub failed_rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    UpToDate,
    NoCurrentPrice,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Synced {
        backfill: Option<BackfillStats>,
        append: AppendOutcome,
    },
    Failed {
        stage: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub icon: IconOutcome,
    pub persist: PersistOutcome,
    pub history: HistoryOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogCounts {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IconCounts {
    pub already_present: usize,
    pub stored: usize,
    pub no_icon: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryCounts {
    pub backfilled_items: usize,
    pub backfilled_records: usize,
    pub skipped_rows: usize,
    pub failed_records: usize,
    pub appended: usize,
    pub up_to_date: usize,
    pub no_current_price: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistedSummary {
    pub catalog: CatalogCounts,
    pub icons: IconCounts,
    pub history: HistoryCounts,
}

impl PersistedSummary {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome.icon {
            IconOutcome::NoIcon => self.icons.no_icon += 1,
            IconOutcome::AlreadyPresent => self.icons.already_present += 1,
            IconOutcome::Stored => self.icons.stored += 1,
            IconOutcome::Failed => self.icons.failed += 1,
        }
        match outcome.persist {
            PersistOutcome::Inserted => self.catalog.inserted += 1,
            PersistOutcome::Updated => self.catalog.updated += 1,
            PersistOutcome::Failed => self.catalog.failed += 1,
        }
        match &outcome.history {
            HistoryOutcome::Failed { .. } => self.history.failed += 1,
            HistoryOutcome::Synced { backfill, append } => {
                if let Some(stats) = backfill {
                    if stats.inserted > 0 {
                        self.history.backfilled_items += 1;
                    }
                    self.history.backfilled_records += stats.inserted;
                    self.history.skipped_rows += stats.skipped_rows;
                    self.history.failed_records += stats.failed_rows;
                }
                match append {
                    AppendOutcome::Appended => self.history.appended += 1,
                    AppendOutcome::UpToDate => self.history.up_to_date += 1,
                    AppendOutcome::NoCurrentPrice => self.history.no_current_price += 1,
                    AppendOutcome::Failed => self.history.failed += 1,
                }
            }
        }
    }

    pub fn failures(&self) -> usize {
        self.catalog.failed + self.icons.failed + self.history.failed + self.history.failed_records
    }
}

/// The collaborators one propagation pass writes through.
pub struct PropagationDriver<'a> {
    pub feed: &'a dyn CatalogFeed,
    pub store: &'a dyn RelationalStore,
    pub assets: &'a dyn AssetStore,
    pub icon_staging: &'a LocalAssetDir,
    pub asset_bucket: &'a str,
    /// Ids the store held before this run; decides inserted versus updated.
    pub store_ids: &'a BTreeSet<ItemId>,
}

impl PropagationDriver<'_> {
    /// Process every item in `order` in turn: icon, then catalog row, then history.
    pub async fn propagate(
        &self,
        items: &mut ItemMapping,
        classifications: &Classifications,
        order: &[ItemId],
        current_prices: &BTreeMap<ItemId, CurrentPrice>,
    ) -> PersistedSummary {
        let mut summary = PersistedSummary::default();
        let mut icons_this_run: HashMap<String, Option<String>> = HashMap::new();

        for id in order {
            let Some(item) = items.get_mut(id) else {
                continue;
            };
            let classification = classifications.get(id).copied();
            let span = info_span!(
                "propagate_item",
                item_id = %id,
                classification = classification.map(ChangeClassification::as_str).unwrap_or("NOT_IN_FEED")
            );
            let outcome = self
                .propagate_item(item, current_prices.get(id), &mut icons_this_run)
                .instrument(span)
                .await;
            summary.record(&outcome);
        }

        info!(
            inserted = summary.catalog.inserted,
            updated = summary.catalog.updated,
            icons_stored = summary.icons.stored,
            history_appended = summary.history.appended,
            backfilled_records = summary.history.backfilled_records,
            failures = summary.failures(),
            "propagation finished"
        );
        summary
    }

    async fn propagate_item(
        &self,
        item: &mut CatalogItem,
        current: Option<&CurrentPrice>,
        icons_this_run: &mut HashMap<String, Option<String>>,
    ) -> ItemOutcome {
        let icon = self.ensure_icon(item, icons_this_run).await;
        let persist = self.persist_item(item).await;
        let history = self.sync_history(&item.id, current).await;
        ItemOutcome {
            icon,
            persist,
            history,
        }
    }

    /// `icons_this_run` maps icon ids already handled this run to the stored
    /// key, or `None` when they failed. Each icon is attempted at most once.
    pub async fn ensure_icon(
        &self,
        item: &mut CatalogItem,
        icons_this_run: &mut HashMap<String, Option<String>>,
    ) -> IconOutcome {
        let Some(icon_id) = item.icon_id.clone().filter(|id| !id.trim().is_empty()) else {
            return IconOutcome::NoIcon;
        };
        let asset_key = icon_asset_key(&icon_id);
        let staged_key = icon_file_name(&icon_id);

        if item.icon_asset_key() == Some(asset_key.as_str()) {
            item.icon_downloaded = true;
            return IconOutcome::AlreadyPresent;
        }
        match icons_this_run.get(&icon_id) {
            Some(Some(stored_key)) => {
                item.mark_icon_stored(stored_key.clone());
                return IconOutcome::AlreadyPresent;
            }
            Some(None) => {
                item.icon_downloaded = false;
                return IconOutcome::Failed;
            }
            None => {}
        }
        match self.icon_staging.contains(&staged_key).await {
            Ok(true) => {
                debug!(icon_id = %icon_id, "icon present locally");
                item.icon_downloaded = true;
                return IconOutcome::AlreadyPresent;
            }
            Ok(false) => {}
            Err(err) => warn!(icon_id = %icon_id, error = %err, "checking local icon failed"),
        }

        let stored = self.download_and_store(&icon_id, &staged_key, &asset_key).await;
        icons_this_run.insert(icon_id.clone(), stored.then(|| asset_key.clone()));
        if stored {
            item.mark_icon_stored(asset_key);
            IconOutcome::Stored
        } else {
            item.icon_downloaded = false;
            IconOutcome::Failed
        }
    }

    async fn download_and_store(&self, icon_id: &str, staged_key: &str, asset_key: &str) -> bool {
        let image = match self.feed.fetch_icon(icon_id).await {
            Ok(image) => image,
            Err(err) => {
                warn!(icon_id, error = %err, "icon download failed");
                return false;
            }
        };
        if let Err(err) = self.icon_staging.store_bytes(staged_key, &image.bytes).await {
            warn!(icon_id, error = %err, "staging icon failed");
            return false;
        }

        let upload = self
            .assets
            .put(self.asset_bucket, asset_key, &image.bytes, &image.content_type)
            .await;
        if let Err(err) = self.icon_staging.remove(staged_key).await {
            warn!(icon_id, error = %err, "releasing staged icon failed");
        }
        match upload {
            Ok(()) => {
                debug!(icon_id, asset_key, backend = self.assets.backend(), "icon stored");
                true
            }
            Err(err) => {
                warn!(icon_id, asset_key, error = %err, "icon upload failed");
                false
            }
        }
    }

    pub async fn persist_item(&self, item: &CatalogItem) -> PersistOutcome {
        let params = [
            json!(item.id),
            json!(item.name),
            json!(item.category_name),
            json!(item.group_name),
            decimal_param(item.weekly_average_price),
            optional_text(item.icon_id.as_deref()),
            optional_text(item.icon_asset_key()),
            optional_text(item.date_created.as_deref()),
            optional_text(item.date_updated.as_deref()),
        ];
        match self.store.execute(UPSERT_ITEM, &params).await {
            Ok(()) if self.store_ids.contains(&item.id) => PersistOutcome::Updated,
            Ok(()) => PersistOutcome::Inserted,
            Err(err) => {
                warn!(item_id = %item.id, error = %err, "item upsert failed");
                PersistOutcome::Failed
            }
        }
    }

    /// Backfill when the item has no stored history, then append the current
    /// observation when it is newer than anything stored.
    pub async fn sync_history(&self, item_id: &str, current: Option<&CurrentPrice>) -> HistoryOutcome {
        let latest = match self.latest_history(item_id).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(item_id, error = %err, "reading latest history failed");
                return HistoryOutcome::Failed { stage: "latest" };
            }
        };

        let (latest, backfill) = match latest {
            Some(latest) => (Some(latest), None),
            None => match self.feed.fetch_item_history(item_id).await {
                Ok(rows) => {
                    let (stats, newest) = self.backfill(item_id, rows).await;
                    (newest, Some(stats))
                }
                Err(err) => {
                    // Appending now would make the item look backfilled next run.
                    warn!(item_id, error = %err, "history backfill fetch failed");
                    return HistoryOutcome::Failed { stage: "backfill" };
                }
            },
        };

        let append = match current {
            None => AppendOutcome::NoCurrentPrice,
            Some(price) if latest.as_deref().is_some_and(|l| price.date_updated.as_str() <= l) => {
                AppendOutcome::UpToDate
            }
            Some(price) => {
                let record =
                    HistoryRecord::observed(item_id, price.estimated_price, &price.date_updated);
                match self.insert_history(&record).await {
                    Ok(()) => {
                        debug!(item_id, date_updated = %record.date_updated, "appended current price");
                        AppendOutcome::Appended
                    }
                    Err(err) => {
                        warn!(item_id, error = %err, "appending current price failed");
                        AppendOutcome::Failed
                    }
                }
            }
        };

        HistoryOutcome::Synced { backfill, append }
    }

    async fn latest_history(&self, item_id: &str) -> Result<Option<String>, StorageError> {
        let rows = self
            .store
            .query_rows(SELECT_LATEST_HISTORY, &[json!(item_id)])
            .await?;
        Ok(rows.first().and_then(|row| row_text(row, "latest")))
    }

    /// Insert every distinct observation, oldest first. Returns the newest
    /// timestamp actually stored.
    async fn backfill(&self, item_id: &str, rows: Vec<RawHistoryRow>) -> (BackfillStats, Option<String>) {
        let mut stats = BackfillStats::default();
        let mut distinct: BTreeMap<String, HistoryRecord> = BTreeMap::new();
        for row in rows {
            match row.into_record(item_id) {
                Ok(record) => {
                    distinct.entry(record.date_updated.clone()).or_insert(record);
                }
                Err(reason) => {
                    debug!(item_id, %reason, "skipping history row");
                    stats.skipped_rows += 1;
                }
            }
        }

        let mut newest = None;
        for (date_updated, record) in distinct {
            match self.insert_history(&record).await {
                Ok(()) => {
                    stats.inserted += 1;
                    newest = Some(date_updated);
                }
                Err(err) => {
                    warn!(item_id, %date_updated, error = %err, "history insert failed");
                    stats.failed_rows += 1;
                }
            }
        }
        if stats.inserted > 0 || stats.skipped_rows > 0 {
            info!(item_id, inserted = stats.inserted, skipped = stats.skipped_rows, "history backfilled");
        }
        (stats, newest)
    }

    async fn insert_history(&self, record: &HistoryRecord) -> Result<(), StorageError> {
        let params = [
            json!(record.item_id),
            decimal_param(Some(record.price)),
            json!(record.week),
            json!(record.year),
            json!(record.date_created),
            json!(record.date_updated),
        ];
        self.store.execute(INSERT_HISTORY, &params).await
    }
}

fn decimal_param(value: Option<Decimal>) -> Value {
    value
        .and_then(|d| d.to_f64())
        .map(Value::from)
        .unwrap_or(Value::Null)
}

fn optional_text(value: Option<&str>) -> Value {
    value.map(|v| json!(v)).unwrap_or(Value::Null)
}
