use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use catalog_core::CatalogItem;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::loader::StateOrigin;
use crate::merge::MergeCounts;
use crate::paginate::PaginationReport;
use crate::propagate::PersistedSummary;
use crate::snapshot::SnapshotFile;

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed: String,
    pub store_backend: String,
    pub asset_backend: String,
    pub schema_ready: bool,
    pub prior_origin: StateOrigin,
    pub prior_items: usize,
    pub pagination: PaginationReport,
    pub merge: MergeCounts,
    pub current_prices: Option<usize>,
    pub persisted: PersistedSummary,
    pub catalog_items: usize,
    pub snapshot_written: bool,
    pub reports_dir: String,
}

impl SyncRunSummary {
    pub fn render_lines(&self) -> Vec<String> {
        let p = &self.persisted;
        vec![
            format!("Run {} ({} -> {})", self.run_id, self.started_at, self.finished_at),
            format!(
                "Prior state: {} items from {:?}; store {}, assets {}",
                self.prior_items, self.prior_origin, self.store_backend, self.asset_backend
            ),
            format!(
                "Item feed: {} pages, {} rows, ended with {:?}",
                self.pagination.pages_merged, self.pagination.rows_seen, self.pagination.end
            ),
            format!(
                "Merge: {} new, {} updated, {} unchanged, {} not in feed, {} rows without id",
                self.merge.new,
                self.merge.updated,
                self.merge.unchanged,
                self.merge.not_in_feed,
                self.merge.skipped_missing_id
            ),
            format!(
                "Items: {} inserted, {} updated, {} failed",
                p.catalog.inserted, p.catalog.updated, p.catalog.failed
            ),
            format!(
                "Icons: {} stored, {} already present, {} without icon, {} failed",
                p.icons.stored, p.icons.already_present, p.icons.no_icon, p.icons.failed
            ),
            format!(
                "History: {} records backfilled for {} items ({} rows skipped), {} appended, {} up to date, {} without current price, {} failed",
                p.history.backfilled_records,
                p.history.backfilled_items,
                p.history.skipped_rows,
                p.history.appended,
                p.history.up_to_date,
                p.history.no_current_price,
                p.history.failed + p.history.failed_records
            ),
            format!(
                "Snapshot: {} ({} items)",
                if self.snapshot_written { "written" } else { "not written" },
                self.catalog_items
            ),
        ]
    }
}

/// Write `summary.json` and `summary.md` under `<reports_root>/<run_id>/`.
pub async fn write_run_report(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    let brief = format!(
        "# Catalog Sync\n\n{}\n",
        summary
            .render_lines()
            .iter()
            .map(|line| format!("- {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(run_dir.join("summary.md"), brief)
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeLeaf {
    pub item_id: String,
    pub icon_key: Option<String>,
}

/// category -> group -> item name -> leaf
pub type ItemTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, TreeLeaf>>>;

const UNCATEGORIZED: &str = "Uncategorized";

pub fn build_item_tree<'a>(items: impl IntoIterator<Item = &'a CatalogItem>) -> ItemTree {
    let mut tree = ItemTree::new();
    for item in items {
        let label = |text: &str| {
            if text.trim().is_empty() {
                UNCATEGORIZED.to_string()
            } else {
                text.trim().to_string()
            }
        };
        let name = if item.name.trim().is_empty() {
            item.id.clone()
        } else {
            item.name.trim().to_string()
        };
        let group = tree
            .entry(label(&item.category_name))
            .or_default()
            .entry(label(&item.group_name))
            .or_default();
        // Same-named items in one group are told apart by id.
        let key = match group.get(&name) {
            Some(existing) if existing.item_id != item.id => {
                warn!(item_id = %item.id, other_id = %existing.item_id, name = %name, "duplicate item name in group");
                format!("{name} ({})", item.id)
            }
            _ => name,
        };
        group.insert(
            key,
            TreeLeaf {
                item_id: item.id.clone(),
                icon_key: item.icon_asset_key().map(ToString::to_string),
            },
        );
    }
    tree
}

/// Build the item tree from the snapshot file and write it as JSON. Returns
/// the number of items exported.
pub async fn export_item_tree(snapshot: &SnapshotFile, out: &Path) -> Result<usize> {
    let items = snapshot
        .read()
        .await?
        .with_context(|| format!("snapshot {} does not exist", snapshot.path().display()))?;
    let tree = build_item_tree(items.values());
    let json = serde_json::to_vec_pretty(&tree).context("serializing item tree")?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(out, json)
        .await
        .with_context(|| format!("writing {}", out.display()))?;
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use catalog_core::RawItemRecord;

    use super::*;
    use crate::paginate::PaginationEnd;

    fn item(id: &str, name: &str, category: &str, group: &str) -> CatalogItem {
        CatalogItem::from_raw(
            id,
            &RawItemRecord {
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                category_name: Some(category.to_string()),
                group_name: Some(group.to_string()),
                ..RawItemRecord::default()
            },
        )
    }

    #[test]
    fn tree_groups_by_category_then_group() {
        let mut tritanium = item("100", "Tritanium", "Material", "Minerals");
        tritanium.mark_icon_stored("icons/tritanium.png");
        let items = [
            tritanium,
            item("200", "Pyerite", "Material", "Minerals"),
            item("400", "Heron", "Ship", ""),
        ];

        let tree = build_item_tree(items.iter());

        let minerals = &tree["Material"]["Minerals"];
        assert_eq!(minerals.len(), 2);
        assert_eq!(minerals["Tritanium"].icon_key.as_deref(), Some("icons/tritanium.png"));
        assert_eq!(minerals["Pyerite"].icon_key, None);
        assert_eq!(tree["Ship"][UNCATEGORIZED]["Heron"].item_id, "400");
    }

    #[test]
    fn same_named_items_in_one_group_both_survive() {
        let items = [
            item("10", "Blueprint", "Material", "Minerals"),
            item("11", "Blueprint", "Material", "Minerals"),
            item("12", "Blueprint", "Material", "Salvage"),
        ];

        let tree = build_item_tree(items.iter());

        let minerals = &tree["Material"]["Minerals"];
        assert_eq!(minerals.len(), 2);
        assert_eq!(minerals["Blueprint"].item_id, "10");
        assert_eq!(minerals["Blueprint (11)"].item_id, "11");
        assert_eq!(tree["Material"]["Salvage"]["Blueprint"].item_id, "12");
    }

    #[tokio::test]
    async fn run_report_lands_under_run_id() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            feed: "fixture".to_string(),
            store_backend: "sqlite".to_string(),
            asset_backend: "directory".to_string(),
            schema_ready: true,
            prior_origin: StateOrigin::Empty,
            prior_items: 0,
            pagination: PaginationReport {
                pages_merged: 1,
                rows_seen: 1,
                end: PaginationEnd::EmptyPage { page: 2 },
            },
            merge: MergeCounts::default(),
            current_prices: Some(0),
            persisted: PersistedSummary::default(),
            catalog_items: 1,
            snapshot_written: true,
            reports_dir: tmp.path().display().to_string(),
        };

        let dir = write_run_report(tmp.path(), &summary).await.expect("report");
        assert_eq!(dir, tmp.path().join(summary.run_id.to_string()));

        let json: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.join("summary.json")).expect("summary.json"),
        )
        .expect("json");
        assert_eq!(json["pagination"]["end"]["reason"], "empty_page");
        assert_eq!(json["prior_origin"], "empty");
        assert!(std::fs::read_to_string(dir.join("summary.md"))
            .expect("summary.md")
            .contains("Snapshot: written"));
    }
}
