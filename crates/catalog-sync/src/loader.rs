use std::collections::{BTreeMap, BTreeSet};

use catalog_core::{non_empty, parse_price, CatalogItem, ItemId};
use catalog_storage::{row_f64, row_text, RelationalStore, Row, StorageError};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::schema::SELECT_ALL_ITEMS;
use crate::snapshot::SnapshotFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateOrigin {
    Store,
    Snapshot,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriorState {
    pub items: BTreeMap<ItemId, CatalogItem>,
    pub origin: StateOrigin,
    /// Ids the relational store already held when the run started.
    pub store_ids: BTreeSet<ItemId>,
}

impl PriorState {
    fn empty() -> Self {
        Self {
            items: BTreeMap::new(),
            origin: StateOrigin::Empty,
            store_ids: BTreeSet::new(),
        }
    }
}

/// Reads the previous run's catalog: the store first, then the snapshot file.
/// Never fails; every problem degrades to the next source with a warning.
pub struct StateLoader<'a> {
    store: &'a dyn RelationalStore,
    snapshot: &'a SnapshotFile,
}

impl<'a> StateLoader<'a> {
    pub fn new(store: &'a dyn RelationalStore, snapshot: &'a SnapshotFile) -> Self {
        Self { store, snapshot }
    }

    pub async fn load_prior_state(&self) -> PriorState {
        match self.load_from_store().await {
            Ok(items) if !items.is_empty() => {
                info!(backend = self.store.backend(), items = items.len(), "loaded prior state from store");
                let store_ids = items.keys().cloned().collect();
                return PriorState {
                    items,
                    origin: StateOrigin::Store,
                    store_ids,
                };
            }
            Ok(_) => info!(backend = self.store.backend(), "store holds no items; trying snapshot"),
            Err(err) => warn!(backend = self.store.backend(), error = %err, "store unavailable; trying snapshot"),
        }

        match self.snapshot.read().await {
            Ok(Some(items)) if !items.is_empty() => {
                info!(path = %self.snapshot.path().display(), items = items.len(), "loaded prior state from snapshot");
                PriorState {
                    items,
                    origin: StateOrigin::Snapshot,
                    store_ids: BTreeSet::new(),
                }
            }
            Ok(_) => {
                info!(path = %self.snapshot.path().display(), "no snapshot; starting from empty");
                PriorState::empty()
            }
            Err(err) => {
                warn!(error = %err, "snapshot unreadable; starting from empty");
                PriorState::empty()
            }
        }
    }

    async fn load_from_store(&self) -> Result<BTreeMap<ItemId, CatalogItem>, StorageError> {
        let rows = self.store.query_rows(SELECT_ALL_ITEMS, &[]).await?;
        Ok(rows
            .iter()
            .filter_map(item_from_row)
            .map(|item| (item.id.clone(), item))
            .collect())
    }
}

fn item_from_row(row: &Row) -> Option<CatalogItem> {
    let id = row_text(row, "item_id")?;
    let weekly_average_price = row_f64(row, "weekly_average_price")
        .and_then(Decimal::from_f64)
        .or_else(|| row_text(row, "weekly_average_price").and_then(|t| parse_price(&t)));
    let mut item = CatalogItem {
        id,
        name: row_text(row, "name").unwrap_or_default(),
        category_name: row_text(row, "category_name").unwrap_or_default(),
        group_name: row_text(row, "group_name").unwrap_or_default(),
        weekly_average_price,
        icon_id: non_empty(row_text(row, "icon_id").as_deref()),
        date_created: row_text(row, "date_created"),
        date_updated: row_text(row, "date_updated"),
        icon_asset_key: row_text(row, "icon_asset_key"),
        icon_downloaded: false,
    };
    item.refresh_icon_flag();
    Some(item)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use catalog_storage::{QueryResponse, SqliteStore};
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};

    use super::*;
    use crate::schema::{ensure_schema, UPSERT_ITEM};

    struct UnreachableStore;

    #[async_trait]
    impl RelationalStore for UnreachableStore {
        fn backend(&self) -> &'static str {
            "unreachable"
        }

        async fn query(&self, _sql: &str, _params: &[Value]) -> Result<QueryResponse, StorageError> {
            Ok(QueryResponse {
                success: false,
                rows: Vec::new(),
                errors: vec!["connection refused".to_string()],
            })
        }
    }

    async fn seeded_snapshot(dir: &std::path::Path) -> SnapshotFile {
        let snapshot = SnapshotFile::new(dir.join("item_lists.csv"));
        std::fs::write(
            snapshot.path(),
            "id,name,category_name,group_name,weekly_average_price,icon_id,date_created,date_updated,icon_asset_key\n\
             7,Sword,Weapon,Blades,10.5,77,2023-01-01T00:00:00+00:00,2024-01-01T00:00:00+00:00,icons/77.png\n",
        )
        .expect("seed snapshot");
        snapshot
    }

    #[tokio::test]
    async fn prefers_store_rows() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let snapshot = seeded_snapshot(tmp.path()).await;
        let store = SqliteStore::in_memory().await.expect("sqlite");
        ensure_schema(&store).await.expect("schema");
        store
            .execute(
                UPSERT_ITEM,
                &[
                    json!("1"),
                    json!("Shield"),
                    json!("Armor"),
                    json!("Plates"),
                    json!(12.25),
                    Value::Null,
                    Value::Null,
                    json!("2023-02-01T00:00:00+00:00"),
                    json!("2024-01-02T00:00:00+00:00"),
                ],
            )
            .await
            .expect("seed store");

        let state = StateLoader::new(&store, &snapshot).load_prior_state().await;
        assert_eq!(state.origin, StateOrigin::Store);
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items["1"].weekly_average_price, Some(dec!(12.25)));
        assert_eq!(state.items["1"].icon_id, None);
        assert!(state.store_ids.contains("1"));
    }

    #[tokio::test]
    async fn falls_back_to_snapshot_when_store_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let snapshot = seeded_snapshot(tmp.path()).await;

        let state = StateLoader::new(&UnreachableStore, &snapshot)
            .load_prior_state()
            .await;
        assert_eq!(state.origin, StateOrigin::Snapshot);
        assert!(state.items["7"].icon_downloaded);
        assert!(state.store_ids.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_snapshot_when_store_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let snapshot = seeded_snapshot(tmp.path()).await;
        let store = SqliteStore::in_memory().await.expect("sqlite");
        ensure_schema(&store).await.expect("schema");

        let state = StateLoader::new(&store, &snapshot).load_prior_state().await;
        assert_eq!(state.origin, StateOrigin::Snapshot);
        assert_eq!(state.items.len(), 1);
    }

    #[tokio::test]
    async fn starts_empty_when_nothing_is_available() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let snapshot = SnapshotFile::new(tmp.path().join("absent.csv"));

        let state = StateLoader::new(&UnreachableStore, &snapshot)
            .load_prior_state()
            .await;
        assert_eq!(state.origin, StateOrigin::Empty);
        assert!(state.items.is_empty());
    }
}
