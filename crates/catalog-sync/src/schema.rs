//! Table layout and the statements the sync issues against it.

use catalog_storage::{RelationalStore, StorageError};

pub const CREATE_ITEMS_TABLE: &str = "CREATE TABLE IF NOT EXISTS items (
    item_id TEXT PRIMARY KEY,
    name TEXT,
    category_name TEXT,
    group_name TEXT,
    weekly_average_price REAL,
    icon_id TEXT,
    icon_asset_key TEXT,
    date_created TEXT,
    date_updated TEXT
)";

pub const CREATE_ITEM_HISTORY_TABLE: &str = "CREATE TABLE IF NOT EXISTS item_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL,
    price REAL NOT NULL,
    week TEXT NOT NULL,
    year TEXT NOT NULL,
    date_created TEXT NOT NULL,
    date_updated TEXT NOT NULL,
    UNIQUE (item_id, date_updated)
)";

pub const CREATE_ITEM_HISTORY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_item_history_item_id ON item_history (item_id)";

pub const SELECT_ALL_ITEMS: &str = "SELECT item_id, name, category_name, group_name, \
    weekly_average_price, icon_id, icon_asset_key, date_created, date_updated FROM items";

/// Insert or update keyed on `item_id`. A stored `date_created` and a stored
/// icon key are never replaced by NULL.
pub const UPSERT_ITEM: &str = "INSERT INTO items (item_id, name, category_name, group_name, \
    weekly_average_price, icon_id, icon_asset_key, date_created, date_updated)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(item_id) DO UPDATE SET
    name = excluded.name,
    category_name = excluded.category_name,
    group_name = excluded.group_name,
    weekly_average_price = excluded.weekly_average_price,
    icon_id = excluded.icon_id,
    icon_asset_key = COALESCE(excluded.icon_asset_key, items.icon_asset_key),
    date_created = COALESCE(items.date_created, excluded.date_created),
    date_updated = excluded.date_updated";

pub const SELECT_LATEST_HISTORY: &str =
    "SELECT MAX(date_updated) AS latest FROM item_history WHERE item_id = ?";

pub const INSERT_HISTORY: &str = "INSERT INTO item_history \
    (item_id, price, week, year, date_created, date_updated)
VALUES (?, ?, ?, ?, ?, ?)
ON CONFLICT(item_id, date_updated) DO NOTHING";

pub const PING: &str = "SELECT 1 AS ok";

pub const SCHEMA_STATEMENTS: [&str; 3] = [
    CREATE_ITEMS_TABLE,
    CREATE_ITEM_HISTORY_TABLE,
    CREATE_ITEM_HISTORY_INDEX,
];

pub async fn ensure_schema(store: &dyn RelationalStore) -> Result<(), StorageError> {
    for statement in SCHEMA_STATEMENTS {
        store.execute(statement, &[]).await?;
    }
    Ok(())
}
