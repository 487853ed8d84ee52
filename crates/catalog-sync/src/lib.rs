//! Incremental catalog reconciliation: load the previous catalog, merge the
//! fetched item pages into it and propagate the result to icons, the
//! relational store, price history and the snapshot file.

pub mod config;
pub mod loader;
pub mod merge;
pub mod paginate;
pub mod pipeline;
pub mod propagate;
pub mod report;
pub mod schema;
pub mod snapshot;

pub use config::{AssetBackend, ConfigError, StoreBackend, SyncConfig};
pub use loader::{PriorState, StateLoader, StateOrigin};
pub use merge::{merge, MergeCounts, MergeEngine, MergeOutcome};
pub use paginate::{fetch_and_merge, PaginationEnd, PaginationReport};
pub use pipeline::SyncPipeline;
pub use propagate::{icon_asset_key, PersistedSummary, PropagationDriver};
pub use report::{build_item_tree, export_item_tree, write_run_report, SyncRunSummary};
pub use snapshot::SnapshotFile;

pub const CRATE_NAME: &str = "catalog-sync";
