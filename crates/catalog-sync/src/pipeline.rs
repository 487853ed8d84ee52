use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use catalog_feeds::{CatalogFeed, EchoesApi};
use catalog_storage::{
    AssetStore, D1Store, DirectoryAssetStore, HttpFetcher, LocalAssetDir, R2AssetStore,
    RelationalStore, SqliteStore,
};
use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{AssetBackend, StoreBackend, SyncConfig};
use crate::loader::StateLoader;
use crate::merge::MergeEngine;
use crate::paginate::fetch_and_merge;
use crate::propagate::PropagationDriver;
use crate::report::{write_run_report, SyncRunSummary};
use crate::schema::{ensure_schema, PING};
use crate::snapshot::SnapshotFile;

pub struct SyncPipeline {
    config: SyncConfig,
    feed: Arc<dyn CatalogFeed>,
    store: Arc<dyn RelationalStore>,
    assets: Arc<dyn AssetStore>,
    icon_staging: LocalAssetDir,
}

impl SyncPipeline {
    /// Wire the configured backends and the upstream HTTP feed.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let store = build_store(&config, &http).await?;
        let assets = build_assets(&config, &http)?;
        let feed: Arc<dyn CatalogFeed> =
            Arc::new(EchoesApi::new(Arc::clone(&http), config.endpoints.clone()));
        Ok(Self::with_components(config, feed, store, assets))
    }

    pub fn with_components(
        config: SyncConfig,
        feed: Arc<dyn CatalogFeed>,
        store: Arc<dyn RelationalStore>,
        assets: Arc<dyn AssetStore>,
    ) -> Self {
        let icon_staging = LocalAssetDir::new(config.icon_staging_dir.clone());
        Self {
            config,
            feed,
            store,
            assets,
            icon_staging,
        }
    }

    pub fn with_feed(mut self, feed: Arc<dyn CatalogFeed>) -> Self {
        self.feed = feed;
        self
    }

    pub fn store(&self) -> &dyn RelationalStore {
        self.store.as_ref()
    }

    pub async fn migrate(&self) -> Result<()> {
        ensure_schema(self.store.as_ref())
            .await
            .with_context(|| format!("creating tables on {}", self.store.backend()))
    }

    /// Round-trip a trivial statement through the store.
    pub async fn check(&self) -> Result<()> {
        let rows = self
            .store
            .query_rows(PING, &[])
            .await
            .with_context(|| format!("querying {}", self.store.backend()))?;
        if rows.is_empty() {
            bail!("{} answered the ping with no rows", self.store.backend());
        }
        Ok(())
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, feed = self.feed.feed_id());
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let store = self.store.as_ref();
        let feed = self.feed.as_ref();

        let schema_ready = match ensure_schema(store).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "schema bootstrap failed; continuing");
                false
            }
        };

        let snapshot = SnapshotFile::new(self.config.snapshot_path.clone());
        let prior = StateLoader::new(store, &snapshot).load_prior_state().await;
        let prior_origin = prior.origin;
        let prior_items = prior.items.len();

        let mut engine = MergeEngine::new(prior.items);
        let pagination = fetch_and_merge(feed, &mut engine, self.config.max_pages).await;
        let mut outcome = engine.finish();
        let merge = outcome.counts();

        let (current_prices, current_price_count) = match feed.fetch_current_prices().await {
            Ok(prices) => {
                let count = prices.len();
                (prices, Some(count))
            }
            Err(err) => {
                warn!(error = %err, "current price feed unavailable; skipping appends");
                (BTreeMap::new(), None)
            }
        };

        let driver = PropagationDriver {
            feed,
            store,
            assets: self.assets.as_ref(),
            icon_staging: &self.icon_staging,
            asset_bucket: &self.config.asset_bucket,
            store_ids: &prior.store_ids,
        };
        let persisted = driver
            .propagate(
                &mut outcome.items,
                &outcome.classifications,
                &outcome.processing_order,
                &current_prices,
            )
            .await;

        let snapshot_written = match snapshot.write(&outcome.items).await {
            Ok(written) => written,
            Err(err) => {
                warn!(error = %err, "writing snapshot failed");
                false
            }
        };

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            feed: feed.feed_id().to_string(),
            store_backend: store.backend().to_string(),
            asset_backend: self.assets.backend().to_string(),
            schema_ready,
            prior_origin,
            prior_items,
            pagination,
            merge,
            current_prices: current_price_count,
            persisted,
            catalog_items: outcome.items.len(),
            snapshot_written,
            reports_dir: self
                .config
                .reports_dir
                .join(run_id.to_string())
                .display()
                .to_string(),
        };

        if let Err(err) = write_run_report(&self.config.reports_dir, &summary).await {
            warn!(error = %err, "writing run report failed");
        }
        info!(
            items = summary.catalog_items,
            failures = summary.persisted.failures(),
            "sync run finished"
        );
        Ok(summary)
    }
}

async fn build_store(config: &SyncConfig, http: &Arc<HttpFetcher>) -> Result<Arc<dyn RelationalStore>> {
    match &config.store {
        StoreBackend::Sqlite { url } => {
            let store = SqliteStore::connect(url)
                .await
                .with_context(|| format!("opening {url}"))?;
            Ok(Arc::new(store))
        }
        StoreBackend::D1 { database_id } => {
            let cloudflare = config
                .cloudflare
                .as_ref()
                .context("d1 store configured without cloudflare credentials")?;
            Ok(Arc::new(D1Store::new(
                Arc::clone(http),
                &cloudflare.api_base,
                &cloudflare.account_id,
                database_id,
                cloudflare.api_token.clone(),
            )))
        }
    }
}

fn build_assets(config: &SyncConfig, http: &Arc<HttpFetcher>) -> Result<Arc<dyn AssetStore>> {
    match &config.assets {
        AssetBackend::Directory { root } => Ok(Arc::new(DirectoryAssetStore::new(root.clone()))),
        AssetBackend::R2 => {
            let cloudflare = config
                .cloudflare
                .as_ref()
                .context("r2 assets configured without cloudflare credentials")?;
            Ok(Arc::new(R2AssetStore::new(
                Arc::clone(http),
                &cloudflare.api_base,
                cloudflare.account_id.clone(),
                cloudflare.api_token.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn local_backends_migrate_and_answer_checks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let vars: HashMap<&str, String> = HashMap::from([
            ("CATALOG_STORE", "sqlite::memory:".to_string()),
            (
                "CATALOG_ASSETS",
                format!("dir:{}", tmp.path().join("assets").display()),
            ),
        ]);
        let config = SyncConfig::from_lookup(|name| vars.get(name).cloned()).expect("config");

        let pipeline = SyncPipeline::new(config).await.expect("pipeline");
        pipeline.migrate().await.expect("migrate");
        pipeline.check().await.expect("check");
        assert_eq!(pipeline.store().backend(), "sqlite");
    }
}
