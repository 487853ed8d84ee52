use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;

use crate::local::LocalAssetDir;
use crate::{HttpFetcher, StorageError};

const R2_API: &str = "cloudflare-r2";

/// Durable object storage addressed by bucket and key.
#[async_trait]
pub trait AssetStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// Cloudflare R2 through the account-scoped REST object endpoint.
#[derive(Debug, Clone)]
pub struct R2AssetStore {
    http: Arc<HttpFetcher>,
    api_base: String,
    account_id: String,
    api_token: String,
}

impl R2AssetStore {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_base: &str,
        account_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            account_id: account_id.into(),
            api_token: api_token.into(),
        }
    }

    pub fn object_url(&self, bucket: &str, key: &str) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|err| StorageError::InvalidLocation(format!("{}: {err}", self.api_base)))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidLocation(self.api_base.clone()))?
            .pop_if_empty()
            .extend(["accounts", self.account_id.as_str(), "r2", "buckets", bucket, "objects"])
            .extend(key.split('/'));
        Ok(url)
    }
}

#[async_trait]
impl AssetStore for R2AssetStore {
    fn backend(&self) -> &'static str {
        "r2"
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StorageError> {
        let url = self.object_url(bucket, key)?;
        self.http
            .send(R2_API, url.as_str(), |client| {
                client
                    .put(url.clone())
                    .bearer_auth(&self.api_token)
                    .header(CONTENT_TYPE, content_type)
                    .body(bytes.to_vec())
            })
            .await?;
        Ok(())
    }
}

/// Buckets as subdirectories of a local root. Used for offline runs.
#[derive(Debug, Clone)]
pub struct DirectoryAssetStore {
    dir: LocalAssetDir,
}

impl DirectoryAssetStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            dir: LocalAssetDir::new(root),
        }
    }

    pub fn dir(&self) -> &LocalAssetDir {
        &self.dir
    }
}

#[async_trait]
impl AssetStore for DirectoryAssetStore {
    fn backend(&self) -> &'static str {
        "directory"
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let stored = self.dir.store_bytes(&format!("{bucket}/{key}"), bytes).await?;
        tracing::debug!(
            key = %stored.key,
            sha256 = %stored.content_hash,
            deduplicated = stored.deduplicated,
            "asset stored"
        );
        Ok(())
    }
}
