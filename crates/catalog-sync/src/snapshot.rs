use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use catalog_core::{CatalogItem, ItemId};
use tracing::warn;

/// The flat-file copy of the last merged catalog.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist. Undecodable rows and rows
    /// without an id are skipped.
    pub async fn read(&self) -> Result<Option<BTreeMap<ItemId, CatalogItem>>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes.as_slice());
        let mut items = BTreeMap::new();
        for (idx, row) in reader.deserialize::<CatalogItem>().enumerate() {
            let mut item = match row {
                Ok(item) => item,
                Err(err) => {
                    warn!(path = %self.path.display(), row = idx + 1, error = %err, "skipping snapshot row");
                    continue;
                }
            };
            if item.id.trim().is_empty() {
                continue;
            }
            item.refresh_icon_flag();
            items.insert(item.id.clone(), item);
        }
        Ok(Some(items))
    }

    /// Replace the snapshot with `items`. An empty mapping leaves the existing
    /// file alone and returns `false`.
    pub async fn write(&self, items: &BTreeMap<ItemId, CatalogItem>) -> Result<bool> {
        if items.is_empty() {
            return Ok(false);
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        for item in items.values() {
            writer
                .serialize(item)
                .with_context(|| format!("serializing snapshot row {}", item.id))?;
        }
        let bytes = writer.into_inner().context("flushing snapshot csv")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err).with_context(|| format!("replacing {}", self.path.display()));
        }
        Ok(true)
    }
}
