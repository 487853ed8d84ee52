use std::path::PathBuf;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub key: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// A directory of assets addressed by slash-separated keys.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a partially written file.
#[derive(Debug, Clone)]
pub struct LocalAssetDir {
    root: PathBuf,
}

impl LocalAssetDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                bail!("invalid asset key {key:?}");
            }
            if sanitize_key_segment(segment) != segment {
                bail!("asset key {key:?} contains unsupported characters");
            }
            path.push(segment);
        }
        Ok(path)
    }

    pub async fn contains(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking asset {}", path.display()))
    }

    /// Store `bytes` under `key`. An existing file under the same key is kept.
    pub async fn store_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredAsset> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.path_for(key)?;

        if tokio::fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking asset {}", absolute_path.display()))?
        {
            return Ok(StoredAsset {
                key: key.to_string(),
                absolute_path,
                content_hash,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let parent = absolute_path
            .parent()
            .context("asset path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating asset directory {}", parent.display()))?;

        let tmp_path = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, bytes)
            .await
            .with_context(|| format!("writing temp asset {}", tmp_path.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp_path, &absolute_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err)
                .with_context(|| format!("moving asset into place {}", absolute_path.display()));
        }

        Ok(StoredAsset {
            key: key.to_string(),
            absolute_path,
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }

    pub async fn read(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading asset {}", path.display()))
    }

    /// Returns whether a file was removed.
    pub async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing asset {}", path.display())),
        }
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_key_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
