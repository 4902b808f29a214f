//! Content-addressed blob store.
//!
//! Blobs live under `blobs/<algorithm>/<hex>`; per-blob info and labels are
//! indexed in memory and persisted to `index.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::Digest;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::platform::Platform;
use super::reference::ImageReference;

/// Label prefix recording which repositories a blob was fetched from.
pub const DISTRIBUTION_SOURCE_LABEL: &str = "containerd.io/distribution.source";

/// Reference to a blob by media type, digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            platform: None,
        }
    }

    /// Descriptor for `data` as it would be stored.
    pub fn for_data(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, Digest::from_bytes(data), data.len() as u64)
    }
}

/// Stored blob metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Blob storage consulted and populated by image resolution.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Info for a stored blob, `NotFound` when absent.
    async fn info(&self, digest: &Digest) -> Result<ContentInfo>;

    async fn read(&self, digest: &Digest) -> Result<Bytes>;

    /// Store `data` under `desc`, verifying its size and digest first.
    /// Ingesting a blob that is already present is a no-op.
    async fn ingest(&self, desc: &Descriptor, data: Bytes) -> Result<()>;

    /// Merge `labels` into a blob's labels.
    async fn update_labels(
        &self,
        digest: &Digest,
        labels: HashMap<String, String>,
    ) -> Result<ContentInfo>;

    async fn exists(&self, digest: &Digest) -> bool {
        self.info(digest).await.is_ok()
    }
}

/// Label key recording the source repositories on `registry`.
pub fn distribution_source_key(registry: &str) -> String {
    format!("{}.{}", DISTRIBUTION_SOURCE_LABEL, registry)
}

/// Whether a blob's labels record `reference`'s repository as a source.
pub fn has_source(info: &ContentInfo, reference: &ImageReference) -> bool {
    info.labels
        .get(&distribution_source_key(&reference.registry))
        .map(|repos| repos.split(',').any(|r| r == reference.repository))
        .unwrap_or(false)
}

/// Append `repository` to a comma-joined source list, returning `None` if it
/// is already present.
pub fn append_source(existing: Option<&str>, repository: &str) -> Option<String> {
    match existing {
        None | Some("") => Some(repository.to_string()),
        Some(list) if list.split(',').any(|r| r == repository) => None,
        Some(list) => Some(format!("{},{}", list, repository)),
    }
}

/// Verify `data` against `desc`.
pub fn verify(desc: &Descriptor, data: &[u8]) -> Result<()> {
    if data.len() as u64 != desc.size {
        return Err(BuildError::DigestMismatch {
            expected: format!("{} ({} bytes)", desc.digest, desc.size),
            actual: format!("{} bytes", data.len()),
        });
    }
    if !desc.digest.verify(data) {
        return Err(BuildError::DigestMismatch {
            expected: desc.digest.to_string(),
            actual: Digest::from_bytes(data).to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContentIndex {
    blobs: Vec<ContentInfo>,
}

/// Directory-backed content store.
#[derive(Clone)]
pub struct LocalContentStore {
    root: PathBuf,
    index: Arc<RwLock<HashMap<Digest, ContentInfo>>>,
}

impl LocalContentStore {
    /// Open the store at `root`, creating it if needed.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs")).map_err(|e| {
            BuildError::CacheError(format!(
                "Failed to create content store {}: {}",
                root.display(),
                e
            ))
        })?;

        let index_path = root.join("index.json");
        let mut index = HashMap::new();
        if index_path.exists() {
            let data = std::fs::read_to_string(&index_path)?;
            let parsed: ContentIndex = serde_json::from_str(&data)?;
            for info in parsed.blobs {
                index.insert(info.digest.clone(), info);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    pub async fn list(&self) -> Vec<ContentInfo> {
        let mut blobs: Vec<_> = self.index.read().await.values().cloned().collect();
        blobs.sort_by(|a, b| a.digest.cmp(&b.digest));
        blobs
    }

    pub async fn total_size(&self) -> u64 {
        self.index.read().await.values().map(|i| i.size).sum()
    }

    async fn save(&self, index: &HashMap<Digest, ContentInfo>) -> Result<()> {
        let data = serde_json::to_string_pretty(&ContentIndex {
            blobs: index.values().cloned().collect(),
        })?;
        let index_path = self.root.join("index.json");
        let tmp_path = self.root.join("index.json.tmp");
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &index_path)
            .await
            .map_err(|e| {
                BuildError::CacheError(format!(
                    "Failed to replace content index {}: {}",
                    index_path.display(),
                    e
                ))
            })
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        self.index
            .read()
            .await
            .get(digest)
            .cloned()
            .ok_or_else(|| BuildError::NotFound(digest.to_string()))
    }

    async fn read(&self, digest: &Digest) -> Result<Bytes> {
        if !self.index.read().await.contains_key(digest) {
            return Err(BuildError::NotFound(digest.to_string()));
        }
        let data = tokio::fs::read(self.blob_path(digest)).await.map_err(|e| {
            BuildError::CacheError(format!("Failed to read blob {}: {}", digest, e))
        })?;
        Ok(Bytes::from(data))
    }

    async fn ingest(&self, desc: &Descriptor, data: Bytes) -> Result<()> {
        verify(desc, &data)?;

        let mut index = self.index.write().await;
        if index.contains_key(&desc.digest) {
            return Ok(());
        }

        let path = self.blob_path(&desc.digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("ingest");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        index.insert(
            desc.digest.clone(),
            ContentInfo {
                digest: desc.digest.clone(),
                size: desc.size,
                created_at: Utc::now(),
                labels: HashMap::new(),
            },
        );
        self.save(&index).await?;

        tracing::debug!(digest = %desc.digest, size = desc.size, media_type = %desc.media_type, "Ingested blob");
        Ok(())
    }

    async fn update_labels(
        &self,
        digest: &Digest,
        labels: HashMap<String, String>,
    ) -> Result<ContentInfo> {
        let mut index = self.index.write().await;
        let info = index
            .get_mut(digest)
            .ok_or_else(|| BuildError::NotFound(digest.to_string()))?;
        info.labels.extend(labels);
        let updated = info.clone();
        self.save(&index).await?;
        Ok(updated)
    }
}
