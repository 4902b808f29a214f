//! Descriptor handlers and dispatch.
//!
//! A handler processes one descriptor and returns the children to descend
//! into. [`dispatch`] walks a descriptor tree concurrently, feeding each
//! level's children back through the same handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use a3s_build_core::error::{BuildError, Result};
use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::Semaphore;

use super::content::{append_source, distribution_source_key, ContentStore, Descriptor};
use super::media;
use super::platform::PlatformMatcher;
use super::reference::ImageReference;
use super::resolver::Fetcher;
use crate::lease::{Lease, LeaseManager};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, desc: &Descriptor) -> Result<Vec<Descriptor>>;
}

/// Runs handlers in order, concatenating their children.
pub struct Handlers(pub Vec<Box<dyn Handler>>);

#[async_trait]
impl Handler for Handlers {
    async fn handle(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let mut children = Vec::new();
        for handler in &self.0 {
            children.extend(handler.handle(desc).await?);
        }
        Ok(children)
    }
}

/// Handle `descs` and, recursively, their children. Siblings run
/// concurrently; the first error aborts the walk.
pub fn dispatch<'a>(handler: &'a dyn Handler, descs: Vec<Descriptor>) -> BoxFuture<'a, Result<()>> {
    async move {
        let walks = descs.into_iter().map(|desc| async move {
            let children = handler.handle(&desc).await?;
            if !children.is_empty() {
                dispatch(handler, children).await?;
            }
            Ok::<_, BuildError>(())
        });
        try_join_all(walks).await?;
        Ok(())
    }
    .boxed()
}

/// Fetches blobs into the content store.
///
/// Fetches share a semaphore bounding concurrency and are retried on
/// transient errors. Blobs already in the store are not fetched again.
pub struct FetchHandler {
    store: Arc<dyn ContentStore>,
    fetcher: Arc<dyn Fetcher>,
    limiter: Arc<Semaphore>,
    attempts: u32,
    backoff: Duration,
    lease: Option<(Arc<dyn LeaseManager>, Lease)>,
}

impl FetchHandler {
    pub fn new(store: Arc<dyn ContentStore>, fetcher: Arc<dyn Fetcher>, limiter: Arc<Semaphore>) -> Self {
        Self {
            store,
            fetcher,
            limiter,
            attempts: 1,
            backoff: Duration::ZERO,
            lease: None,
        }
    }

    /// Try each fetch up to `attempts` times, sleeping `backoff * n` after
    /// the n-th transient failure.
    pub fn with_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Record every handled blob on `lease`.
    pub fn with_lease(mut self, manager: Arc<dyn LeaseManager>, lease: Lease) -> Self {
        self.lease = Some((manager, lease));
        self
    }

    async fn fetch_with_retry(&self, desc: &Descriptor) -> Result<bytes::Bytes> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| BuildError::Other(format!("Fetch limiter closed: {}", e)))?;

        let mut attempt = 1;
        loop {
            match self.fetcher.fetch(desc).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::debug!(
                        digest = %desc.digest,
                        attempt,
                        error = %e,
                        "Retrying blob fetch"
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Handler for FetchHandler {
    async fn handle(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        if !self.store.exists(&desc.digest).await {
            let data = self.fetch_with_retry(desc).await?;
            self.store.ingest(desc, data).await?;
        }
        if let Some((manager, lease)) = &self.lease {
            manager.add_resource(lease, &desc.digest).await?;
        }
        Ok(Vec::new())
    }
}

/// Records the source repository of every handled blob in its
/// distribution-source label.
pub struct DistributionSourceHandler {
    store: Arc<dyn ContentStore>,
    key: String,
    repository: String,
}

impl DistributionSourceHandler {
    pub fn new(store: Arc<dyn ContentStore>, reference: &ImageReference) -> Self {
        Self {
            store,
            key: distribution_source_key(&reference.registry),
            repository: reference.repository.clone(),
        }
    }
}

#[async_trait]
impl Handler for DistributionSourceHandler {
    async fn handle(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let info = self.store.info(&desc.digest).await?;
        let existing = info.labels.get(&self.key).map(String::as_str);
        if let Some(value) = append_source(existing, &self.repository) {
            let labels = HashMap::from([(self.key.clone(), value)]);
            self.store.update_labels(&desc.digest, labels).await?;
        }
        Ok(Vec::new())
    }
}

#[derive(Deserialize)]
pub(crate) struct ManifestDoc {
    pub config: Descriptor,
}

#[derive(Deserialize)]
pub(crate) struct IndexDoc {
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

/// Keep index entries without a platform or with a matching one, best match
/// first, at most `limit` of them (0 keeps all).
pub(crate) fn select_manifests(
    entries: Vec<Descriptor>,
    matcher: &PlatformMatcher,
    limit: usize,
) -> Vec<Descriptor> {
    let mut selected: Vec<Descriptor> = entries
        .into_iter()
        .filter(|d| d.platform.as_ref().map_or(true, |p| matcher.matches(p)))
        .collect();
    selected.sort_by_key(|d| {
        d.platform
            .as_ref()
            .and_then(|p| matcher.rank(p))
            .unwrap_or(usize::MAX)
    });
    if limit > 0 {
        selected.truncate(limit);
    }
    selected
}

/// Expands manifests to their config and indexes to the manifests for the
/// target platform. Layers are never descended into.
pub struct ChildrenHandler {
    store: Arc<dyn ContentStore>,
    platform: PlatformMatcher,
    limit: usize,
}

impl ChildrenHandler {
    pub fn new(store: Arc<dyn ContentStore>, platform: PlatformMatcher) -> Self {
        Self {
            store,
            platform,
            limit: 0,
        }
    }

    /// Keep at most `limit` manifests per index.
    pub fn limit_manifests(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
impl Handler for ChildrenHandler {
    async fn handle(&self, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let mt = desc.media_type.as_str();
        if media::is_manifest(mt) {
            let data = self.store.read(&desc.digest).await?;
            let manifest: ManifestDoc = serde_json::from_slice(&data)?;
            Ok(vec![manifest.config])
        } else if media::is_index(mt) {
            let data = self.store.read(&desc.digest).await?;
            let index: IndexDoc = serde_json::from_slice(&data)?;
            Ok(select_manifests(index.manifests, &self.platform, self.limit))
        } else if media::is_childless(mt) {
            Ok(Vec::new())
        } else {
            Err(BuildError::UnknownMediaType(desc.media_type.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::content::LocalContentStore;
    use crate::image::platform::Platform;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FlakyFetcher {
        data: Bytes,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for FlakyFetcher {
        async fn fetch(&self, _desc: &Descriptor) -> Result<Bytes> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(BuildError::TransientError("connection reset".to_string()));
            }
            Ok(self.data.clone())
        }
    }

    fn entry(os: &str, arch: &str, data: &[u8]) -> Descriptor {
        Descriptor {
            platform: Some(Platform::new(os, arch)),
            ..Descriptor::for_data(media::OCI_MANIFEST, data)
        }
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_errors() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ContentStore> = Arc::new(LocalContentStore::open(tmp.path()).unwrap());
        let fetcher = Arc::new(FlakyFetcher {
            data: Bytes::from_static(b"blob"),
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let desc = Descriptor::for_data(media::OCI_CONFIG, b"blob");

        let handler = FetchHandler::new(store.clone(), fetcher.clone(), Arc::new(Semaphore::new(1)))
            .with_retries(3, Duration::ZERO);
        handler.handle(&desc).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        // Present blobs are not fetched again.
        handler.handle(&desc).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_attempts() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ContentStore> = Arc::new(LocalContentStore::open(tmp.path()).unwrap());
        let fetcher = Arc::new(FlakyFetcher {
            data: Bytes::from_static(b"blob"),
            failures: 5,
            calls: AtomicUsize::new(0),
        });
        let desc = Descriptor::for_data(media::OCI_CONFIG, b"blob");

        let handler = FetchHandler::new(store, fetcher.clone(), Arc::new(Semaphore::new(1)))
            .with_retries(2, Duration::ZERO);
        assert!(handler.handle(&desc).await.unwrap_err().is_transient());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_select_manifests_filters_and_limits() {
        let amd64 = entry("linux", "amd64", b"amd64");
        let arm64 = entry("linux", "arm64", b"arm64");
        let any = Descriptor::for_data(media::OCI_MANIFEST, b"any");
        let matcher = PlatformMatcher::only(&Platform::new("linux", "amd64"));

        let all = select_manifests(vec![any.clone(), arm64.clone(), amd64.clone()], &matcher, 0);
        assert_eq!(all, vec![amd64.clone(), any]);

        let one = select_manifests(vec![arm64, amd64.clone()], &matcher, 1);
        assert_eq!(one, vec![amd64]);
    }

    #[tokio::test]
    async fn test_children_of_unknown_type_fail() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ContentStore> = Arc::new(LocalContentStore::open(tmp.path()).unwrap());
        let handler = ChildrenHandler::new(store, PlatformMatcher::default());

        let desc = Descriptor::for_data("application/x-unknown", b"?");
        assert!(matches!(
            handler.handle(&desc).await,
            Err(BuildError::UnknownMediaType(_))
        ));

        let config = Descriptor::for_data(media::DOCKER_CONFIG, b"{}");
        assert!(handler.handle(&config).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distribution_source_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ContentStore> = Arc::new(LocalContentStore::open(tmp.path()).unwrap());
        let desc = Descriptor::for_data(media::OCI_CONFIG, b"{}");
        store.ingest(&desc, Bytes::from_static(b"{}")).await.unwrap();

        let reference = ImageReference::parse("ghcr.io/team/app:v1").unwrap();
        let handler = DistributionSourceHandler::new(store.clone(), &reference);
        handler.handle(&desc).await.unwrap();
        handler.handle(&desc).await.unwrap();

        let info = store.info(&desc.digest).await.unwrap();
        assert_eq!(
            info.labels
                .get("containerd.io/distribution.source.ghcr.io")
                .map(String::as_str),
            Some("team/app")
        );
    }
}
