//! Image config resolution.
//!
//! Resolves an image reference to its manifest digest and the raw config
//! blob for one platform, populating the content store on the way. A
//! digest-pinned reference whose manifest is already stored, with a
//! matching distribution-source label, is served without contacting the
//! resolver.

use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::{Digest, ImageResolveConfig};
use bytes::Bytes;
use tokio::sync::Semaphore;

use super::content::{has_source, ContentStore, Descriptor};
use super::handlers::{
    dispatch, select_manifests, ChildrenHandler, DistributionSourceHandler, FetchHandler,
    Handler, Handlers, IndexDoc, ManifestDoc,
};
use super::media;
use super::platform::{Platform, PlatformMatcher};
use super::reference::ImageReference;
use super::resolver::Resolver;
use crate::lease::{Lease, LeaseManager, LeaseReleaseQueue};

const SCHEMA1_REMOVED: &str = "support Docker Image manifest version 2, schema 1 has been removed. More information at https://docs.docker.com/go/deprecated-image-specs/";

/// Resolves image configs into a content store.
pub struct ImageConfigResolver {
    store: Arc<dyn ContentStore>,
    leases: Option<(Arc<dyn LeaseManager>, Arc<LeaseReleaseQueue>)>,
    limiter: Arc<Semaphore>,
    config: ImageResolveConfig,
}

impl ImageConfigResolver {
    pub fn new(store: Arc<dyn ContentStore>, config: ImageResolveConfig) -> Self {
        Self {
            store,
            leases: None,
            limiter: Arc::new(Semaphore::new(config.fetch_concurrency.max(1))),
            config,
        }
    }

    /// Hold resolved content under a temporary lease. The lease is not
    /// deleted on return; its release is pushed onto `queue`.
    pub fn with_leases(
        mut self,
        manager: Arc<dyn LeaseManager>,
        queue: Arc<LeaseReleaseQueue>,
    ) -> Self {
        self.leases = Some((manager, queue));
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Resolve `reference` for `platform` (the host's linux platform if
    /// `None`), returning the root manifest digest and config bytes.
    pub async fn resolve_config(
        &self,
        reference: &str,
        resolver: &dyn Resolver,
        platform: Option<&Platform>,
    ) -> Result<(Digest, Bytes)> {
        let matcher = platform.map(PlatformMatcher::only).unwrap_or_default();
        let image_ref = ImageReference::parse(reference)?;

        let mut lease_guard = None;
        let mut lease = None;
        if let Some((manager, queue)) = &self.leases {
            let created = manager.create(self.config.lease_ttl()).await?;
            lease = Some((Arc::clone(manager), created.clone()));
            lease_guard = Some(QueuedRelease {
                manager,
                queue,
                lease: Some(created),
            });
        }

        let result = self.resolve_leased(&image_ref, resolver, &matcher, lease).await;
        drop(lease_guard);
        result
    }

    async fn resolve_leased(
        &self,
        image_ref: &ImageReference,
        resolver: &dyn Resolver,
        matcher: &PlatformMatcher,
        lease: Option<(Arc<dyn LeaseManager>, Lease)>,
    ) -> Result<(Digest, Bytes)> {
        let cached = match &image_ref.digest {
            Some(digest) => self.cached_descriptor(image_ref, digest).await,
            None => None,
        };

        let (name, desc) = match cached {
            Some(desc) => {
                tracing::debug!(reference = %image_ref, digest = %desc.digest, "Using cached manifest");
                (image_ref.to_string(), desc)
            }
            None => resolver.resolve(&image_ref.to_string()).await?,
        };

        if media::is_schema1(&desc.media_type) {
            return Err(BuildError::UnsupportedManifest(SCHEMA1_REMOVED.to_string()));
        }

        let fetcher = resolver.fetcher(&name).await?;
        let mut fetch = FetchHandler::new(Arc::clone(&self.store), fetcher, Arc::clone(&self.limiter))
            .with_retries(self.config.fetch_retries, self.config.retry_backoff());
        if let Some((manager, lease)) = lease {
            fetch = fetch.with_lease(manager, lease);
        }

        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(fetch),
            Box::new(DistributionSourceHandler::new(Arc::clone(&self.store), image_ref)),
            Box::new(
                ChildrenHandler::new(Arc::clone(&self.store), matcher.clone()).limit_manifests(1),
            ),
        ];
        dispatch(&Handlers(handlers), vec![desc.clone()]).await?;

        let config = manifest_config(self.store.as_ref(), &desc, matcher).await?;
        let data = self.store.read(&config.digest).await?;
        tracing::debug!(reference = %image_ref, manifest = %desc.digest, config = %config.digest, "Resolved image config");
        Ok((desc.digest, data))
    }

    /// Root descriptor for a pinned digest served from the store, if the
    /// blob is present and was fetched from the same repository.
    async fn cached_descriptor(&self, image_ref: &ImageReference, digest: &Digest) -> Option<Descriptor> {
        let info = self.store.info(digest).await.ok()?;
        if !has_source(&info, image_ref) {
            return None;
        }
        let data = self.store.read(digest).await.ok()?;
        let media_type = match media::detect_manifest_media_type(&data) {
            Ok(mt) => mt,
            Err(e) => {
                tracing::debug!(digest = %digest, error = %e, "Cached manifest not usable");
                return None;
            }
        };
        Some(Descriptor::new(media_type, digest.clone(), data.len() as u64))
    }
}

/// Queues the lease release when dropped, including on cancellation.
struct QueuedRelease<'a> {
    manager: &'a Arc<dyn LeaseManager>,
    queue: &'a LeaseReleaseQueue,
    lease: Option<Lease>,
}

impl Drop for QueuedRelease<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.queue.push(Arc::clone(self.manager), lease);
        }
    }
}

/// Find the config descriptor of the manifest selected for `matcher`.
///
/// The root manifest is used as-is. Manifests reached through an index must
/// match the platform, taken from the index entry or, failing that, from
/// their config.
pub async fn manifest_config(
    store: &dyn ContentStore,
    root: &Descriptor,
    matcher: &PlatformMatcher,
) -> Result<Descriptor> {
    let mut pending = vec![root.clone()];
    let mut was_index = false;

    while let Some(desc) = pending.pop() {
        let mt = desc.media_type.as_str();
        if media::is_manifest(mt) {
            let data = store.read(&desc.digest).await?;
            let manifest: ManifestDoc = serde_json::from_slice(&data)?;
            if desc.digest != root.digest {
                let platform = match &desc.platform {
                    Some(p) => p.clone(),
                    None => {
                        let config = store.read(&manifest.config.digest).await?;
                        serde_json::from_slice::<Platform>(&config)?
                    }
                };
                if !matcher.matches(&platform) {
                    continue;
                }
            }
            return Ok(manifest.config);
        } else if media::is_index(mt) {
            was_index = true;
            let data = store.read(&desc.digest).await?;
            let index: IndexDoc = serde_json::from_slice(&data)?;
            let mut selected = select_manifests(index.manifests, matcher, 1);
            selected.reverse();
            pending.extend(selected);
        } else {
            return Err(BuildError::NotFound(format!(
                "unexpected media type {} for {}",
                mt, desc.digest
            )));
        }
    }

    if was_index {
        Err(BuildError::NoMatchingPlatform(matcher.preferred().to_string()))
    } else {
        Err(BuildError::NotFound(format!("manifest {}", root.digest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::content::LocalContentStore;
    use tempfile::TempDir;

    async fn put(store: &LocalContentStore, media_type: &str, data: &str) -> Descriptor {
        let desc = Descriptor::for_data(media_type, data.as_bytes());
        store
            .ingest(&desc, Bytes::from(data.to_string()))
            .await
            .unwrap();
        desc
    }

    fn manifest_json(config: &Descriptor) -> String {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_MANIFEST,
            "config": config,
            "layers": [],
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_root_manifest_skips_platform_check() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();
        let config = put(&store, media::OCI_CONFIG, r#"{"os":"windows","architecture":"amd64"}"#).await;
        let manifest = put(&store, media::OCI_MANIFEST, &manifest_json(&config)).await;

        let matcher = PlatformMatcher::only(&Platform::new("linux", "arm64"));
        let found = manifest_config(&store, &manifest, &matcher).await.unwrap();
        assert_eq!(found.digest, config.digest);
    }

    #[tokio::test]
    async fn test_index_entry_without_platform_checks_config() {
        let tmp = TempDir::new().unwrap();
        let store = LocalContentStore::open(tmp.path()).unwrap();
        let config = put(&store, media::OCI_CONFIG, r#"{"os":"linux","architecture":"arm64"}"#).await;
        let manifest = put(&store, media::OCI_MANIFEST, &manifest_json(&config)).await;
        let index = serde_json::json!({ "schemaVersion": 2, "manifests": [manifest] }).to_string();
        let index = put(&store, media::OCI_INDEX, &index).await;

        let arm64 = PlatformMatcher::only(&Platform::new("linux", "arm64"));
        let found = manifest_config(&store, &index, &arm64).await.unwrap();
        assert_eq!(found.digest, config.digest);

        let amd64 = PlatformMatcher::only(&Platform::new("linux", "amd64"));
        assert!(matches!(
            manifest_config(&store, &index, &amd64).await,
            Err(BuildError::NoMatchingPlatform(p)) if p == "linux/amd64"
        ));
    }
}
