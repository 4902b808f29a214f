//! Registry-backed resolver and fetcher.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, GHCR, etc.). Manifests are fetched raw so their digests and
//! media types can be checked locally.

use std::sync::Arc;

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::Digest;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::content::Descriptor;
use super::media;
use super::reference::ImageReference;
use super::resolver::{Fetcher, Resolver};

const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    media::OCI_INDEX,
    media::DOCKER_MANIFEST_LIST,
    media::OCI_MANIFEST,
    media::DOCKER_MANIFEST,
    media::DOCKER_MANIFEST_SCHEMA1,
    media::DOCKER_MANIFEST_SCHEMA1_UNSIGNED,
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to
    /// anonymous access unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

struct Inner {
    client: Client,
    auth: RegistryAuth,
    /// Manifests already downloaded during resolution
    manifests: DashMap<Digest, Bytes>,
}

/// Resolves references against their registries.
#[derive(Clone)]
pub struct RegistryResolver {
    inner: Arc<Inner>,
}

impl RegistryResolver {
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                client: Client::new(config),
                auth,
                manifests: DashMap::new(),
            }),
        }
    }
}

impl Default for RegistryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    async fn pull_manifest(&self, image_ref: &ImageReference, oci_ref: &Reference) -> Result<(Digest, Bytes)> {
        let (data, digest) = self
            .client
            .pull_manifest_raw(oci_ref, &self.auth.to_oci_auth(), ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| classify(&image_ref.registry, "Failed to pull manifest", e))?;
        let data = Bytes::from(data);

        // Registries may omit the digest header; fall back to hashing.
        let digest = match Digest::parse(&digest) {
            Ok(d) => d,
            Err(_) => Digest::from_bytes(&data),
        };
        self.manifests.insert(digest.clone(), data.clone());
        Ok((digest, data))
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let image_ref = ImageReference::parse(reference)?;
        let oci_ref = to_oci_reference(&image_ref)?;

        tracing::debug!(reference = %image_ref, "Resolving image");
        let (digest, data) = self.inner.pull_manifest(&image_ref, &oci_ref).await?;
        let media_type = media::detect_manifest_media_type(&data)?;

        Ok((
            image_ref.to_string(),
            Descriptor::new(media_type, digest, data.len() as u64),
        ))
    }

    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(RegistryFetcher {
            inner: Arc::clone(&self.inner),
            image_ref: ImageReference::parse(name)?,
        }))
    }
}

struct RegistryFetcher {
    inner: Arc<Inner>,
    image_ref: ImageReference,
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(&self, desc: &Descriptor) -> Result<Bytes> {
        if let Some(data) = self.inner.manifests.get(&desc.digest) {
            return Ok(data.clone());
        }

        let pinned = self.image_ref.with_digest(desc.digest.clone());
        let oci_ref = to_oci_reference(&pinned)?;

        if media::is_manifest(&desc.media_type) || media::is_index(&desc.media_type) {
            let (_, data) = self.inner.pull_manifest(&pinned, &oci_ref).await?;
            return Ok(data);
        }

        tracing::debug!(digest = %desc.digest, size = desc.size, "Fetching blob");
        let oci_desc = OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: desc.digest.to_string(),
            size: desc.size as i64,
            ..Default::default()
        };
        let mut data: Vec<u8> = Vec::with_capacity(desc.size as usize);
        self.inner
            .client
            .pull_blob(&oci_ref, &oci_desc, &mut data)
            .await
            .map_err(|e| {
                classify(
                    &self.image_ref.registry,
                    &format!("Failed to pull blob {}", desc.digest),
                    e,
                )
            })?;
        Ok(Bytes::from(data))
    }
}

/// Network failures and server-side errors are retryable; everything else
/// is a registry error.
fn classify(registry: &str, context: &str, err: OciDistributionError) -> BuildError {
    let transient = match &err {
        OciDistributionError::RequestError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code >= 500 || *code == 429,
        _ => false,
    };
    if transient {
        BuildError::TransientError(format!("{}: {}: {}", registry, context, err))
    } else {
        BuildError::RegistryError {
            registry: registry.to_string(),
            message: format!("{}: {}", context, err),
        }
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}@{}", reference.locator(), digest),
        (None, Some(tag)) => format!("{}:{}", reference.locator(), tag),
        (None, None) => format!("{}:latest", reference.locator()),
    };
    ref_str.parse::<Reference>().map_err(|e| {
        BuildError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}
