//! Remote resolution seams.

use std::sync::Arc;

use a3s_build_core::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

use super::content::Descriptor;

/// Resolves references to root descriptors and hands out fetchers.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `reference` to its canonical name and root descriptor.
    async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)>;

    /// A fetcher for blobs of the resolved `name`.
    async fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>>;
}

/// Downloads blobs by descriptor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, desc: &Descriptor) -> Result<Bytes>;
}
