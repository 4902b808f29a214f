//! Snapshot refs: mutable working directories and committed snapshots.
//!
//! A mutable ref is held by exactly one owner at a time. Committing it
//! produces an immutable snapshot while the mutable record itself stays
//! available for later reuse. String metadata on a ref may carry a search
//! index, which is how refs are found again across builds.

pub mod idmap;
pub mod local;
pub mod release;

use std::collections::HashMap;
use std::path::PathBuf;

use a3s_build_core::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use idmap::{IdMap, IdentityMapping};
pub use local::LocalRefManager;
pub use release::ReleaseWorker;

/// Record type for snapshots created by the local directory source.
pub const RECORD_TYPE_LOCAL_SOURCE: &str = "local.source";

/// Whether a ref survives pruning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Eligible for garbage collection once released
    #[default]
    Default,
    /// Kept until explicitly removed
    Retain,
}

/// Options for creating a mutable ref.
#[derive(Debug, Clone, Default)]
pub struct NewRefOptions {
    pub policy: CachePolicy,
    pub description: String,
    pub record_type: String,
}

/// A writable view of a ref's directory.
#[derive(Debug, Clone)]
pub struct Mount {
    pub path: PathBuf,
    /// Id mapping in effect for files written through this mount
    pub identity_mapping: Option<IdentityMapping>,
}

/// Metadata of a ref returned by an index search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefMetadata {
    pub id: String,
    pub strings: HashMap<String, String>,
}

impl RefMetadata {
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }
}

/// Store of snapshot refs.
#[async_trait]
pub trait CacheAccessor: Send + Sync {
    /// Create a fresh mutable ref held by the caller.
    async fn new_mutable(&self, opts: NewRefOptions) -> Result<Box<dyn MutableRef>>;

    /// Acquire an existing mutable ref.
    ///
    /// Fails with a ref error when the ref is held elsewhere, gone, or was
    /// never mutable.
    async fn get_mutable(&self, id: &str) -> Result<Box<dyn MutableRef>>;

    /// Refs with a metadata value indexed under `index`.
    async fn search(&self, index: &str) -> Result<Vec<RefMetadata>>;
}

/// A mutable ref held by one owner.
///
/// Dropping the handle gives up the hold without any other change.
#[async_trait]
pub trait MutableRef: Send + Sync {
    fn id(&self) -> &str;

    async fn mount(&self) -> Result<Mount>;

    async fn unmount(&self) -> Result<()>;

    fn get_string(&self, key: &str) -> Option<String>;

    /// Set a metadata value and index it under `index` for [`CacheAccessor::search`].
    fn set_string(&self, key: &str, value: &str, index: &str) -> Result<()>;

    /// Remove a metadata value and its index entry.
    fn clear_string(&self, key: &str) -> Result<()>;

    fn set_cache_policy_default(&self) -> Result<()>;

    /// Commit the current contents as an immutable snapshot and give up
    /// the hold.
    async fn commit(&self) -> Result<Box<dyn ImmutableRef>>;

    /// Give up the hold.
    async fn release(&self) -> Result<()>;
}

/// A committed, read-only snapshot.
#[async_trait]
pub trait ImmutableRef: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Directory holding the snapshot contents.
    fn path(&self) -> PathBuf;

    fn size(&self) -> u64;

    async fn release(&self) -> Result<()>;
}
