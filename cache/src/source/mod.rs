//! Sources that resolve references into cache keys and snapshots.

pub mod identifier;
pub mod local;
pub mod progress;

use std::collections::HashMap;

use a3s_build_core::Digest;

pub use identifier::LocalIdentifier;
pub use local::{LocalSource, LocalSourceHandler, LocalSourceOpt};
pub use progress::ProgressHandler;

/// URL scheme handled by the local directory source.
pub const LOCAL_SCHEME: &str = "local";

/// Extra solver options attached to a cache key.
pub type CacheOpts = HashMap<String, serde_json::Value>;

/// A cache key computed by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKeyResult {
    /// Full key, e.g. `session:<name>:<digest>`
    pub key: String,
    pub digest: Digest,
    pub opts: CacheOpts,
    /// Whether equal keys are interchangeable without further checks
    pub exact: bool,
}
