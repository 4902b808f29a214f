//! A3S Build Cache - cache engine for build steps.
//!
//! This crate provides the caching subsystems used while solving a build
//! graph: ancestor build info lookup, local directory snapshots synced from
//! client sessions, and image config resolution against registries.

#![allow(clippy::result_large_err)]

pub mod contenthash;
pub mod image;
pub mod lease;
pub mod session;
pub mod snapshot;
pub mod solver;
pub mod source;

// Re-export common types
pub use contenthash::{CacheContext, ContentHashStore};
pub use image::{ImageConfigResolver, ImageReference, LocalContentStore, Platform, RegistryResolver};
pub use lease::{Lease, LeaseManager, LeaseReleaseQueue, LocalLeaseManager};
pub use session::{Caller, SessionGroup, SessionManager};
pub use snapshot::{CacheAccessor, ImmutableRef, LocalRefManager, MutableRef, ReleaseWorker};
pub use solver::{AncestorBuildInfos, BuildInfoKey, BuildInfoType, StepContext};
pub use source::{CacheKeyResult, LocalIdentifier, LocalSource, LocalSourceOpt};

/// A3S Build Cache version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
