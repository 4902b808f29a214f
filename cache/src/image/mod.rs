//! Image config resolution.
//!
//! Resolves image references to their config blob for a target platform,
//! fetching manifests into a content-addressed store.
//!
//! # Flow
//!
//! ```text
//! reference ──► pinned & cached? ──yes──► stored manifest
//!                     │ no
//!                     ▼
//!               Resolver::resolve ──► root descriptor
//!                                          │ schema 1 ⇒ error
//!                                          ▼
//!               dispatch(fetch ► label ► children)
//!                                          │
//!                                          ▼
//!                         platform manifest ► config bytes
//! ```

pub mod config;
pub mod content;
pub mod handlers;
pub mod media;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod resolver;

pub use config::{manifest_config, ImageConfigResolver};
pub use content::{ContentInfo, ContentStore, Descriptor, LocalContentStore};
pub use handlers::{dispatch, Handler};
pub use media::detect_manifest_media_type;
pub use platform::{Platform, PlatformMatcher};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryResolver};
pub use resolver::{Fetcher, Resolver};
