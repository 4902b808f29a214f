//! A3S Build Core - Foundational Types
//!
//! Error types, configuration, content digests and progress events
//! shared by the A3S build cache crates.

pub mod config;
pub mod digest;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{CacheConfig, ImageResolveConfig, LocalSourceConfig};
pub use digest::Digest;
pub use error::{BuildError, RefErrorKind, Result, SessionErrorKind};
pub use event::{ProgressEmitter, VertexStatus};

/// A3S Build version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
