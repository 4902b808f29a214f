use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BuildError, Result};

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "A3S_BUILD_HOME";

/// Build cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory for snapshots, content blobs and metadata
    pub state_dir: PathBuf,

    /// Local directory source settings
    pub local: LocalSourceConfig,

    /// Image config resolution settings
    pub image: ImageResolveConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            local: LocalSourceConfig::default(),
            image: ImageResolveConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML or JSON file.
    ///
    /// Files ending in `.yaml` / `.yml` are parsed as YAML, everything
    /// else as JSON. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&data)?,
            _ => serde_json::from_str(&data)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable the cache.
    pub fn validate(&self) -> Result<()> {
        if self.local.session_timeout_ms == 0 {
            return Err(BuildError::ConfigError(
                "local.session_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.image.fetch_concurrency == 0 {
            return Err(BuildError::ConfigError(
                "image.fetch_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.image.lease_ttl_secs == 0 {
            return Err(BuildError::ConfigError(
                "image.lease_ttl_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding local source snapshots.
    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    /// Directory holding content-addressed blobs.
    pub fn content_dir(&self) -> PathBuf {
        self.state_dir.join("content")
    }
}

/// Local directory source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSourceConfig {
    /// Connect timeout for an explicitly named session
    pub session_timeout_ms: u64,

    /// Minimum interval between transfer progress events
    pub progress_interval_ms: u64,
}

impl Default for LocalSourceConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 5_000,
            progress_interval_ms: 100,
        }
    }
}

impl LocalSourceConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Image config resolution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageResolveConfig {
    /// Lifetime of the temporary lease held over resolved content
    pub lease_ttl_secs: u64,

    /// Maximum number of concurrent blob fetches
    pub fetch_concurrency: usize,

    /// Attempts per blob on transient errors (including the first)
    pub fetch_retries: u32,

    /// Base delay between retries, multiplied by the attempt number
    pub retry_backoff_ms: u64,
}

impl Default for ImageResolveConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 300,
            fetch_concurrency: 4,
            fetch_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl ImageResolveConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Resolve the default state directory (`$A3S_BUILD_HOME` or `~/.a3s/build`).
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("build")
}
