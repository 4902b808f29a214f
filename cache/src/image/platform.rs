//! Target platforms and platform preference.

use a3s_build_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// An OS/architecture pair, as found on index entries and image configs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: String::new(),
        }
        .normalize()
    }

    /// Parse `os/arch[/variant]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split('/').collect();
        let platform = match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: String::new(),
            },
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: variant.to_string(),
            },
            _ => {
                return Err(BuildError::OciImageError(format!(
                    "Invalid platform '{}': expected os/arch[/variant]",
                    spec
                )))
            }
        };
        Ok(platform.normalize())
    }

    /// Linux on the host CPU architecture.
    pub fn host() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            variant: String::new(),
        }
        .normalize()
    }

    /// Canonical spelling: lowercase OS, Go-style architecture names and
    /// default variants dropped.
    pub fn normalize(self) -> Self {
        let os = match self.os.to_lowercase().as_str() {
            "macos" => "darwin".to_string(),
            other => other.to_string(),
        };
        let arch = self.architecture.to_lowercase();
        let variant = self.variant.to_lowercase();

        let (architecture, variant) = match (arch.as_str(), variant.as_str()) {
            ("x86_64" | "x86-64" | "amd64", "v1") => ("amd64", String::new()),
            ("x86_64" | "x86-64" | "amd64", _) => ("amd64", variant),
            ("i386" | "i686", _) => ("386", variant),
            ("aarch64" | "arm64", "8" | "v8") => ("arm64", String::new()),
            ("aarch64" | "arm64", _) => ("arm64", variant),
            ("armhf", _) => ("arm", "v7".to_string()),
            ("armel", _) => ("arm", "v6".to_string()),
            ("arm", "" | "7") => ("arm", "v7".to_string()),
            ("arm", "5" | "6" | "8") => ("arm", format!("v{}", variant)),
            (other, _) => (other, variant),
        };

        Self {
            os,
            architecture: architecture.to_string(),
            variant,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if !self.variant.is_empty() {
            write!(f, "/{}", self.variant)?;
        }
        Ok(())
    }
}

/// Ordered set of acceptable platforms; earlier entries are preferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMatcher {
    preferred: Vec<Platform>,
}

impl PlatformMatcher {
    /// Match `platform` and the platforms it can run. 32-bit ARM variants
    /// accept older variants in descending order.
    pub fn only(platform: &Platform) -> Self {
        let platform = platform.clone().normalize();
        let mut preferred = vec![platform.clone()];
        if platform.architecture == "arm" {
            let older: &[&str] = match platform.variant.as_str() {
                "v8" => &["v7", "v6", "v5"],
                "v7" => &["v6", "v5"],
                "v6" => &["v5"],
                _ => &[],
            };
            preferred.extend(older.iter().map(|v| Platform {
                variant: v.to_string(),
                ..platform.clone()
            }));
        }
        Self { preferred }
    }

    pub fn matches(&self, platform: &Platform) -> bool {
        self.rank(platform).is_some()
    }

    /// Position in the preference order; lower is better.
    pub fn rank(&self, platform: &Platform) -> Option<usize> {
        let platform = platform.clone().normalize();
        self.preferred.iter().position(|p| *p == platform)
    }

    pub fn preferred(&self) -> &Platform {
        &self.preferred[0]
    }
}

impl Default for PlatformMatcher {
    fn default() -> Self {
        Self::only(&Platform::host())
    }
}
