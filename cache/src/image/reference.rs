//! OCI image reference parsing.
//!
//! Parses references like `ghcr.io/a3s-lab/base:v1@sha256:...` into their
//! registry, repository, tag and digest components.

use a3s_build_core::error::{BuildError, Result};
use a3s_build_core::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/alpine")
    pub repository: String,
    pub tag: Option<String>,
    /// Pinned manifest digest
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `user/app:1.0` → docker.io/user/app:1.0
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` → pinned, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BuildError::OciImageError(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                let digest = Digest::parse(digest).map_err(|e| {
                    BuildError::OciImageError(format!(
                        "Invalid digest in reference '{}': {}",
                        reference, e
                    ))
                })?;
                (name_tag, Some(digest))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository` without tag or digest.
    pub fn locator(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The same repository pinned to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

/// Split a trailing `:tag` from the last path component. A colon in the
/// first component followed only by digits is a registry port.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    let Some(colon) = name_tag[last_start..].rfind(':').map(|i| last_start + i) else {
        return (name_tag, None);
    };
    let tag = &name_tag[colon + 1..];
    if last_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
        return (name_tag, None);
    }
    (&name_tag[..colon], Some(tag))
}

fn split_registry(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BuildError::OciImageError(format!(
                    "Empty repository in reference '{}'",
                    reference
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return Err(BuildError::OciImageError(format!(
            "Empty repository in reference '{}'",
            reference
        )));
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
