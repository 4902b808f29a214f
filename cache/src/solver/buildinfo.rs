//! Build info records attached to cache results.
//!
//! Build info describes which external sources a result was built from
//! (an image, a git checkout, an HTTP download) and the pin it resolved to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of source a build info record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildInfoType {
    #[serde(rename = "docker-image")]
    DockerImage,
    #[serde(rename = "git")]
    Git,
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "https")]
    Https,
}

impl std::fmt::Display for BuildInfoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DockerImage => write!(f, "docker-image"),
            Self::Git => write!(f, "git"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// Lookup key for build info: the source kind plus its reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildInfoKey {
    pub kind: BuildInfoType,
    pub reference: String,
}

impl BuildInfoKey {
    pub fn new(kind: BuildInfoType, reference: impl Into<String>) -> Self {
        Self {
            kind,
            reference: reference.into(),
        }
    }

    pub fn image(reference: impl Into<String>) -> Self {
        Self::new(BuildInfoType::DockerImage, reference)
    }

    pub fn git(reference: impl Into<String>) -> Self {
        Self::new(BuildInfoType::Git, reference)
    }

    /// HTTP(S) source; the kind follows the URL scheme.
    pub fn http(url: impl Into<String>) -> Self {
        let url = url.into();
        let kind = if url.starts_with("https://") {
            BuildInfoType::Https
        } else {
            BuildInfoType::Http
        };
        Self::new(kind, url)
    }
}

/// A source a result was built from, with the pin it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(rename = "type")]
    pub kind: BuildInfoType,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub pin: String,
}

impl BuildInfo {
    pub fn new(key: &BuildInfoKey, pin: impl Into<String>) -> Self {
        Self {
            kind: key.kind,
            reference: key.reference.clone(),
            alias: None,
            pin: pin.into(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn key(&self) -> BuildInfoKey {
        BuildInfoKey::new(self.kind, self.reference.clone())
    }
}

/// Build info table carried by a single cache result.
pub type CacheBuildInfos = HashMap<BuildInfoKey, BuildInfo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_key_kind_follows_scheme() {
        assert_eq!(BuildInfoKey::http("https://example.com/a").kind, BuildInfoType::Https);
        assert_eq!(BuildInfoKey::http("http://example.com/a").kind, BuildInfoType::Http);
    }

    #[test]
    fn test_build_info_serializes_like_exporter_record() {
        let key = BuildInfoKey::image("docker.io/library/alpine:3.18");
        let info = BuildInfo::new(&key, "sha256:abc").with_alias("base");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "docker-image");
        assert_eq!(json["ref"], "docker.io/library/alpine:3.18");
        assert_eq!(json["alias"], "base");
        assert_eq!(json["pin"], "sha256:abc");
        assert_eq!(info.key(), key);
    }

    #[test]
    fn test_alias_omitted_when_absent() {
        let info = BuildInfo::new(&BuildInfoKey::git("https://github.com/a/b.git"), "deadbeef");
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("alias"));
    }
}
