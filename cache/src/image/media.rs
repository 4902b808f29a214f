//! Manifest and config media types.

use a3s_build_core::error::{BuildError, Result};
use serde::de::IgnoredAny;
use serde::Deserialize;

pub const DOCKER_MANIFEST_SCHEMA1: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const DOCKER_MANIFEST_SCHEMA1_UNSIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Config type used by images pushed before schema 2 configs had a media type.
pub const DOCKER_LEGACY_CONFIG: &str = "application/octet-stream";

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

pub const IN_TOTO_PAYLOAD: &str = "application/vnd.in-toto+json";

pub fn is_manifest(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST | OCI_MANIFEST)
}

pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, DOCKER_MANIFEST_LIST | OCI_INDEX)
}

pub fn is_schema1(media_type: &str) -> bool {
    matches!(
        media_type,
        DOCKER_MANIFEST_SCHEMA1 | DOCKER_MANIFEST_SCHEMA1_UNSIGNED
    )
}

/// Types whose descriptors never have children.
pub fn is_childless(media_type: &str) -> bool {
    matches!(
        media_type,
        DOCKER_CONFIG | OCI_CONFIG | DOCKER_LEGACY_CONFIG | IN_TOTO_PAYLOAD
    ) || is_layer(media_type)
}

pub fn is_layer(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.oci.image.layer.")
        || media_type.starts_with("application/vnd.docker.image.rootfs.")
}

#[derive(Deserialize)]
struct ManifestShape {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    #[serde(rename = "schemaVersion")]
    schema_version: Option<i64>,
    config: Option<IgnoredAny>,
    layers: Option<IgnoredAny>,
    manifests: Option<IgnoredAny>,
}

/// Determine the media type of a manifest document from its JSON shape.
///
/// A document with `config` or `layers` is a manifest, one with only
/// `manifests` (or nothing) is a manifest list. Having both is ambiguous.
/// An explicit `mediaType` must agree with the shape. Schema 1 documents are
/// reported as such so callers can reject them.
pub fn detect_manifest_media_type(data: &[u8]) -> Result<String> {
    let shape: ManifestShape = serde_json::from_slice(data)?;

    if shape.schema_version == Some(1) {
        return Ok(DOCKER_MANIFEST_SCHEMA1.to_string());
    }

    let mut media_type = DOCKER_MANIFEST_LIST;
    if shape.config.is_some() || shape.layers.is_some() {
        if shape.manifests.is_some() {
            return Err(BuildError::AmbiguousManifest);
        }
        media_type = DOCKER_MANIFEST;
    }

    match shape.media_type.as_deref() {
        None | Some("") => Ok(media_type.to_string()),
        Some(declared) => {
            let agrees = if media_type == DOCKER_MANIFEST_LIST {
                is_index(declared)
            } else {
                is_manifest(declared)
            };
            if !agrees {
                return Err(BuildError::MediaTypeMismatch(declared.to_string()));
            }
            Ok(declared.to_string())
        }
    }
}
