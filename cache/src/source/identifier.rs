//! Local directory source identifiers.

use std::collections::HashMap;

use a3s_build_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

use crate::session::filesync::Differ;

pub const ATTR_LOCAL_SESSION_ID: &str = "local.session";
pub const ATTR_INCLUDE_PATTERNS: &str = "local.includepattern";
pub const ATTR_EXCLUDE_PATTERNS: &str = "local.excludepatterns";
pub const ATTR_FOLLOW_PATHS: &str = "local.followpaths";
pub const ATTR_SHARED_KEY_HINT: &str = "local.sharedkeyhint";
pub const ATTR_LOCAL_DIFFER: &str = "local.differ";
pub const ATTR_METADATA_TRANSFER: &str = "local.metadatatransfer";
pub const ATTR_METADATA_TRANSFER_EXCLUDE: &str = "local.metadatatransferexclude";

pub const DIFFER_METADATA: &str = "metadata";
pub const DIFFER_NONE: &str = "none";

/// A directory exposed by a build client, plus how to sync it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentifier {
    pub name: String,
    /// Session to sync from; empty means any session of the request
    pub session_id: String,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_paths: Vec<String>,
    pub shared_key_hint: String,
    pub differ: Differ,
    /// Transfer metadata only, except for `metadata_exceptions`
    pub metadata_only: bool,
    pub metadata_exceptions: Vec<String>,
}

impl LocalIdentifier {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BuildError::InvalidIdentifier(
                "local source name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            ..Default::default()
        })
    }

    /// Build an identifier from source attributes. Unknown attributes are
    /// ignored.
    pub fn from_attrs(name: &str, attrs: &HashMap<String, String>) -> Result<Self> {
        let mut id = Self::new(name)?;
        // A prefixed session rewrites the name; apply it last so the result
        // does not depend on attribute order.
        let mut session = None;

        for (key, value) in attrs {
            match key.as_str() {
                ATTR_LOCAL_SESSION_ID => session = Some(value.as_str()),
                ATTR_INCLUDE_PATTERNS => id.include_patterns = parse_list(key, value)?,
                ATTR_EXCLUDE_PATTERNS => id.exclude_patterns = parse_list(key, value)?,
                ATTR_FOLLOW_PATHS => id.follow_paths = parse_list(key, value)?,
                ATTR_SHARED_KEY_HINT => id.shared_key_hint = value.clone(),
                ATTR_LOCAL_DIFFER => id.differ = parse_differ(value)?,
                ATTR_METADATA_TRANSFER => id.metadata_only = parse_bool(key, value)?,
                ATTR_METADATA_TRANSFER_EXCLUDE => {
                    id.metadata_exceptions = parse_list(key, value)?
                }
                _ => {}
            }
        }

        if let Some(session) = session {
            match session.split_once(':') {
                Some((prefix, session_id)) => {
                    id.name = format!("{}-{}", prefix, id.name);
                    id.session_id = session_id.to_string();
                }
                None => id.session_id = session.to_string(),
            }
        }

        Ok(id)
    }
}

fn parse_list(key: &str, value: &str) -> Result<Vec<String>> {
    // JSON null decodes to an empty list
    let list: Option<Vec<String>> = serde_json::from_str(value).map_err(|e| {
        BuildError::InvalidIdentifier(format!("invalid value for {} {:?}: {}", key, value, e))
    })?;
    Ok(list.unwrap_or_default())
}

fn parse_differ(value: &str) -> Result<Differ> {
    match value {
        DIFFER_METADATA | "" => Ok(Differ::Metadata),
        DIFFER_NONE => Ok(Differ::None),
        other => Err(BuildError::InvalidIdentifier(format!(
            "invalid value for {} {:?}",
            ATTR_LOCAL_DIFFER, other
        ))),
    }
}

/// Boolean attribute values: `1 t T TRUE true True` and `0 f F FALSE false False`.
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(BuildError::InvalidIdentifier(format!(
            "invalid value for {} {:?}",
            key, value
        ))),
    }
}
