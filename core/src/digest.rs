//! Content digests in `algorithm:hex` form.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{BuildError, Result};

/// A content digest such as `sha256:4f4fb700...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Canonical digest algorithm.
    pub const SHA256: &'static str = "sha256";

    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex_part) = s.split_once(':').ok_or_else(|| {
            BuildError::OciImageError(format!(
                "Invalid digest '{}': expected algorithm:hex",
                s
            ))
        })?;

        let expected_len = match algorithm {
            "sha256" => 64,
            "sha384" => 96,
            "sha512" => 128,
            other => {
                return Err(BuildError::OciImageError(format!(
                    "Unsupported digest algorithm '{}' in '{}'",
                    other, s
                )))
            }
        };

        if hex_part.len() != expected_len
            || !hex_part
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(BuildError::OciImageError(format!(
                "Invalid {} digest '{}'",
                algorithm, s
            )));
        }

        Ok(Self(s.to_string()))
    }

    /// SHA256 digest of raw bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("{}:{}", Self::SHA256, hex::encode(hasher.finalize())))
    }

    /// Algorithm component (`sha256`).
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// Hex component.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check `data` against this digest.
    ///
    /// Only sha256 digests can be verified; other algorithms never match.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm() == Self::SHA256 && Self::from_bytes(data) == *self
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Digest {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = BuildError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}
