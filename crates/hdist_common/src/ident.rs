//! Artifact identifiers and safe-name validation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Prefix marking an import ID as virtual.
///
/// A virtual ID is an arbitrary user-chosen string; its binding to a
/// concrete artifact is supplied at build time so that the digest depends
/// on the user-chosen string rather than the artifact contents.
pub const VIRTUAL_PREFIX: &str = "virtual:";

/// Checks a name or version against the safe-name alphabet
/// `[a-zA-Z0-9_+-]+`.
pub fn assert_safe_name(x: &str) -> Result<&str, ParseArtifactIdError> {
    let ok = !x.is_empty()
        && x.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+'));
    if ok {
        Ok(x)
    } else {
        Err(ParseArtifactIdError {
            input: x.to_string(),
            reason: "empty or contains illegal characters".to_string(),
        })
    }
}

/// Error parsing an artifact ID or validating a name.
#[derive(Debug, thiserror::Error)]
#[error("invalid artifact id or name \"{input}\": {reason}")]
pub struct ParseArtifactIdError {
    /// The rejected input.
    pub input: String,
    /// Description of the problem.
    pub reason: String,
}

/// A concrete artifact identifier: the pair `(name, digest)`, rendered as
/// `name/digest`.
///
/// The digest is a pure function of the canonicalized build specification,
/// so knowing the spec means knowing the ID without building anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactId {
    /// The artifact name; matches `[a-zA-Z0-9_+-]+`.
    pub name: String,
    /// The digest of the canonical build spec.
    pub digest: Digest,
}

impl ArtifactId {
    /// Creates an ID after validating the name.
    pub fn new(name: &str, digest: Digest) -> Result<Self, ParseArtifactIdError> {
        assert_safe_name(name)?;
        Ok(Self {
            name: name.to_string(),
            digest,
        })
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.digest)
    }
}

impl FromStr for ArtifactId {
    type Err = ParseArtifactIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, digest) = s.split_once('/').ok_or_else(|| ParseArtifactIdError {
            input: s.to_string(),
            reason: "expected name/digest".to_string(),
        })?;
        assert_safe_name(name)?;
        let digest: Digest = digest.parse().map_err(|e| ParseArtifactIdError {
            input: s.to_string(),
            reason: format!("{e}"),
        })?;
        Ok(Self {
            name: name.to_string(),
            digest,
        })
    }
}

impl Serialize for ArtifactId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ArtifactId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_names_accepted() {
        for name in ["zlib", "gnu-make", "foo_bar", "gcc+ada", "a1"] {
            assert!(assert_safe_name(name).is_ok(), "{name} should be safe");
        }
    }

    #[test]
    fn unsafe_names_rejected() {
        for name in ["", "foo/bar", "a b", "x\n", "caf\u{e9}"] {
            assert!(assert_safe_name(name).is_err(), "{name:?} should be rejected");
        }
    }

    #[test]
    fn display_roundtrip() {
        let id = ArtifactId::new("zlib", Digest::from_data(b"spec")).unwrap();
        let s = id.to_string();
        assert!(s.starts_with("zlib/"));
        let back: ArtifactId = s.parse().unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn parse_rejects_missing_slash() {
        assert!("justaname".parse::<ArtifactId>().is_err());
    }

    #[test]
    fn parse_rejects_bad_digest() {
        assert!("name/notadigest".parse::<ArtifactId>().is_err());
    }

    #[test]
    fn parse_rejects_bad_name() {
        let digest = Digest::from_data(b"x").to_string();
        assert!(format!("bad name/{digest}").parse::<ArtifactId>().is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let id = ArtifactId::new("foo", Digest::from_data(b"a")).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let back: ArtifactId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
