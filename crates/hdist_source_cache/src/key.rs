//! Source keys: `scheme:digest` identifiers for cached sources.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SourceCacheError;

/// The storage scheme of a source key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// A gzip-compressed tarball.
    TarGz,
    /// A bzip2-compressed tarball.
    TarBz2,
    /// A zip archive.
    Zip,
    /// A canonically-serialized set of `(path, contents)` pairs.
    Files,
    /// A commit in the shared bare git repository.
    Git,
}

impl Scheme {
    /// The wire name of the scheme.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::TarGz => "tar.gz",
            Scheme::TarBz2 => "tar.bz2",
            Scheme::Zip => "zip",
            Scheme::Files => "files",
            Scheme::Git => "git",
        }
    }

    /// Infers an archive scheme from the trailing extension of a URL.
    pub fn from_url(url: &str) -> Result<Scheme, SourceCacheError> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Ok(Scheme::TarGz)
        } else if path.ends_with(".tar.bz2") {
            Ok(Scheme::TarBz2)
        } else if path.ends_with(".zip") {
            Ok(Scheme::Zip)
        } else {
            Err(SourceCacheError::UnknownArchiveType {
                url: url.to_string(),
            })
        }
    }

    /// True for the packed archive schemes stored under `packs/`.
    pub fn is_archive(self) -> bool {
        matches!(self, Scheme::TarGz | Scheme::TarBz2 | Scheme::Zip)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = SourceCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tar.gz" => Ok(Scheme::TarGz),
            "tar.bz2" => Ok(Scheme::TarBz2),
            "zip" => Ok(Scheme::Zip),
            "files" => Ok(Scheme::Files),
            "git" => Ok(Scheme::Git),
            other => Err(SourceCacheError::UnknownScheme {
                scheme: other.to_string(),
            }),
        }
    }
}

/// A source cache key: `scheme:digest`.
///
/// The digest covers the raw archive bytes for packed schemes, the
/// canonical serialization of the file set for `files`, and is a full
/// commit hash for `git`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    /// The storage scheme.
    pub scheme: Scheme,
    /// The digest or commit hash, as rendered in the key.
    pub digest: String,
}

impl SourceKey {
    /// Creates a key after validating the digest form for the scheme.
    pub fn new(scheme: Scheme, digest: &str) -> Result<Self, SourceCacheError> {
        let valid = match scheme {
            Scheme::Git => digest.len() == 40 && digest.chars().all(|c| c.is_ascii_hexdigit()),
            _ => digest.parse::<hdist_common::Digest>().is_ok(),
        };
        if !valid {
            return Err(SourceCacheError::InvalidKey {
                key: format!("{scheme}:{digest}"),
                reason: match scheme {
                    Scheme::Git => "git keys require a full 40-character commit hash".to_string(),
                    _ => "digest is not a valid 32-character base-32 string".to_string(),
                },
            });
        }
        Ok(Self {
            scheme,
            digest: digest.to_string(),
        })
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.digest)
    }
}

impl FromStr for SourceKey {
    type Err = SourceCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The scheme itself can contain ':'-free dots only, but `tar.gz`
        // style schemes make rsplit the wrong tool; the digest never
        // contains ':', so split at the last colon.
        let (scheme, digest) = s.rsplit_once(':').ok_or(SourceCacheError::UnknownScheme {
            scheme: s.to_string(),
        })?;
        Self::new(scheme.parse()?, digest)
    }
}

impl Serialize for SourceKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SourceKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdist_common::Digest;

    #[test]
    fn display_roundtrip() {
        let digest = Digest::from_data(b"archive bytes").to_string();
        let key: SourceKey = format!("tar.gz:{digest}").parse().unwrap();
        assert_eq!(key.scheme, Scheme::TarGz);
        assert_eq!(key.digest, digest);
        assert_eq!(key.to_string(), format!("tar.gz:{digest}"));
    }

    #[test]
    fn git_keys_use_commit_hashes() {
        let commit = "c5ccca92c5f136833ad85614feb2aa4f5bd8b7c3";
        let key: SourceKey = format!("git:{commit}").parse().unwrap();
        assert_eq!(key.scheme, Scheme::Git);
        assert_eq!(key.digest, commit);
    }

    #[test]
    fn git_keys_reject_short_commits() {
        assert!("git:c5ccca9".parse::<SourceKey>().is_err());
    }

    #[test]
    fn unknown_scheme_rejected() {
        let digest = Digest::from_data(b"x").to_string();
        let err = format!("rar:{digest}").parse::<SourceKey>().unwrap_err();
        assert!(matches!(err, SourceCacheError::UnknownScheme { .. }));
    }

    #[test]
    fn archive_digest_must_be_valid() {
        assert!("tar.gz:nonsense".parse::<SourceKey>().is_err());
    }

    #[test]
    fn scheme_from_url() {
        assert_eq!(Scheme::from_url("http://x/a.tar.gz").unwrap(), Scheme::TarGz);
        assert_eq!(Scheme::from_url("http://x/a.tgz").unwrap(), Scheme::TarGz);
        assert_eq!(Scheme::from_url("file:/x/a.tar.bz2").unwrap(), Scheme::TarBz2);
        assert_eq!(Scheme::from_url("http://x/a.zip?dl=1").unwrap(), Scheme::Zip);
        assert!(Scheme::from_url("http://x/a.foo").is_err());
    }
}
