//! The secure digest type underlying every identity in the system.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Number of digest bytes retained from the SHA-256 output.
///
/// 160 bits encode to exactly 32 base-32 characters with no padding, which
/// keeps on-disk names fixed-width.
const DIGEST_LEN: usize = 20;

/// Length of the rendered digest string.
pub const DIGEST_STR_LEN: usize = 32;

/// A secure content digest.
///
/// Computed as SHA-256 truncated to 160 bits, rendered as a 32-character
/// lowercase base-32 string over the alphabet `a-z2-7`. Artifact IDs, source
/// cache keys, and on-disk store paths are all derived from this rendering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Computes the digest of a byte slice.
    pub fn from_data(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_sha256(hasher)
    }

    /// Extracts a digest from a finished SHA-256 state.
    pub fn from_sha256(hasher: Sha256) -> Self {
        let full = hasher.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&full[..DIGEST_LEN]);
        Self(bytes)
    }

    /// Returns the first `len` characters of the rendered digest.
    ///
    /// Used for the `{shorthash}` component of artifact directory names.
    pub fn short(&self, len: usize) -> String {
        let mut s = self.to_string();
        s.truncate(len.min(DIGEST_STR_LEN));
        s
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE32_NOPAD.encode(&self.0).to_ascii_lowercase())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

/// Error parsing a digest from its string rendering.
#[derive(Debug, thiserror::Error)]
#[error("invalid digest \"{input}\": {reason}")]
pub struct ParseDigestError {
    /// The rejected input.
    pub input: String,
    /// Description of the problem.
    pub reason: String,
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_STR_LEN {
            return Err(ParseDigestError {
                input: s.to_string(),
                reason: format!("expected {DIGEST_STR_LEN} characters, got {}", s.len()),
            });
        }
        let upper = s.to_ascii_uppercase();
        let decoded = BASE32_NOPAD
            .decode(upper.as_bytes())
            .map_err(|e| ParseDigestError {
                input: s.to_string(),
                reason: e.to_string(),
            })?;
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental digest computation over a byte stream.
///
/// Implements [`Write`] so that downloads can be hashed while they are
/// streamed to disk.
#[derive(Default)]
pub struct DigestWriter {
    hasher: Sha256,
}

impl DigestWriter {
    /// Creates a fresh hashing state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finishes the stream and returns its digest.
    pub fn finish(self) -> Digest {
        Digest::from_sha256(self.hasher)
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
