//! Canonical serialization of structured documents into a secure digest.
//!
//! Build specifications are hashed by serializing them into a byte stream
//! with a type-and-length envelope around every value, then running SHA-256
//! over the stream. The envelope guarantees that no two structurally
//! distinct documents share a serialization, so the digest can serve as the
//! document's identity.
//!
//! Envelope grammar (`L` is a decimal ASCII count followed by `:`):
//!
//! - bytes / string: `B<L>:<bytes>` (strings are UTF-8 encoded first)
//! - integer: `I<L>:<decimal>`
//! - float: `F` followed by 8 bytes, little-endian IEEE-754 double
//! - sequence: `L<L>:<items...>`
//! - mapping: `D<L>:<key, value pairs in ascending key order...>`
//! - true / false / null: single byte `T` / `F` / `N`
//! - opaque object: `O<L>:<type-tag><L>:<digest string>`
//!
//! Mapping keys whose name begins with [`NOHASH_PREFIX`] are stripped
//! recursively before hashing, so documents can carry untracked metadata
//! (parallelism hints, local annotations) without influencing their digest.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::digest::Digest;

/// Mapping keys starting with this prefix never contribute to a digest.
pub const NOHASH_PREFIX: &str = "nohash";

/// A value in the canonical hashing domain.
///
/// This is a superset of the JSON data model: byte strings and opaque
/// pre-hashed objects exist here but have no JSON rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum HashValue {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer. Wide enough to hold any JSON integer.
    Int(i128),
    /// An IEEE-754 double. NaN has no canonical bit pattern and is rejected
    /// at hashing time.
    Float(f64),
    /// A raw byte string.
    Bytes(Vec<u8>),
    /// A Unicode string.
    Str(String),
    /// An ordered sequence.
    List(Vec<HashValue>),
    /// A string-keyed mapping. `BTreeMap` keeps keys in the byte order of
    /// their UTF-8 encoding, which is the order the envelope requires.
    Map(BTreeMap<String, HashValue>),
    /// A value that self-describes via a type tag and a precomputed digest.
    Opaque {
        /// Tag distinguishing this object's type from other opaque objects.
        type_tag: String,
        /// The precomputed content digest.
        digest: Digest,
    },
}

impl HashValue {
    /// Converts a JSON value into the hashing domain.
    ///
    /// Integer-valued numbers become [`HashValue::Int`]; all other numbers
    /// become [`HashValue::Float`].
    pub fn from_json(value: &Value) -> HashValue {
        match value {
            Value::Null => HashValue::Null,
            Value::Bool(b) => HashValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    HashValue::Int(i128::from(i))
                } else if let Some(u) = n.as_u64() {
                    HashValue::Int(i128::from(u))
                } else {
                    // serde_json numbers are i64, u64 or f64; this arm is
                    // the f64 case and cannot be NaN in valid JSON.
                    HashValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => HashValue::Str(s.clone()),
            Value::Array(items) => HashValue::List(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => HashValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Errors raised while hashing a document.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// A float without a canonical bit pattern was encountered.
    #[error("cannot hash NaN: no canonical bit pattern")]
    NanFloat,
}

/// Streams the canonical serialization of [`HashValue`] trees into SHA-256.
///
/// This is the single configuration point for hashing: every digest in the
/// system that is derived from a document goes through this type.
#[derive(Default)]
pub struct DocumentHasher {
    hasher: Sha256,
}

impl DocumentHasher {
    /// Creates an empty hashing state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `value` into the hash stream.
    pub fn update(&mut self, value: &HashValue) -> Result<(), HashError> {
        match value {
            HashValue::Null => self.raw(b"N"),
            HashValue::Bool(true) => self.raw(b"T"),
            HashValue::Bool(false) => self.raw(b"F"),
            HashValue::Int(i) => {
                let s = i.to_string();
                self.envelope(b'I', s.len());
                self.raw(s.as_bytes());
            }
            HashValue::Float(f) => {
                if f.is_nan() {
                    return Err(HashError::NanFloat);
                }
                self.raw(b"F");
                self.raw(&f.to_le_bytes());
            }
            HashValue::Bytes(b) => {
                self.envelope(b'B', b.len());
                self.raw(b);
            }
            HashValue::Str(s) => {
                self.envelope(b'B', s.len());
                self.raw(s.as_bytes());
            }
            HashValue::List(items) => {
                self.envelope(b'L', items.len());
                for item in items {
                    self.update(item)?;
                }
            }
            HashValue::Map(map) => {
                let kept: Vec<_> = map
                    .iter()
                    .filter(|(k, _)| !k.starts_with(NOHASH_PREFIX))
                    .collect();
                self.envelope(b'D', kept.len());
                for (key, val) in kept {
                    self.update(&HashValue::Str(key.clone()))?;
                    self.update(val)?;
                }
            }
            HashValue::Opaque { type_tag, digest } => {
                let digest_str = digest.to_string();
                self.envelope(b'O', type_tag.len());
                self.raw(type_tag.as_bytes());
                self.length(digest_str.len());
                self.raw(digest_str.as_bytes());
            }
        }
        Ok(())
    }

    /// Finishes the stream and returns the document digest.
    pub fn finish(self) -> Digest {
        Digest::from_sha256(self.hasher)
    }

    fn envelope(&mut self, tag: u8, len: usize) {
        self.hasher.update([tag]);
        self.length(len);
    }

    fn length(&mut self, len: usize) {
        self.hasher.update(len.to_string().as_bytes());
        self.hasher.update(b":");
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

/// Hashes a single JSON document.
pub fn json_digest(doc: &Value) -> Result<Digest, HashError> {
    let mut hasher = DocumentHasher::new();
    hasher.update(&HashValue::from_json(doc))?;
    Ok(hasher.finish())
}
