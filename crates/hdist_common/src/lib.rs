//! Shared foundational types for the hdist build artifact manager.
//!
//! This crate provides the secure digest type every identity in the system
//! reduces to, the canonical document hasher that derives digests from
//! structured specification documents, artifact identifiers, and the small
//! set of filesystem primitives (atomic symlinks, write protection, gzip
//! compression) the store and builder rely on.

#![warn(missing_docs)]

pub mod digest;
pub mod fileutils;
pub mod hasher;
pub mod ident;

pub use digest::{Digest, DigestWriter, ParseDigestError};
pub use hasher::{DocumentHasher, HashError, HashValue, NOHASH_PREFIX};
pub use ident::{assert_safe_name, ArtifactId, ParseArtifactIdError, VIRTUAL_PREFIX};
