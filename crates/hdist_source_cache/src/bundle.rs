//! The `files:` scheme: canonically-serialized file sets.
//!
//! A bundle is a JSON object mapping relative paths to file contents. The
//! key digest is the canonical document hash of that mapping, so it is
//! independent of the order files were supplied in and of the JSON
//! rendering itself.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use hdist_common::{hasher, Digest};

use crate::error::SourceCacheError;

/// An in-memory file set, sorted by path.
pub type FileSet = BTreeMap<String, String>;

/// Computes the digest identifying a file set.
pub fn bundle_digest(files: &FileSet) -> Digest {
    let doc = serde_json::json!(files);
    // The bundle is pure JSON; the only hashing failure mode is NaN,
    // which strings and maps cannot produce.
    hasher::json_digest(&doc).expect("file bundles contain no floats")
}

/// Serializes a file set into its stored pack representation.
pub fn encode_bundle(files: &FileSet) -> Vec<u8> {
    // serde_json maps over BTreeMap serialize in key order, which makes
    // the stored bytes deterministic as well.
    serde_json::to_vec(files).expect("string maps always serialize")
}

/// Decodes a stored pack back into a file set.
pub fn decode_bundle(bytes: &[u8], pack_path: &Path) -> Result<FileSet, SourceCacheError> {
    serde_json::from_slice(bytes).map_err(|e| SourceCacheError::MalformedBundle {
        path: pack_path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Writes a file set into `target`, creating parent directories.
///
/// Files are created exclusively: replaying a bundle over existing paths
/// is an error rather than an overwrite.
pub fn scatter_files(files: &FileSet, target: &Path) -> Result<(), SourceCacheError> {
    for (rel_path, contents) in files {
        let dest = target.join(rel_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| SourceCacheError::io(parent, e))?;
        }
        let mut open = fs::OpenOptions::new();
        open.write(true).create_new(true);
        use std::io::Write;
        let mut f = open
            .open(&dest)
            .map_err(|e| SourceCacheError::io(&dest, e))?;
        f.write_all(contents.as_bytes())
            .map_err(|e| SourceCacheError::io(&dest, e))?;
    }
    Ok(())
}
