//! On-disk registry of built artifacts.
//!
//! The authoritative database is a tree of relative symlinks,
//! `db/artifacts/<digest[..2]>/<digest[2..]>`, each pointing at an artifact
//! directory materialized under the artifact root. Artifact directories are
//! named from a configurable pattern whose `{shorthash}` component starts
//! at twelve digest characters and grows on collision, so two different
//! digests never occupy the same directory.
//!
//! The store is designed for cooperative multi-process use without locks:
//! registration is an atomic symlink creation, racing identical builds
//! converge on one winner, and broken links are healed on access.

#![warn(missing_docs)]

mod error;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use hdist_common::digest::DIGEST_STR_LEN;
use hdist_common::{fileutils, ArtifactId};

pub use error::StoreError;

/// Initial `{shorthash}` length in artifact directory names.
pub const SHORT_HASH_LEN: usize = 12;

/// Outcome of staging an artifact directory.
#[derive(Debug)]
pub enum StageOutcome {
    /// A fresh directory was created for this build attempt.
    Created(PathBuf),
    /// A racing worker registered the same artifact first; the returned
    /// path is the winner's directory and no staging happened.
    AlreadyRegistered(PathBuf),
}

/// Manages the directory of build artifacts.
#[derive(Debug)]
pub struct BuildStore {
    temp_build_dir: PathBuf,
    db_dir: PathBuf,
    artifact_root: PathBuf,
    artifact_path_pattern: String,
    short_hash_len: usize,
}

impl BuildStore {
    /// Opens a store, creating its directories if needed.
    ///
    /// `db_dir` is the database root (an `artifacts/` level is appended);
    /// `artifact_root` bounds everything deletion may touch;
    /// `artifact_path_pattern` names new artifact directories and must
    /// contain `{shorthash}`.
    pub fn open(
        temp_build_dir: &Path,
        db_dir: &Path,
        artifact_root: &Path,
        artifact_path_pattern: &str,
    ) -> Result<Self, StoreError> {
        if !artifact_path_pattern.contains("{shorthash}") {
            return Err(StoreError::InvalidPattern {
                pattern: artifact_path_pattern.to_string(),
                reason: "must contain at least {shorthash}".to_string(),
            });
        }
        let db_dir = db_dir.join("artifacts");
        for dir in [temp_build_dir, &db_dir, artifact_root] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        // Canonical roots keep the relative db links and the containment
        // checks immune to symlinked parents.
        let canonical = |dir: &Path| fs::canonicalize(dir).map_err(|e| StoreError::io(dir, e));
        Ok(Self {
            temp_build_dir: canonical(temp_build_dir)?,
            db_dir: canonical(&db_dir)?,
            artifact_root: canonical(artifact_root)?,
            artifact_path_pattern: artifact_path_pattern.to_string(),
            short_hash_len: SHORT_HASH_LEN,
        })
    }

    /// The temporary build area.
    pub fn temp_build_dir(&self) -> &Path {
        &self.temp_build_dir
    }

    /// The root under which artifact directories live.
    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    fn db_link(&self, id: &ArtifactId) -> PathBuf {
        let digest = id.digest.to_string();
        self.db_dir.join(&digest[..2]).join(&digest[2..])
    }

    /// Follows the database entry for `id`; heals (removes) entries whose
    /// target directory has disappeared.
    fn resolve_db(&self, id: &ArtifactId) -> Result<Option<PathBuf>, StoreError> {
        let link = self.db_link(id);
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&link, e)),
        };
        let joined = link
            .parent()
            .map(|p| p.join(&target))
            .unwrap_or(target);
        match fs::canonicalize(&joined) {
            Ok(dir) => Ok(Some(dir)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    "artifact {id} has been manually removed; removing database entry"
                );
                fileutils::silent_unlink(&link).map_err(|e| StoreError::io(&link, e))?;
                Ok(None)
            }
            Err(e) => Err(StoreError::io(&joined, e)),
        }
    }

    /// Resolves an artifact ID to its directory, or `None` if it has not
    /// been built.
    ///
    /// A missing entry whose short-hash prefix matches a registered
    /// artifact of a different digest is reported as
    /// [`StoreError::IllegalStore`] rather than as absent: such a lookup
    /// requires full-digest disambiguation that the store did not record.
    pub fn resolve(&self, id: &ArtifactId) -> Result<Option<PathBuf>, StoreError> {
        if let Some(dir) = self.resolve_db(id)? {
            return Ok(Some(dir));
        }
        let digest = id.digest.to_string();
        let bucket = self.db_dir.join(&digest[..2]);
        let rest = &digest[2..];
        let prefix_rest = &digest[2..self.short_hash_len];
        if bucket.is_dir() {
            for entry in fs::read_dir(&bucket).map_err(|e| StoreError::io(&bucket, e))? {
                let entry = entry.map_err(|e| StoreError::io(&bucket, e))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(prefix_rest) && name != rest {
                    return Err(StoreError::IllegalStore {
                        requested: id.to_string(),
                        existing: format!("{}{}", &digest[..2], name),
                        prefix_len: self.short_hash_len,
                    });
                }
            }
        }
        Ok(None)
    }

    /// True if the artifact has been built and registered.
    pub fn is_present(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        Ok(self.resolve(id)?.is_some())
    }

    /// Creates the directory a build will populate.
    ///
    /// The pattern's `{shorthash}` starts at twelve characters and is
    /// extended one character at a time while the rendered path is taken
    /// by some unrelated artifact. Before each extension the database is
    /// consulted: if a racing worker registered this same artifact in the
    /// meantime, staging is abandoned and the winner's path returned.
    pub fn make_artifact_dir(
        &self,
        id: &ArtifactId,
        version: &str,
    ) -> Result<StageOutcome, StoreError> {
        let mut hash_len = self.short_hash_len;
        loop {
            let shorthash = id.digest.short(hash_len);
            let rel = render_pattern(&self.artifact_path_pattern, &id.name, version, &shorthash);
            let dir = self.artifact_root.join(rel);
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(StageOutcome::Created(dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(existing) = self.resolve_db(id)? {
                        return Ok(StageOutcome::AlreadyRegistered(existing));
                    }
                    if hash_len >= DIGEST_STR_LEN {
                        return Err(StoreError::IllegalStore {
                            requested: id.to_string(),
                            existing: dir.display().to_string(),
                            prefix_len: hash_len,
                        });
                    }
                    hash_len += 1;
                }
                Err(e) => return Err(StoreError::io(&dir, e)),
            }
        }
    }

    /// Registers a populated artifact directory in the database.
    ///
    /// On return the directory is either registered or removed: when a
    /// racing identical build already holds the entry, the staged
    /// directory is deleted and the winner's path is returned as a
    /// successful result.
    pub fn register_artifact(
        &self,
        id: &ArtifactId,
        artifact_dir: &Path,
    ) -> Result<PathBuf, StoreError> {
        let link = self.db_link(id);
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        if fs::symlink_metadata(&link).is_ok() {
            tracing::warn!("artifact {id} was registered concurrently; discarding staged build");
            fs::remove_dir_all(artifact_dir).map_err(|e| StoreError::io(artifact_dir, e))?;
            return match self.resolve_db(id)? {
                Some(winner) => Ok(winner),
                // The winner vanished between the check and the read; the
                // staged copy is already gone, so surface it as missing.
                None => Err(StoreError::io(
                    &link,
                    io::Error::new(io::ErrorKind::NotFound, "registration race left no winner"),
                )),
            };
        }

        let rel = relative_to(
            link.parent().unwrap_or(Path::new("")),
            artifact_dir,
        );
        fileutils::atomic_symlink(&rel, &link).map_err(|e| StoreError::io(&link, e))?;
        Ok(artifact_dir.to_path_buf())
    }

    /// Creates a uniquely-named temporary build directory.
    ///
    /// The name is `name-version-shorthash`, with a `-N` suffix appended
    /// under contention.
    pub fn make_build_dir(&self, id: &ArtifactId, version: &str) -> Result<PathBuf, StoreError> {
        let base = format!(
            "{}-{}-{}",
            id.name,
            version,
            id.digest.short(self.short_hash_len)
        );
        let mut candidate = self.temp_build_dir.join(&base);
        let mut i = 0;
        loop {
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    tracing::debug!("created build dir {}", candidate.display());
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    i += 1;
                    candidate = self.temp_build_dir.join(format!("{base}-{i}"));
                }
                Err(e) => return Err(StoreError::io(&candidate, e)),
            }
        }
    }

    /// Removes a build directory created by [`Self::make_build_dir`].
    pub fn remove_build_dir(&self, build_dir: &Path) -> Result<(), StoreError> {
        tracing::debug!("removing build dir {}", build_dir.display());
        fileutils::rmtree_up_to(build_dir, &self.temp_build_dir)
            .map_err(|e| StoreError::io(build_dir, e))
    }

    /// Deletes a single artifact: its directory and its database entry.
    ///
    /// Returns `false` when the artifact was not present. Directories
    /// outside the artifact root are refused with a warning and the entry
    /// is left in place.
    pub fn delete(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        let Some(dir) = self.resolve_db(id)? else {
            return Ok(false);
        };
        if !dir.starts_with(&self.artifact_root) {
            tracing::warn!(
                "{} escapes {}, doing nothing with it",
                dir.display(),
                self.artifact_root.display()
            );
            return Ok(false);
        }
        fileutils::rmtree_up_to(&dir, &self.artifact_root).map_err(|e| StoreError::io(&dir, e))?;
        let link = self.db_link(id);
        fileutils::silent_unlink(&link).map_err(|e| StoreError::io(&link, e))?;
        Ok(true)
    }

    /// Removes every artifact: the database, the materialized directories,
    /// and the temporary build area.
    pub fn delete_all(&self) -> Result<(), StoreError> {
        for entry in walkdir::WalkDir::new(&self.db_dir).min_depth(2) {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.db_dir.clone(),
                source: io::Error::other(e),
            })?;
            if !entry.path_is_symlink() {
                tracing::warn!("{} is not a symlink", entry.path().display());
                continue;
            }
            let target = match fs::canonicalize(entry.path()) {
                Ok(t) => t,
                Err(_) => {
                    tracing::warn!(
                        "{} referenced in db but does not exist",
                        entry.path().display()
                    );
                    continue;
                }
            };
            if !target.starts_with(&self.artifact_root) {
                tracing::warn!(
                    "{} escapes {}, doing nothing with it",
                    target.display(),
                    self.artifact_root.display()
                );
                continue;
            }
            fs::remove_dir_all(&target).map_err(|e| StoreError::io(&target, e))?;
        }
        for dir in [&self.db_dir, &self.temp_build_dir, &self.artifact_root] {
            clear_dir(dir)?;
        }
        Ok(())
    }
}

fn clear_dir(dir: &Path) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))? {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let path = entry.path();
        let result = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| StoreError::io(&path, e))?;
    }
    Ok(())
}

/// Renders the artifact path pattern.
fn render_pattern(pattern: &str, name: &str, version: &str, shorthash: &str) -> PathBuf {
    let rendered = pattern
        .replace("{name}", name)
        .replace("{version}", version)
        .replace("{shorthash}", shorthash);
    PathBuf::from(rendered)
}

/// Computes a relative path from `from_dir` to `to` (both absolute).
fn relative_to(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir.components().collect();
    let to_parts: Vec<Component> = to.components().collect();
    let common = from
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for part in &to_parts[common..] {
        rel.push(part.as_os_str());
    }
    rel
}
