//! Configuration types deserialized from `hdist.toml`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The top-level store configuration.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    /// Artifact store locations and naming.
    #[serde(default)]
    pub store: StorePaths,
    /// Source cache location and mirrors.
    #[serde(default)]
    pub source_cache: SourceCacheConfig,
    /// Build behavior.
    #[serde(default)]
    pub build: BuildConfig,
}

impl StoreConfig {
    /// Resolves every relative path against `root`.
    pub fn resolve_relative_to(&mut self, root: &Path) {
        for path in [
            &mut self.store.db,
            &mut self.store.artifacts,
            &mut self.store.build_temp,
            &mut self.source_cache.path,
        ] {
            if path.is_relative() {
                *path = root.join(path.as_path());
            }
        }
    }
}

/// On-disk locations of the artifact store.
#[derive(Debug, Deserialize)]
pub struct StorePaths {
    /// Directory holding the symlink database (`artifacts/` is appended).
    #[serde(default = "default_db")]
    pub db: PathBuf,
    /// Root under which artifact directories are materialized. Deletion
    /// never touches anything outside this directory.
    #[serde(default = "default_artifacts")]
    pub artifacts: PathBuf,
    /// Directory for temporary build trees.
    #[serde(default = "default_build_temp")]
    pub build_temp: PathBuf,
    /// Pattern for artifact directory names; `{name}`, `{version}` and
    /// `{shorthash}` are substituted, and `{shorthash}` must be present.
    #[serde(default = "default_pattern")]
    pub artifact_pattern: String,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            db: default_db(),
            artifacts: default_artifacts(),
            build_temp: default_build_temp(),
            artifact_pattern: default_pattern(),
        }
    }
}

fn default_db() -> PathBuf {
    PathBuf::from("db")
}

fn default_artifacts() -> PathBuf {
    PathBuf::from("opt")
}

fn default_build_temp() -> PathBuf {
    PathBuf::from("bld")
}

fn default_pattern() -> String {
    "{name}/{shorthash}".to_string()
}

/// Source cache configuration.
#[derive(Debug, Deserialize)]
pub struct SourceCacheConfig {
    /// Root directory of the source cache.
    #[serde(default = "default_source_cache")]
    pub path: PathBuf,
    /// Mirror roots consulted before the primary URL when fetching by
    /// expected digest, in order.
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl Default for SourceCacheConfig {
    fn default() -> Self {
        Self {
            path: default_source_cache(),
            mirrors: Vec::new(),
        }
    }
}

fn default_source_cache() -> PathBuf {
    PathBuf::from("src")
}

/// Build behavior settings.
#[derive(Debug, Default, Deserialize)]
pub struct BuildConfig {
    /// When to keep temporary build directories.
    #[serde(default)]
    pub keep_build: KeepPolicy,
}

/// Policy for retaining the temporary build directory of an attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepPolicy {
    /// Remove the build directory whether the build succeeded or failed.
    #[default]
    Never,
    /// Keep the build directory only when the build failed.
    #[serde(rename = "error")]
    OnError,
    /// Always keep the build directory.
    Always,
}

impl FromStr for KeepPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(KeepPolicy::Never),
            "error" => Ok(KeepPolicy::OnError),
            "always" => Ok(KeepPolicy::Always),
            other => Err(ConfigError::InvalidValue {
                field: "keep_build".to_string(),
                reason: format!("\"{other}\" is not one of never, error, always"),
            }),
        }
    }
}
