//! Configuration loading for the hdist stores.
//!
//! All on-disk locations (source cache, artifact database, artifact root,
//! temporary build area) and fetch mirrors come from a single `hdist.toml`.
//! Relative paths are resolved against the directory the file was loaded
//! from, so a whole store can be relocated by moving one directory.

#![warn(missing_docs)]

mod error;
mod types;

use std::path::Path;

pub use error::ConfigError;
pub use types::{BuildConfig, KeepPolicy, SourceCacheConfig, StoreConfig, StorePaths};

/// Loads and validates an `hdist.toml` from `dir`.
pub fn load_config(dir: &Path) -> Result<StoreConfig, ConfigError> {
    let config_path = dir.join("hdist.toml");
    let content = std::fs::read_to_string(&config_path).map_err(|e| ConfigError::Io {
        path: config_path.clone(),
        source: e,
    })?;
    let mut config = load_config_from_str(&content)?;
    config.resolve_relative_to(dir);
    Ok(config)
}

/// Parses and validates an `hdist.toml` document from a string.
///
/// Relative paths are left untouched; useful for testing without
/// filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<StoreConfig, ConfigError> {
    let config: StoreConfig =
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if !config.store.artifact_pattern.contains("{shorthash}") {
        return Err(ConfigError::InvalidValue {
            field: "store.artifact_pattern".to_string(),
            reason: "must contain at least {shorthash}".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parse_minimal_config() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.store.db, PathBuf::from("db"));
        assert_eq!(config.store.artifacts, PathBuf::from("opt"));
        assert_eq!(config.store.build_temp, PathBuf::from("bld"));
        assert_eq!(config.store.artifact_pattern, "{name}/{shorthash}");
        assert_eq!(config.source_cache.path, PathBuf::from("src"));
        assert!(config.source_cache.mirrors.is_empty());
        assert_eq!(config.build.keep_build, KeepPolicy::Never);
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[store]
db = "database"
artifacts = "artifacts"
build_temp = "tmp/builds"
artifact_pattern = "{name}-{version}/{shorthash}"

[source_cache]
path = "sources"
mirrors = ["https://mirror.example.com/hdist", "file:/var/mirror"]

[build]
keep_build = "error"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.store.db, PathBuf::from("database"));
        assert_eq!(config.store.artifact_pattern, "{name}-{version}/{shorthash}");
        assert_eq!(config.source_cache.mirrors.len(), 2);
        assert_eq!(config.build.keep_build, KeepPolicy::OnError);
    }

    #[test]
    fn pattern_without_shorthash_rejected() {
        let toml = r#"
[store]
artifact_pattern = "{name}-{version}"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(err.to_string().contains("{shorthash}"));
    }

    #[test]
    fn keep_policy_parse() {
        assert_eq!("never".parse::<KeepPolicy>().unwrap(), KeepPolicy::Never);
        assert_eq!("error".parse::<KeepPolicy>().unwrap(), KeepPolicy::OnError);
        assert_eq!("always".parse::<KeepPolicy>().unwrap(), KeepPolicy::Always);
        assert!("sometimes".parse::<KeepPolicy>().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        let mut config = load_config_from_str("").unwrap();
        config.resolve_relative_to(Path::new("/store/root"));
        assert_eq!(config.store.db, PathBuf::from("/store/root/db"));
        assert_eq!(config.source_cache.path, PathBuf::from("/store/root/src"));
    }

    #[test]
    fn absolute_paths_left_alone() {
        let toml = r#"
[store]
db = "/abs/db"
"#;
        let mut config = load_config_from_str(toml).unwrap();
        config.resolve_relative_to(Path::new("/store/root"));
        assert_eq!(config.store.db, PathBuf::from("/abs/db"));
    }
}
