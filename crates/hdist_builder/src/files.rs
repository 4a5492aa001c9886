//! The files DSL: materializing inline files from a spec document.
//!
//! Used by `hit build-write-files` to embed small text files (build
//! scripts, configuration) directly in a build spec. Order does not
//! affect hashing; contents are UTF-8.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hdist_runner::substitute;

use crate::error::BuildError;

/// One inline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    /// Target filename; variables are substituted, so `$ARTIFACT/name`
    /// works.
    pub target: String,
    /// Contents as lines joined with `\n`. Exclusive with `object`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Vec<String>>,
    /// A document serialized to the file as JSON. Exclusive with `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Whether to set the executable permission bits.
    #[serde(default)]
    pub executable: bool,
    /// Whether to substitute variables inside the text itself.
    #[serde(default)]
    pub expandvars: bool,
}

/// Writes the given file specs relative to `cwd`.
///
/// Parent directories are created; targets are created exclusively, so
/// overwriting an existing file is an error.
pub fn execute_files_dsl(
    files: &[FileSpec],
    env: &BTreeMap<String, String>,
    cwd: &Path,
) -> Result<(), BuildError> {
    for file_spec in files {
        let target = substitute(&file_spec.target, env).map_err(|e| BuildError::Tool {
            tool: "build-write-files".to_string(),
            reason: e.to_string(),
        })?;
        let path = if Path::new(&target).is_absolute() {
            std::path::PathBuf::from(&target)
        } else {
            cwd.join(&target)
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }

        let contents = match (&file_spec.text, &file_spec.object) {
            (Some(text), None) => {
                let mut joined = text.join("\n");
                if file_spec.expandvars {
                    joined = substitute(&joined, env).map_err(|e| BuildError::Tool {
                        tool: "build-write-files".to_string(),
                        reason: e.to_string(),
                    })?;
                }
                joined
            }
            (None, Some(object)) => {
                if file_spec.expandvars {
                    return Err(BuildError::Tool {
                        tool: "build-write-files".to_string(),
                        reason: "\"expandvars\" is only supported for \"text\"".to_string(),
                    });
                }
                let mut text = serde_json::to_string_pretty(object)
                    .expect("json objects always serialize");
                text.push('\n');
                text
            }
            _ => {
                return Err(BuildError::Tool {
                    tool: "build-write-files".to_string(),
                    reason: "each file must contain exactly one of \"text\" and \"object\""
                        .to_string(),
                })
            }
        };

        let mode = if file_spec.executable { 0o700 } else { 0o600 };
        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
            .map_err(|e| BuildError::io(&path, e))?;
        handle
            .write_all(contents.as_bytes())
            .map_err(|e| BuildError::io(&path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("BAR".to_string(), "bar".to_string());
        env
    }

    fn specs(doc: Value) -> Vec<FileSpec> {
        serde_json::from_value(doc).unwrap()
    }

    #[test]
    fn writes_text_files() {
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([
            {"target": "build.sh", "text": ["set -e", "make"]}
        ]));
        execute_files_dsl(&files, &env(), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("build.sh")).unwrap(),
            "set -e\nmake"
        );
    }

    #[test]
    fn target_substitution_and_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([
            {"target": "$BAR/foo", "text": ["foo${BAR}foo"], "expandvars": true}
        ]));
        execute_files_dsl(&files, &env(), dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("bar/foo")).unwrap(),
            "foobarfoo"
        );
    }

    #[test]
    fn text_without_expandvars_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([
            {"target": "f", "text": ["${BAR}"]}
        ]));
        execute_files_dsl(&files, &env(), dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "${BAR}");
    }

    #[test]
    fn object_serializes_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([
            {"target": "conf.json", "object": {"b": 2, "a": 1}}
        ]));
        execute_files_dsl(&files, &env(), dir.path()).unwrap();
        let parsed: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("conf.json")).unwrap())
                .unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([
            {"target": "run.sh", "text": ["#!/bin/sh"], "executable": true},
            {"target": "data", "text": ["x"]}
        ]));
        execute_files_dsl(&files, &env(), dir.path()).unwrap();
        let script = fs::metadata(dir.path().join("run.sh")).unwrap().permissions();
        let data = fs::metadata(dir.path().join("data")).unwrap().permissions();
        assert_ne!(script.mode() & 0o100, 0);
        assert_eq!(data.mode() & 0o111, 0);
    }

    #[test]
    fn refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([{"target": "f", "text": ["x"]}]));
        execute_files_dsl(&files, &env(), dir.path()).unwrap();
        assert!(execute_files_dsl(&files, &env(), dir.path()).is_err());
    }

    #[test]
    fn requires_exactly_one_content_form() {
        let dir = tempfile::tempdir().unwrap();
        let both = specs(json!([{"target": "f", "text": ["x"], "object": {}}]));
        assert!(execute_files_dsl(&both, &env(), dir.path()).is_err());
        let neither = specs(json!([{"target": "f"}]));
        assert!(execute_files_dsl(&neither, &env(), dir.path()).is_err());
    }

    #[test]
    fn expandvars_on_object_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let files = specs(json!([{"target": "f", "object": {}, "expandvars": true}]));
        assert!(execute_files_dsl(&files, &env(), dir.path()).is_err());
    }
}
