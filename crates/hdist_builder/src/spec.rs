//! Build specification canonicalization and identity.
//!
//! A build spec is a JSON document with required keys `name`, `version`
//! and `build`, an optional `sources` list, and any number of extra keys
//! that flow through untouched (so experimental metadata survives
//! round-trips). Canonicalization validates the names, normalizes the
//! embedded job spec, and leaves the document in the form that is hashed:
//! after this transform the document's digest *is* the artifact ID's
//! digest.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hdist_common::{assert_safe_name, hasher, ArtifactId};
use hdist_runner::JobSpec;
use hdist_source_cache::SourceKey;

use crate::error::BuildError;

/// One entry of a spec's `sources` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// The source cache key.
    pub key: SourceKey,
    /// Directory inside the build dir to unpack into.
    #[serde(default = "default_target")]
    pub target: String,
    /// Number of leading path components to strip instead of the
    /// automatic common-prefix strip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strip: Option<usize>,
}

fn default_target() -> String {
    ".".to_string()
}

/// A canonicalized build specification.
///
/// Wrapping the document signals that it has been canonicalized and makes
/// the derived artifact ID available without rehashing.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    doc: Value,
    version: String,
    build: JobSpec,
    sources: Vec<SourceRecord>,
    artifact_id: ArtifactId,
}

impl BuildSpec {
    /// Canonicalizes a free-form spec document.
    pub fn from_value(doc: Value) -> Result<BuildSpec, BuildError> {
        let Value::Object(mut map) = doc else {
            return Err(BuildError::Spec {
                reason: "build spec must be an object".to_string(),
            });
        };

        let name = required_str(&map, "name")?;
        let version = required_str(&map, "version")?;
        assert_safe_name(&name).map_err(|e| BuildError::Spec {
            reason: e.to_string(),
        })?;
        assert_safe_name(&version).map_err(|e| BuildError::Spec {
            reason: e.to_string(),
        })?;

        let build_value = map.get("build").cloned().ok_or_else(|| BuildError::Spec {
            reason: "missing required key \"build\"".to_string(),
        })?;
        let build: JobSpec =
            serde_json::from_value(build_value).map_err(|e| BuildError::Spec {
                reason: format!("bad \"build\" section: {e}"),
            })?;
        let build = build.canonicalize().map_err(|e| BuildError::Spec {
            reason: e.to_string(),
        })?;
        map.insert(
            "build".to_string(),
            serde_json::to_value(&build).expect("job specs always serialize"),
        );

        let sources: Vec<SourceRecord> = match map.get("sources") {
            None => Vec::new(),
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| BuildError::Spec {
                reason: format!("bad \"sources\" section: {e}"),
            })?,
        };

        let doc = Value::Object(map);
        let digest = hasher::json_digest(&doc)?;
        let artifact_id = ArtifactId::new(&name, digest).map_err(|e| BuildError::Spec {
            reason: e.to_string(),
        })?;

        Ok(BuildSpec {
            doc,
            version,
            build,
            sources,
            artifact_id,
        })
    }

    /// Parses and canonicalizes a spec from JSON text.
    pub fn from_json(text: &str) -> Result<BuildSpec, BuildError> {
        let doc: Value = serde_json::from_str(text).map_err(|e| BuildError::Spec {
            reason: format!("spec is not valid JSON: {e}"),
        })?;
        Self::from_value(doc)
    }

    /// The derived artifact ID.
    pub fn artifact_id(&self) -> &ArtifactId {
        &self.artifact_id
    }

    /// The artifact name.
    pub fn name(&self) -> &str {
        &self.artifact_id.name
    }

    /// The spec version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The canonical job spec.
    pub fn build(&self) -> &JobSpec {
        &self.build
    }

    /// The declared sources.
    pub fn sources(&self) -> &[SourceRecord] {
        &self.sources
    }

    /// The canonical document.
    pub fn doc(&self) -> &Value {
        &self.doc
    }

    /// The canonical rendering persisted as `build.json`: pretty-printed
    /// with sorted keys and a trailing newline.
    pub fn canonical_json(&self) -> String {
        let mut text =
            serde_json::to_string_pretty(&self.doc).expect("canonical docs always serialize");
        text.push('\n');
        text
    }
}

fn required_str(
    map: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, BuildError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BuildError::Spec {
            reason: format!("missing required key \"{key}\""),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Value {
        json!({"name": "foo", "version": "na", "build": {"commands": []}})
    }

    #[test]
    fn minimal_spec_canonicalizes() {
        let spec = BuildSpec::from_value(minimal()).unwrap();
        assert_eq!(spec.name(), "foo");
        assert_eq!(spec.version(), "na");
        assert!(spec.sources().is_empty());
        assert_eq!(spec.artifact_id().name, "foo");
    }

    #[test]
    fn digest_is_stable_across_field_order() {
        // serde_json objects sort keys, so spell the same spec two ways.
        let a = BuildSpec::from_value(json!({
            "name": "foo", "version": "1", "build": {"commands": [], "env": {"A": "1"}}
        }))
        .unwrap();
        let b = BuildSpec::from_value(json!({
            "build": {"env": {"A": "1"}, "commands": []}, "version": "1", "name": "foo"
        }))
        .unwrap();
        assert_eq!(a.artifact_id(), b.artifact_id());
    }

    #[test]
    fn digest_is_stable_across_defaults() {
        let explicit = BuildSpec::from_value(json!({
            "name": "foo", "version": "1",
            "build": {"commands": [], "env": {}, "nohash_env": {}, "import": []}
        }))
        .unwrap();
        let implicit = BuildSpec::from_value(json!({
            "name": "foo", "version": "1", "build": {"commands": []}
        }))
        .unwrap();
        assert_eq!(explicit.artifact_id(), implicit.artifact_id());
    }

    #[test]
    fn import_order_does_not_matter() {
        let make = |imports: Value| {
            BuildSpec::from_value(json!({
                "name": "foo", "version": "1",
                "build": {"commands": [], "import": imports}
            }))
            .unwrap()
        };
        let a = make(json!([{"id": "virtual:b"}, {"id": "virtual:a"}]));
        let b = make(json!([{"id": "virtual:a"}, {"id": "virtual:b"}]));
        assert_eq!(a.artifact_id(), b.artifact_id());
    }

    #[test]
    fn nohash_keys_do_not_affect_identity() {
        let plain = BuildSpec::from_value(minimal()).unwrap();
        let annotated = BuildSpec::from_value(json!({
            "name": "foo", "version": "na",
            "build": {"commands": []},
            "nohash_notes": "anything at all"
        }))
        .unwrap();
        assert_eq!(plain.artifact_id(), annotated.artifact_id());
    }

    #[test]
    fn unknown_fields_are_preserved_and_hashed() {
        let with = BuildSpec::from_value(json!({
            "name": "foo", "version": "na",
            "build": {"commands": []},
            "parameters": {"links": []}
        }))
        .unwrap();
        assert!(with.doc().get("parameters").is_some());
        let without = BuildSpec::from_value(minimal()).unwrap();
        assert_ne!(with.artifact_id(), without.artifact_id());
    }

    #[test]
    fn commands_affect_identity() {
        let a = BuildSpec::from_value(minimal()).unwrap();
        let b = BuildSpec::from_value(json!({
            "name": "foo", "version": "na",
            "build": {"commands": [{"set": "X", "value": "1"}]}
        }))
        .unwrap();
        assert_ne!(a.artifact_id(), b.artifact_id());
    }

    #[test]
    fn bad_names_rejected() {
        for (name, version) in [("foo bar", "1"), ("", "1"), ("ok", "1 2")] {
            let result = BuildSpec::from_value(json!({
                "name": name, "version": version, "build": {"commands": []}
            }));
            assert!(result.is_err(), "{name:?}/{version:?}");
        }
    }

    #[test]
    fn missing_required_keys_rejected() {
        assert!(BuildSpec::from_value(json!({"name": "foo", "build": {}})).is_err());
        assert!(BuildSpec::from_value(json!({"name": "foo", "version": "1"})).is_err());
        assert!(BuildSpec::from_value(json!({"version": "1", "build": {}})).is_err());
    }

    #[test]
    fn sources_are_parsed_with_defaults() {
        let digest = hdist_common::Digest::from_data(b"tarball").to_string();
        let spec = BuildSpec::from_value(json!({
            "name": "foo", "version": "1", "build": {"commands": []},
            "sources": [
                {"key": format!("tar.gz:{digest}")},
                {"key": format!("tar.gz:{digest}"), "target": "subdir", "strip": 1},
            ]
        }))
        .unwrap();
        assert_eq!(spec.sources()[0].target, ".");
        assert_eq!(spec.sources()[0].strip, None);
        assert_eq!(spec.sources()[1].target, "subdir");
        assert_eq!(spec.sources()[1].strip, Some(1));
    }

    #[test]
    fn canonical_json_is_sorted_and_newline_terminated() {
        let spec = BuildSpec::from_value(minimal()).unwrap();
        let text = spec.canonical_json();
        assert!(text.ends_with('\n'));
        let build_pos = text.find("\"build\"").unwrap();
        let name_pos = text.find("\"name\"").unwrap();
        let version_pos = text.find("\"version\"").unwrap();
        assert!(build_pos < name_pos && name_pos < version_pos);
    }
}
