//! The job specification: imports, environment, and the command list.
//!
//! A job is the scripted portion of a build spec. Commands are structured
//! records rather than parsed strings; on the wire each command is a JSON
//! object whose single verb key discriminates the kind:
//!
//! ```json
//! {"set": "CFLAGS", "value": "-O2"}
//! {"append_path": "PATH", "value": "/opt/tool/bin"}
//! {"chdir": "src"}
//! {"cmd": ["./configure", "--prefix=$ARTIFACT"]}
//! {"cmd": ["pkg-config", "--cflags", "foo"], "to_var": "CFLAGS"}
//! {"cmd": ["echo", "hi"], "append_to_file": "greeting"}
//! {"hit": ["logpipe", "mylog", "WARNING"], "to_var": "LOG"}
//! {"commands": [ ... ]}
//! ```
//!
//! Auxiliary keys attach to a command: `value` / `nohash_value` carry
//! assignment payloads, `env` overlays variables for one command, and
//! `inputs` materializes temporary files exposed as `$in0`, `$in1`, ...

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::JobError;

/// An import record binding another artifact into the job environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// The artifact ID, possibly `virtual:`-prefixed.
    pub id: String,
    /// Environment-variable prefix for `<REF>_DIR` / `<REF>_ID`, or null.
    #[serde(rename = "ref", default)]
    pub ref_name: Option<String>,
    /// IDs this import must precede in the environment composition.
    #[serde(default)]
    pub before: Vec<String>,
    /// Whether the artifact contributes `bin/`, `lib*` and `include/` to
    /// the search-path variables.
    #[serde(default = "default_true")]
    pub in_env: bool,
}

fn default_true() -> bool {
    true
}

/// How an assignment combines with an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// Replace the variable.
    Set,
    /// Append with a single-space separator.
    AppendFlag,
    /// Prepend with a single-space separator.
    PrependFlag,
    /// Append with the platform path separator.
    AppendPath,
    /// Prepend with the platform path separator.
    PrependPath,
}

impl AssignOp {
    fn verb(self) -> &'static str {
        match self {
            AssignOp::Set => "set",
            AssignOp::AppendFlag => "append_flag",
            AssignOp::PrependFlag => "prepend_flag",
            AssignOp::AppendPath => "append_path",
            AssignOp::PrependPath => "prepend_path",
        }
    }
}

/// A variable assignment command.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// How the value combines with any existing one.
    pub op: AssignOp,
    /// The variable name (not substituted).
    pub key: String,
    /// The value; substituted at execution time.
    pub value: String,
    /// True when the value was given as `nohash_value` and therefore does
    /// not contribute to the spec digest.
    pub nohash: bool,
}

/// Whether an exec command spawns a subprocess or dispatches in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    /// Spawn a subprocess.
    Cmd,
    /// Run the bundled `hit` tool in-process.
    Hit,
}

/// A command that runs something: `cmd` or `hit`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecCommand {
    /// Subprocess or in-process dispatch.
    pub kind: ExecKind,
    /// The argv; every element is substituted.
    pub argv: Vec<String>,
    /// Capture stdout (whitespace-trimmed) into this variable.
    pub to_var: Option<String>,
    /// Append stdout to this file (path substituted, relative to cwd).
    pub append_to_file: Option<String>,
    /// Extra environment entries for this command only.
    pub env: BTreeMap<String, String>,
    /// Temporary files materialized before the command and exposed as
    /// `$in0`, `$in1`, ...
    pub inputs: Vec<InputSpec>,
}

/// One entry of an `inputs` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// Lines joined with `\n`.
    Text {
        /// The lines.
        text: Vec<String>,
    },
    /// Verbatim contents.
    Str {
        /// The contents.
        string: String,
    },
    /// Canonical JSON rendering of a document.
    Json {
        /// The document.
        json: Value,
    },
}

/// A single job command.
#[derive(Debug, Clone, PartialEq)]
pub enum JobCommand {
    /// A variable assignment.
    Assign(Assignment),
    /// Change the working directory for subsequent commands in the scope.
    Chdir {
        /// The directory, relative to the current cwd; substituted.
        dir: String,
    },
    /// Run a subprocess or the in-process tool.
    Exec(ExecCommand),
    /// A nested scope: runs with a snapshot of the environment and cwd,
    /// discarding changes on exit.
    Scope {
        /// The nested command list.
        commands: Vec<JobCommand>,
    },
}

const ASSIGN_VERBS: [(&str, AssignOp); 5] = [
    ("set", AssignOp::Set),
    ("append_flag", AssignOp::AppendFlag),
    ("prepend_flag", AssignOp::PrependFlag),
    ("append_path", AssignOp::AppendPath),
    ("prepend_path", AssignOp::PrependPath),
];

impl JobCommand {
    fn from_value(value: &Value) -> Result<JobCommand, String> {
        let map = value
            .as_object()
            .ok_or_else(|| "command must be an object".to_string())?;

        for (verb, op) in ASSIGN_VERBS {
            if let Some(key) = map.get(verb) {
                let key = key
                    .as_str()
                    .ok_or_else(|| format!("\"{verb}\" takes a variable name"))?;
                check_keys(map, &[verb, "value", "nohash_value"])?;
                let (value, nohash) = match (map.get("value"), map.get("nohash_value")) {
                    (Some(v), None) => (v, false),
                    (None, Some(v)) => (v, true),
                    _ => {
                        return Err(format!(
                            "\"{verb}\" requires exactly one of \"value\" and \"nohash_value\""
                        ))
                    }
                };
                let value = value
                    .as_str()
                    .ok_or_else(|| format!("\"{verb}\" value must be a string"))?;
                return Ok(JobCommand::Assign(Assignment {
                    op,
                    key: key.to_string(),
                    value: value.to_string(),
                    nohash,
                }));
            }
        }

        if let Some(dir) = map.get("chdir") {
            check_keys(map, &["chdir"])?;
            let dir = dir
                .as_str()
                .ok_or_else(|| "\"chdir\" takes a directory".to_string())?;
            return Ok(JobCommand::Chdir {
                dir: dir.to_string(),
            });
        }

        if let Some(commands) = map.get("commands") {
            check_keys(map, &["commands"])?;
            let commands = commands
                .as_array()
                .ok_or_else(|| "\"commands\" takes a list".to_string())?
                .iter()
                .map(JobCommand::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(JobCommand::Scope { commands });
        }

        for (verb, kind) in [("cmd", ExecKind::Cmd), ("hit", ExecKind::Hit)] {
            if let Some(argv) = map.get(verb) {
                check_keys(
                    map,
                    &[verb, "to_var", "append_to_file", "env", "inputs"],
                )?;
                let argv = argv
                    .as_array()
                    .ok_or_else(|| format!("\"{verb}\" takes an argv list"))?
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(|s| s.to_string())
                            .ok_or_else(|| format!("\"{verb}\" argv elements must be strings"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if argv.is_empty() {
                    return Err(format!("\"{verb}\" argv must not be empty"));
                }
                let to_var = opt_string(map, "to_var")?;
                let append_to_file = opt_string(map, "append_to_file")?;
                if to_var.is_some() && append_to_file.is_some() {
                    return Err("\"to_var\" and \"append_to_file\" are exclusive".to_string());
                }
                let env = match map.get("env") {
                    None => BTreeMap::new(),
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| format!("bad \"env\": {e}"))?,
                };
                let inputs = match map.get("inputs") {
                    None => Vec::new(),
                    Some(v) => serde_json::from_value(v.clone())
                        .map_err(|e| format!("bad \"inputs\": {e}"))?,
                };
                return Ok(JobCommand::Exec(ExecCommand {
                    kind,
                    argv,
                    to_var,
                    append_to_file,
                    env,
                    inputs,
                }));
            }
        }

        Err(format!(
            "command has no recognized verb (keys: {:?})",
            map.keys().collect::<Vec<_>>()
        ))
    }

    fn to_value(&self) -> Value {
        match self {
            JobCommand::Assign(a) => {
                let mut map = Map::new();
                map.insert(a.op.verb().to_string(), json!(a.key));
                let value_key = if a.nohash { "nohash_value" } else { "value" };
                map.insert(value_key.to_string(), json!(a.value));
                Value::Object(map)
            }
            JobCommand::Chdir { dir } => json!({ "chdir": dir }),
            JobCommand::Scope { commands } => {
                json!({ "commands": commands.iter().map(|c| c.to_value()).collect::<Vec<_>>() })
            }
            JobCommand::Exec(e) => {
                let mut map = Map::new();
                let verb = match e.kind {
                    ExecKind::Cmd => "cmd",
                    ExecKind::Hit => "hit",
                };
                map.insert(verb.to_string(), json!(e.argv));
                if let Some(var) = &e.to_var {
                    map.insert("to_var".to_string(), json!(var));
                }
                if let Some(file) = &e.append_to_file {
                    map.insert("append_to_file".to_string(), json!(file));
                }
                if !e.env.is_empty() {
                    map.insert("env".to_string(), json!(e.env));
                }
                if !e.inputs.is_empty() {
                    map.insert(
                        "inputs".to_string(),
                        serde_json::to_value(&e.inputs).expect("inputs always serialize"),
                    );
                }
                Value::Object(map)
            }
        }
    }
}

fn opt_string(map: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| format!("\"{key}\" must be a string")),
    }
}

fn check_keys(map: &Map<String, Value>, allowed: &[&str]) -> Result<(), String> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(format!("unexpected key \"{key}\" on command"));
        }
    }
    Ok(())
}

impl Serialize for JobCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JobCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JobCommand::from_value(&value).map_err(D::Error::custom)
    }
}

/// The `build` section of a build spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Imports, an unordered set; `before` constrains composition order.
    #[serde(rename = "import", default)]
    pub imports: Vec<ImportSpec>,
    /// Initial environment entries.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Environment entries excluded from the spec digest. Suitable for
    /// parallelism flags and other values trusted not to affect results.
    #[serde(default)]
    pub nohash_env: BTreeMap<String, String>,
    /// The command list.
    #[serde(default)]
    pub commands: Vec<JobCommand>,
}

impl JobSpec {
    /// Puts the job spec on canonical form: imports sorted by ID with
    /// sorted `before` lists and defaults made explicit.
    pub fn canonicalize(mut self) -> Result<JobSpec, JobError> {
        for import in &mut self.imports {
            if import.ref_name.as_deref() == Some("") {
                return Err(JobError::InvalidSpec {
                    reason: format!("import \"{}\": empty ref should be null, not \"\"", import.id),
                });
            }
            import.before.sort();
        }
        self.imports.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(self)
    }
}
