//! Import ordering and environment assembly.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use hdist_common::{ArtifactId, VIRTUAL_PREFIX};
use hdist_store::BuildStore;

use crate::error::JobError;
use crate::spec::ImportSpec;

/// Separator for `PATH`-style variables.
pub const PATH_SEP: char = ':';

/// Topologically sorts imports with a stable, input-derived order.
///
/// Roots are visited first, in declaration order; children (the `before`
/// targets) follow in declaration order. With no constraints the output
/// equals the input, so the order is a pure function of the spec. Cycles
/// are rejected rather than broken.
pub fn stable_topological_sort(imports: &[ImportSpec]) -> Result<Vec<ImportSpec>, JobError> {
    let mut order: HashMap<&str, usize> = HashMap::new();
    for (i, import) in imports.iter().enumerate() {
        if order.insert(&import.id, i).is_some() {
            return Err(JobError::InvalidSpec {
                reason: format!("import \"{}\" appears twice", import.id),
            });
        }
    }

    // Edges: id -> ids it must precede, known ids only, declaration order.
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut roots: Vec<&str> = imports.iter().map(|i| i.id.as_str()).collect();
    for import in imports {
        let mut targets: Vec<&str> = import
            .before
            .iter()
            .map(String::as_str)
            .filter(|id| order.contains_key(id))
            .collect();
        targets.sort_by_key(|id| order[id]);
        for target in &targets {
            roots.retain(|r| r != target);
        }
        children.insert(&import.id, targets);
    }

    let mut result: Vec<&str> = Vec::with_capacity(imports.len());
    fn dfs<'a>(
        id: &'a str,
        children: &HashMap<&'a str, Vec<&'a str>>,
        result: &mut Vec<&'a str>,
    ) {
        if result.contains(&id) {
            return;
        }
        result.push(id);
        for child in &children[id] {
            dfs(child, children, result);
        }
    }
    let mut sorted_roots = roots;
    sorted_roots.sort_by_key(|id| order[id]);
    for root in sorted_roots {
        dfs(root, &children, &mut result);
    }

    if result.len() != imports.len() {
        return Err(JobError::InvalidSpec {
            reason: "import constraints form a graph with cycles".to_string(),
        });
    }

    let by_id: HashMap<&str, &ImportSpec> =
        imports.iter().map(|i| (i.id.as_str(), i)).collect();
    Ok(result.into_iter().map(|id| by_id[id].clone()).collect())
}

/// Renders the virtuals map as the `HDIST_VIRTUALS` value:
/// `virtual:name=concrete;...`, sorted by name.
pub fn pack_virtuals(virtuals: &HashMap<String, ArtifactId>) -> String {
    let sorted: BTreeMap<&str, String> = virtuals
        .iter()
        .map(|(k, v)| (k.as_str(), v.to_string()))
        .collect();
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Builds the environment contributed by the `import` section.
///
/// For each import (in stable topological order) the concrete artifact is
/// resolved — through the virtuals map for `virtual:` IDs — and, when a
/// `ref` is given, `<REF>_DIR` / `<REF>_ID` are set. Imports with `in_env`
/// contribute their `bin/` to `PATH`, `-L`/`-Wl,-R` flags for a single
/// `lib*` directory to `HDIST_LDFLAGS`, and `-I include` to
/// `HDIST_CFLAGS`. `HDIST_IMPORT` and `HDIST_IMPORT_PATHS` record what was
/// consumed.
pub fn imports_env(
    store: &BuildStore,
    virtuals: &HashMap<String, ArtifactId>,
    imports: &[ImportSpec],
) -> Result<BTreeMap<String, String>, JobError> {
    let sorted = stable_topological_sort(imports)?;

    let mut env = BTreeMap::new();
    let mut path = Vec::new();
    let mut cflags = Vec::new();
    let mut ldflags = Vec::new();
    let mut import_ids = Vec::new();
    let mut import_paths = Vec::new();

    for dep in &sorted {
        let concrete: ArtifactId = if dep.id.starts_with(VIRTUAL_PREFIX) {
            virtuals
                .get(&dep.id)
                .cloned()
                .ok_or_else(|| JobError::UnresolvedVirtual { id: dep.id.clone() })?
        } else {
            dep.id.parse().map_err(|e| JobError::InvalidSpec {
                reason: format!("bad import id: {e}"),
            })?
        };

        let dep_dir = store
            .resolve(&concrete)?
            .ok_or_else(|| JobError::ImportNotBuilt {
                id: concrete.to_string(),
            })?;
        let dep_dir_str = dep_dir.display().to_string();

        if let Some(ref_name) = &dep.ref_name {
            env.insert(format!("{ref_name}_DIR"), dep_dir_str.clone());
            env.insert(format!("{ref_name}_ID"), concrete.to_string());
        }

        if dep.in_env {
            let bin_dir = dep_dir.join("bin");
            if bin_dir.exists() {
                path.push(bin_dir.display().to_string());
            }

            let lib_dirs = lib_dirs(&dep_dir)?;
            match lib_dirs.as_slice() {
                [] => {}
                [lib] => {
                    ldflags.push(format!("-L{lib}"));
                    ldflags.push(format!("-Wl,-R,{lib}"));
                }
                many => {
                    return Err(JobError::AmbiguousLibDir {
                        id: concrete.to_string(),
                        dirs: many.to_vec(),
                    })
                }
            }

            let include_dir = dep_dir.join("include");
            if include_dir.exists() {
                cflags.push(format!("-I{}", include_dir.display()));
            }
        }

        import_ids.push(concrete.to_string());
        import_paths.push(dep_dir_str);
    }

    env.insert(
        "PATH".to_string(),
        path.join(&PATH_SEP.to_string()),
    );
    env.insert("HDIST_CFLAGS".to_string(), cflags.join(" "));
    env.insert("HDIST_LDFLAGS".to_string(), ldflags.join(" "));
    env.insert("HDIST_IMPORT".to_string(), import_ids.join(" "));
    env.insert("HDIST_IMPORT_PATHS".to_string(), import_paths.join(" "));
    Ok(env)
}

/// Existing `lib*` subdirectories of an artifact, sorted.
fn lib_dirs(artifact_dir: &Path) -> Result<Vec<String>, JobError> {
    let mut dirs = Vec::new();
    let entries = match fs::read_dir(artifact_dir) {
        Ok(entries) => entries,
        Err(e) => return Err(JobError::io(artifact_dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| JobError::io(artifact_dir, e))?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with("lib")
            && entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
        {
            dirs.push(entry.path().display().to_string());
        }
    }
    dirs.sort();
    Ok(dirs)
}
