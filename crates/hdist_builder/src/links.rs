//! The links DSL: declarative symlinking/copying into an artifact.
//!
//! Rules are applied in order. `select` is a glob (or plain path);
//! `exclude` rules veto matches for later rules. With a `prefix`, the
//! prefix is stripped from each selected path and the remainder appended
//! to `target`, recreating the selected hierarchy below the target.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

use hdist_runner::substitute;

use crate::error::BuildError;

/// The verb of a link rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkAction {
    /// Create a symlink to the selected path.
    Symlink,
    /// Copy the selected file.
    Copy,
    /// Re-wire the selected executable through the launcher binary:
    /// the target becomes a symlink to the launcher and `<target>.real`
    /// points at the original.
    Launcher,
    /// Veto the selected paths for all later rules.
    Exclude,
}

/// One rule of the links DSL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRule {
    /// What to do with the selection.
    pub action: LinkAction,
    /// Glob or plain path; variables are substituted.
    pub select: String,
    /// Prefix to strip from selected paths before appending to `target`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Link/copy destination; variables are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A planned filesystem action; produced by [`dry_run_links_dsl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedLink {
    /// Create a directory chain.
    Makedirs(PathBuf),
    /// Symlink `dest` pointing at `source`.
    Symlink {
        /// Link target.
        source: PathBuf,
        /// Link location.
        dest: PathBuf,
    },
    /// Copy `source` to `dest`.
    Copy {
        /// File to copy.
        source: PathBuf,
        /// Destination path.
        dest: PathBuf,
    },
    /// Launcher re-wiring for `source` at `dest`.
    Launcher {
        /// The original executable.
        source: PathBuf,
        /// Destination path.
        dest: PathBuf,
    },
}

/// Expands the rules into a list of actions without touching the
/// filesystem (beyond reading it to expand globs).
pub fn dry_run_links_dsl(
    rules: &[LinkRule],
    env: &BTreeMap<String, String>,
    cwd: &Path,
) -> Result<Vec<PlannedLink>, BuildError> {
    let subs = |s: &str| {
        substitute(s, env).map_err(|e| BuildError::Tool {
            tool: "create-links".to_string(),
            reason: e.to_string(),
        })
    };

    let mut actions = Vec::new();
    let mut excluded: BTreeSet<PathBuf> = BTreeSet::new();
    let mut made_dirs: BTreeSet<PathBuf> = BTreeSet::new();

    for rule in rules {
        let select = subs(&rule.select)?;
        let matches = expand_select(&select, cwd)?;

        if rule.action == LinkAction::Exclude {
            excluded.extend(matches);
            continue;
        }

        let target = rule.target.as_deref().ok_or_else(|| BuildError::Tool {
            tool: "create-links".to_string(),
            reason: format!("rule for \"{select}\" has no target"),
        })?;
        let target = subs(target)?;
        let prefix = match &rule.prefix {
            None => None,
            Some(p) => Some(subs(p)?),
        };

        for source in matches {
            if excluded.contains(&source) {
                continue;
            }
            let dest = match &prefix {
                None => PathBuf::from(&target),
                Some(prefix) => {
                    let mut prefix = prefix.clone();
                    if !prefix.is_empty() && !prefix.ends_with('/') {
                        prefix.push('/');
                    }
                    let source_str = source.display().to_string();
                    let remainder =
                        source_str
                            .strip_prefix(&prefix)
                            .ok_or_else(|| BuildError::Tool {
                                tool: "create-links".to_string(),
                                reason: format!("{source_str} does not start with {prefix}"),
                            })?;
                    Path::new(&target).join(remainder)
                }
            };
            if let Some(parent) = dest.parent() {
                if !parent.as_os_str().is_empty() && !made_dirs.contains(parent) {
                    actions.push(PlannedLink::Makedirs(parent.to_path_buf()));
                    made_dirs.insert(parent.to_path_buf());
                }
            }
            actions.push(match rule.action {
                LinkAction::Symlink => PlannedLink::Symlink { source, dest },
                LinkAction::Copy => PlannedLink::Copy { source, dest },
                LinkAction::Launcher => PlannedLink::Launcher { source, dest },
                LinkAction::Exclude => unreachable!("handled above"),
            });
        }
    }
    Ok(actions)
}

/// Executes the links DSL relative to `cwd`.
///
/// `launcher` is required when any `launcher` rule survives exclusion.
pub fn execute_links_dsl(
    rules: &[LinkRule],
    env: &BTreeMap<String, String>,
    cwd: &Path,
    launcher: Option<&Path>,
) -> Result<(), BuildError> {
    for action in dry_run_links_dsl(rules, env, cwd)? {
        match action {
            PlannedLink::Makedirs(dir) => {
                let dir = absolute(cwd, &dir);
                fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
            }
            PlannedLink::Symlink { source, dest } => {
                let dest = absolute(cwd, &dest);
                std::os::unix::fs::symlink(&source, &dest)
                    .map_err(|e| BuildError::io(&dest, e))?;
            }
            PlannedLink::Copy { source, dest } => {
                let source = absolute(cwd, &source);
                let dest = absolute(cwd, &dest);
                fs::copy(&source, &dest).map_err(|e| BuildError::io(&dest, e))?;
            }
            PlannedLink::Launcher { source, dest } => {
                let launcher = launcher.ok_or_else(|| BuildError::Tool {
                    tool: "create-links".to_string(),
                    reason: "launcher rules require the LAUNCHER environment variable"
                        .to_string(),
                })?;
                let dest = absolute(cwd, &dest);
                let real = PathBuf::from(format!("{}.real", dest.display()));
                std::os::unix::fs::symlink(&source, &real)
                    .map_err(|e| BuildError::io(&real, e))?;
                std::os::unix::fs::symlink(launcher, &dest)
                    .map_err(|e| BuildError::io(&dest, e))?;
            }
        }
    }
    Ok(())
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Expands a select expression to matching paths.
///
/// Without glob metacharacters the expression names a single path (which
/// need not exist; broken selects surface when the action runs). With
/// globs, the non-glob leading directory is walked and matched.
fn expand_select(select: &str, cwd: &Path) -> Result<Vec<PathBuf>, BuildError> {
    if !select.contains(['*', '?', '[']) {
        return Ok(vec![PathBuf::from(select)]);
    }

    let matcher: GlobMatcher = Glob::new(select)
        .map_err(|e| BuildError::Tool {
            tool: "create-links".to_string(),
            reason: format!("bad glob \"{select}\": {e}"),
        })?
        .compile_matcher();

    // Walk from the deepest glob-free directory prefix.
    let split_at = select.find(['*', '?', '[']).unwrap_or(0);
    let base = match select[..split_at].rfind('/') {
        Some(slash) => &select[..slash + 1],
        None => "",
    };
    let base_dir = if base.is_empty() {
        cwd.to_path_buf()
    } else {
        absolute(cwd, Path::new(base))
    };

    let mut matches = Vec::new();
    let recursive = select.contains("**");
    let walker = if recursive {
        walkdir::WalkDir::new(&base_dir)
    } else {
        walkdir::WalkDir::new(&base_dir).max_depth(depth_below(select, base))
    };
    for entry in walker.min_depth(1) {
        let entry = entry.map_err(|e| BuildError::Io {
            path: base_dir.clone(),
            source: std::io::Error::other(e),
        })?;
        // Match against the path as written in the rule (relative rules
        // match relative walk paths).
        let candidate = if Path::new(select).is_absolute() {
            entry.path().to_path_buf()
        } else {
            entry
                .path()
                .strip_prefix(cwd)
                .unwrap_or(entry.path())
                .to_path_buf()
        };
        if matcher.is_match(&candidate) {
            matches.push(candidate);
        }
    }
    matches.sort();
    Ok(matches)
}

fn depth_below(select: &str, base: &str) -> usize {
    select[base.len()..]
        .split('/')
        .filter(|s| !s.is_empty())
        .count()
}
