//! Post-build artifact processing.
//!
//! `hit build-postprocess` walks a tree post-order (so that directory
//! write-protection lands last) and applies the handlers selected by its
//! flags: write protection, symlink relativization, pkg-config cleanup,
//! shell-script relativization, relocatability checks, and shebang
//! re-wiring.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;

use hdist_common::fileutils::write_protect;

use crate::error::BuildError;

/// How shebang lines are re-wired for relocatability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShebangMode {
    /// Leave scripts untouched.
    #[default]
    None,
    /// Insert a polyglot multi-line shebang that resolves the interpreter
    /// relative to the script.
    Multiline,
    /// Replace the script with a symlink to the launcher binary plus a
    /// `.real` copy with a launcher-style interpreter line.
    Launcher,
}

impl std::str::FromStr for ShebangMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ShebangMode::None),
            "multiline" => Ok(ShebangMode::Multiline),
            "launcher" => Ok(ShebangMode::Launcher),
            other => Err(format!("unknown shebang mode \"{other}\"")),
        }
    }
}

/// Flag-selected handlers for [`postprocess`].
#[derive(Debug, Default)]
pub struct PostprocessOptions {
    /// Remove all write bits from files.
    pub write_protect: bool,
    /// Rewrite absolute symlinks pointing into the artifact as relative;
    /// error on symlinks leaving it.
    pub relative_symlinks: bool,
    /// Remove `pkgconfig/*.pc` files.
    pub remove_pkgconfig: bool,
    /// Replace the absolute artifact path in `.pc` files with
    /// `${PACKAGE_DIR}`.
    pub relative_pkgconfig: bool,
    /// Globs (relative to the root) of shell scripts whose references to
    /// the artifact path are rewritten relative to the script location.
    pub relative_sh_script: Vec<String>,
    /// Fail when the absolute artifact path survives anywhere.
    pub check_relocatable: bool,
    /// Regexes of relative paths exempt from the relocatability check.
    pub check_ignore: Vec<String>,
    /// Shebang re-wiring mode.
    pub shebang: ShebangMode,
}

/// Walks `root` post-order and applies the selected handlers.
///
/// `artifact_dir` is the absolute path the relativization and
/// relocatability handlers key on (usually `$ARTIFACT`); `launcher` backs
/// the launcher shebang mode.
pub fn postprocess(
    root: &Path,
    artifact_dir: Option<&Path>,
    launcher: Option<&Path>,
    options: &PostprocessOptions,
) -> Result<(), BuildError> {
    let sh_globs = compile_globs(&options.relative_sh_script)?;
    let ignore: Vec<Regex> = options
        .check_ignore
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| BuildError::Tool {
                tool: "build-postprocess".to_string(),
                reason: format!("bad --check-ignore regex \"{p}\": {e}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let needs_artifact = options.relative_symlinks
        || options.relative_pkgconfig
        || !options.relative_sh_script.is_empty()
        || options.check_relocatable;
    if needs_artifact && artifact_dir.is_none() {
        return Err(BuildError::Tool {
            tool: "build-postprocess".to_string(),
            reason: "ARTIFACT environment variable not set".to_string(),
        });
    }

    for entry in walkdir::WalkDir::new(root).contents_first(true) {
        let entry = entry.map_err(|e| BuildError::Io {
            path: root.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(path);

        if entry.path_is_symlink() {
            if options.relative_symlinks {
                relativize_symlink(path, artifact_dir.expect("checked above"))?;
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        if options.remove_pkgconfig && is_pkgconfig(rel) {
            fs::remove_file(path).map_err(|e| BuildError::io(path, e))?;
            continue;
        }
        if options.relative_pkgconfig && is_pkgconfig(rel) {
            let artifact = artifact_dir.expect("checked above");
            replace_in_file(path, &artifact.display().to_string(), "${PACKAGE_DIR}")?;
        }
        if sh_globs.is_match(rel) {
            relativize_sh_script(path, artifact_dir.expect("checked above"))?;
        }
        if options.shebang != ShebangMode::None {
            rewire_shebang(path, options.shebang, launcher)?;
            if !path.exists() {
                continue;
            }
        }
        if options.check_relocatable && !ignore.iter().any(|re| re.is_match(&rel.to_string_lossy()))
        {
            check_relocatable(path, artifact_dir.expect("checked above"))?;
        }
        if options.write_protect {
            write_protect(path).map_err(|e| BuildError::io(path, e))?;
        }
    }
    Ok(())
}

fn compile_globs(patterns: &[String]) -> Result<GlobSet, BuildError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| BuildError::Tool {
            tool: "build-postprocess".to_string(),
            reason: format!("bad glob \"{pattern}\": {e}"),
        })?);
    }
    builder.build().map_err(|e| BuildError::Tool {
        tool: "build-postprocess".to_string(),
        reason: e.to_string(),
    })
}

fn is_pkgconfig(rel: &Path) -> bool {
    rel.extension().is_some_and(|e| e == "pc")
        && rel
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|d| d == "pkgconfig")
}

/// Rewrites an absolute symlink pointing inside the artifact as a
/// relative one; a symlink leaving the artifact is an error.
fn relativize_symlink(link: &Path, artifact_dir: &Path) -> Result<(), BuildError> {
    let target = fs::read_link(link).map_err(|e| BuildError::io(link, e))?;
    if !target.is_absolute() {
        return Ok(());
    }
    if !target.starts_with(artifact_dir) {
        return Err(BuildError::Tool {
            tool: "build-postprocess".to_string(),
            reason: format!(
                "symlink {} points outside the artifact ({})",
                link.display(),
                target.display()
            ),
        });
    }
    let link_dir = link.parent().unwrap_or(Path::new(""));
    let rel = pathdiff(link_dir, &target);
    fs::remove_file(link).map_err(|e| BuildError::io(link, e))?;
    std::os::unix::fs::symlink(&rel, link).map_err(|e| BuildError::io(link, e))?;
    Ok(())
}

fn pathdiff(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to_parts: Vec<_> = to.components().collect();
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

fn replace_in_file(path: &Path, needle: &str, replacement: &str) -> Result<(), BuildError> {
    let contents = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    if contents.contains(needle) {
        let updated = contents.replace(needle, replacement);
        fs::write(path, updated).map_err(|e| BuildError::io(path, e))?;
    }
    Ok(())
}

/// Inserts a header computing the artifact location relative to the
/// script and routes artifact references through it.
fn relativize_sh_script(path: &Path, artifact_dir: &Path) -> Result<(), BuildError> {
    let contents = fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    let artifact = artifact_dir.display().to_string();
    if !contents.contains(&artifact) {
        return Ok(());
    }
    let script_dir = path.parent().unwrap_or(Path::new(""));
    let rel = pathdiff(script_dir, artifact_dir);
    let header = format!(
        "hdist_artifact=\"$(cd \"$(dirname \"$0\")/{}\" && pwd)\"\n",
        rel.display()
    );
    let replaced = contents.replace(&artifact, "${hdist_artifact}");
    let updated = match replaced.strip_prefix("#!") {
        Some(_) => {
            // Keep the shebang first.
            let mut lines = replaced.splitn(2, '\n');
            let shebang = lines.next().unwrap_or_default();
            let rest = lines.next().unwrap_or_default();
            format!("{shebang}\n{header}{rest}")
        }
        None => format!("{header}{replaced}"),
    };
    fs::write(path, updated).map_err(|e| BuildError::io(path, e))?;
    Ok(())
}

fn check_relocatable(path: &Path, artifact_dir: &Path) -> Result<(), BuildError> {
    let mut contents = Vec::new();
    fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut contents))
        .map_err(|e| BuildError::io(path, e))?;
    let needle = artifact_dir.display().to_string();
    if contents
        .windows(needle.len())
        .any(|w| w == needle.as_bytes())
    {
        return Err(BuildError::NotRelocatable {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Re-wires `#!` scripts according to the shebang mode.
fn rewire_shebang(
    path: &Path,
    mode: ShebangMode,
    launcher: Option<&Path>,
) -> Result<(), BuildError> {
    let contents = fs::read(path).map_err(|e| BuildError::io(path, e))?;
    if !contents.starts_with(b"#!") {
        return Ok(());
    }
    let text = String::from_utf8_lossy(&contents).into_owned();
    let mut lines = text.splitn(2, '\n');
    let shebang_line = lines.next().unwrap_or_default();
    let body = lines.next().unwrap_or_default();
    let mut words = shebang_line[2..].split_whitespace();
    let Some(interpreter) = words.next() else {
        return Ok(());
    };
    let args: Vec<&str> = words.collect();
    let script_dir = path.parent().unwrap_or(Path::new(""));
    let rel_interp = pathdiff(script_dir, Path::new(interpreter));

    match mode {
        ShebangMode::None => Ok(()),
        ShebangMode::Multiline => {
            // A polyglot stub: sh resolves the interpreter relative to the
            // script and re-executes it.
            let stub = format!(
                "#!/bin/sh\n\
                 \"exec\" \"$(dirname \"$0\")/{interp}\"{args} \"$0\" \"$@\"\n",
                interp = rel_interp.display(),
                args = args
                    .iter()
                    .map(|a| format!(" \"{a}\""))
                    .collect::<String>(),
            );
            let updated = format!("{stub}{body}");
            fs::write(path, updated).map_err(|e| BuildError::io(path, e))
        }
        ShebangMode::Launcher => {
            let launcher = launcher.ok_or_else(|| BuildError::Tool {
                tool: "build-postprocess".to_string(),
                reason: "LAUNCHER environment variable not set".to_string(),
            })?;
            let real = PathBuf::from(format!("{}.real", path.display()));
            let interpreters = format!(
                "${{PROFILE_BIN_DIR}}/{}:${{ORIGIN}}/{}",
                Path::new(interpreter)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                rel_interp.display()
            );
            let rewritten = format!(
                "#!{interpreters}{args}\n{body}",
                args = args
                    .iter()
                    .map(|a| format!(" {a}"))
                    .collect::<String>(),
            );
            fs::write(&real, rewritten).map_err(|e| BuildError::io(&real, e))?;
            write_protect(&real).map_err(|e| BuildError::io(&real, e))?;
            fs::remove_file(path).map_err(|e| BuildError::io(path, e))?;
            let rel_launcher = pathdiff(script_dir, launcher);
            std::os::unix::fs::symlink(&rel_launcher, path)
                .map_err(|e| BuildError::io(path, e))?;
            Ok(())
        }
    }
}
