//! The git half of the source cache.
//!
//! All git sources are pulled into one shared bare repository so that any
//! commit is addressable once fetched. Fetched commits are pinned with an
//! `inuse/<commit>` branch, which keeps `git gc` from collecting them.
//! Submodules are fetched recursively into the same repository; their
//! remotes are tracked internally under dotted names (`project.sub`).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::archive::sanitize_entry_path;
use crate::error::SourceCacheError;
use crate::key::{Scheme, SourceKey};

pub(crate) struct GitCache {
    repo_path: PathBuf,
}

impl GitCache {
    pub(crate) fn new(cache_path: &Path) -> Self {
        Self {
            repo_path: cache_path.join("all-git.git"),
        }
    }

    fn ensure_repo(&self) -> Result<(), SourceCacheError> {
        if self.repo_path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.repo_path)
            .map_err(|e| SourceCacheError::io(&self.repo_path, e))?;
        let repo = self.repo_path.display().to_string();
        self.checked_git(&["init", "--bare", "-q", &repo])?;
        Ok(())
    }

    fn git_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        cmd.args(args);
        cmd.env("GIT_DIR", &self.repo_path);
        cmd
    }

    /// Runs git with captured output; returns (code, stdout, stderr).
    fn git(&self, args: &[&str]) -> Result<(i32, String, String), SourceCacheError> {
        let output = self
            .git_command(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SourceCacheError::Git {
                message: format!("failed to run git {}: {e}", args.join(" ")),
            })?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    fn checked_git(&self, args: &[&str]) -> Result<String, SourceCacheError> {
        let (code, out, err) = self.git(args)?;
        if code != 0 {
            return Err(SourceCacheError::Git {
                message: format!("git {} failed with code {code}: {}", args.join(" "), err.trim()),
            });
        }
        Ok(out)
    }

    /// Runs git with inherited stdio so that credential prompts reach the
    /// user. Used for network fetches only.
    fn git_interactive(&self, args: &[&str]) -> Result<(), SourceCacheError> {
        let status = self
            .git_command(args)
            .status()
            .map_err(|e| SourceCacheError::Git {
                message: format!("failed to run git {}: {e}", args.join(" ")),
            })?;
        if !status.success() {
            return Err(SourceCacheError::Git {
                message: format!(
                    "git {} failed with code {}",
                    args.join(" "),
                    status.code().unwrap_or(-1)
                ),
            });
        }
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool, SourceCacheError> {
        let (code, _, _) = self.git(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(code == 0)
    }

    fn commit_present(&self, commit: &str) -> Result<bool, SourceCacheError> {
        let (code, _, _) = self.git(&["rev-list", "-n1", "--quiet", commit])?;
        Ok(code == 0)
    }

    /// Resolves a branch or tag on the remote to a commit hash.
    ///
    /// A rev that does not exist remotely must be a full 40-character
    /// commit hash; short forms would need server-side disambiguation and
    /// could silently resolve to a different object.
    fn resolve_remote_rev(
        &self,
        repository: &str,
        rev: &str,
    ) -> Result<String, SourceCacheError> {
        let out = self.checked_git(&["ls-remote", repository, rev])?;
        let lines: Vec<&str> = out.lines().filter(|l| !l.trim().is_empty()).collect();
        match lines.len() {
            0 => {
                if rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit()) {
                    Ok(rev.to_string())
                } else {
                    Err(SourceCacheError::Git {
                        message: format!(
                            "a git commit hash must be given with all 40 characters \
                             (got \"{rev}\")"
                        ),
                    })
                }
            }
            1 => Ok(lines[0]
                .split('\t')
                .next()
                .unwrap_or_default()
                .to_string()),
            _ => Err(SourceCacheError::Git {
                message: format!("\"{rev}\" resolves to multiple branches/tags in \"{repository}\""),
            }),
        }
    }

    /// Fetches `rev` from `repository`, pinning the resulting commit (and
    /// the commits of any submodules, recursively) against garbage
    /// collection. Returns the `git:<commit>` key.
    pub(crate) fn fetch(
        &self,
        repository: Option<&str>,
        rev: &str,
        name: &str,
    ) -> Result<SourceKey, SourceCacheError> {
        self.ensure_repo()?;

        let is_full_hash = rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit());
        if is_full_hash && self.branch_exists(&format!("inuse/{rev}"))? {
            // The exact commit is already pinned; skip the network.
            return SourceKey::new(Scheme::Git, rev);
        }

        let repository = repository.ok_or_else(|| SourceCacheError::KeyNotFound {
            key: format!("git:{rev}"),
        })?;
        let commit = self.resolve_remote_rev(repository, rev)?;
        self.fetch_commit(repository, &commit, name)?;
        SourceKey::new(Scheme::Git, &commit)
    }

    fn fetch_commit(
        &self,
        repository: &str,
        commit: &str,
        name: &str,
    ) -> Result<(), SourceCacheError> {
        if self.branch_exists(&format!("inuse/{commit}"))? {
            return Ok(());
        }

        // Fetch everything rather than the single rev; not every server
        // accepts a bare commit hash as a fetch refspec.
        self.git_interactive(&["fetch", repository])?;

        if !self.commit_present(commit)? {
            return Err(SourceCacheError::Git {
                message: format!("repository \"{repository}\" did not contain commit \"{commit}\""),
            });
        }

        let branch = format!("inuse/{commit}");
        let (code, _, err) = self.git(&["branch", &branch, commit])?;
        if code != 0 && !self.branch_exists(&branch)? {
            // A concurrent fetch creating the same branch is fine; anything
            // else is not.
            return Err(SourceCacheError::Git {
                message: format!("git branch {branch} failed with code {code}: {}", err.trim()),
            });
        }

        self.fetch_submodules(repository, commit, name)
    }

    fn fetch_submodules(
        &self,
        repository: &str,
        commit: &str,
        name: &str,
    ) -> Result<(), SourceCacheError> {
        let (code, gitmodules, _) = self.git(&["show", &format!("{commit}:.gitmodules")])?;
        if code != 0 {
            return Ok(());
        }
        for (path, url) in parse_gitmodules(&gitmodules) {
            let (code, ls, _) = self.git(&["ls-tree", commit, &path])?;
            if code != 0 {
                continue;
            }
            let Some(sub_commit) = parse_gitlink(&ls) else {
                continue;
            };
            let url = resolve_submodule_url(repository, &url);
            let dotted = format!("{name}.{}", path.replace('/', "."));
            self.fetch_commit(&url, &sub_commit, &dotted)?;
        }
        Ok(())
    }

    /// Streams `git archive` for the commit into `target`.
    pub(crate) fn unpack(
        &self,
        key: &SourceKey,
        target: &Path,
    ) -> Result<(), SourceCacheError> {
        self.ensure_repo()?;
        if !self.commit_present(&key.digest)? {
            return Err(SourceCacheError::KeyNotFound {
                key: key.to_string(),
            });
        }
        std::fs::create_dir_all(target).map_err(|e| SourceCacheError::io(target, e))?;

        let mut child = self
            .git_command(&["archive", "--format=tar", &key.digest])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SourceCacheError::Git {
                message: format!("failed to run git archive: {e}"),
            })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let mut archive = tar::Archive::new(stdout);
        let result = (|| -> Result<(), SourceCacheError> {
            for entry in archive.entries().map_err(|e| SourceCacheError::io(target, e))? {
                let mut entry = entry.map_err(|e| SourceCacheError::io(target, e))?;
                let raw = entry
                    .path()
                    .map_err(|e| SourceCacheError::io(target, e))?
                    .into_owned();
                let Some(safe) = sanitize_entry_path(&raw)? else {
                    continue;
                };
                let dest = target.join(safe);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| SourceCacheError::io(parent, e))?;
                }
                entry
                    .unpack(&dest)
                    .map_err(|e| SourceCacheError::io(&dest, e))?;
            }
            Ok(())
        })();

        let status = child.wait().map_err(|e| SourceCacheError::Git {
            message: format!("git archive did not exit cleanly: {e}"),
        })?;
        result?;
        if !status.success() {
            return Err(SourceCacheError::Git {
                message: format!(
                    "git archive failed with code {}",
                    status.code().unwrap_or(-1)
                ),
            });
        }
        Ok(())
    }
}

/// Extracts `(path, url)` pairs from a `.gitmodules` document.
fn parse_gitmodules(content: &str) -> Vec<(String, String)> {
    let mut result = Vec::new();
    let mut path: Option<String> = None;
    let mut url: Option<String> = None;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("[submodule") {
            if let (Some(p), Some(u)) = (path.take(), url.take()) {
                result.push((p, u));
            }
        } else if let Some((k, v)) = line.split_once('=') {
            match k.trim() {
                "path" => path = Some(v.trim().to_string()),
                "url" => url = Some(v.trim().to_string()),
                _ => {}
            }
        }
    }
    if let (Some(p), Some(u)) = (path, url) {
        result.push((p, u));
    }
    result
}

/// Extracts the commit from a gitlink `ls-tree` line
/// (`160000 commit <sha>\t<path>`).
fn parse_gitlink(ls_tree: &str) -> Option<String> {
    let line = ls_tree.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "160000" {
        return None;
    }
    if fields.next()? != "commit" {
        return None;
    }
    fields.next().map(|s| s.to_string())
}

/// Resolves possibly-relative submodule URLs against the parent remote.
fn resolve_submodule_url(parent: &str, url: &str) -> String {
    if let Some(rel) = url.strip_prefix("./") {
        format!("{}/{rel}", parent.trim_end_matches('/'))
    } else if url.starts_with("../") {
        let base = parent.trim_end_matches('/');
        let (base, rel) = (
            base.rsplit_once('/').map(|(b, _)| b).unwrap_or(base),
            &url[3..],
        );
        format!("{base}/{rel}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gitmodules_single() {
        let content = "[submodule \"submod\"]\n\tpath = submod\n\turl = https://example.com/sub.git\n";
        assert_eq!(
            parse_gitmodules(content),
            vec![("submod".to_string(), "https://example.com/sub.git".to_string())]
        );
    }

    #[test]
    fn parse_gitmodules_multiple() {
        let content = "\
[submodule \"a\"]
    path = subdir/a
    url = ../a.git
[submodule \"b\"]
    path = b
    url = https://example.com/b.git
";
        let parsed = parse_gitmodules(content);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, "subdir/a");
        assert_eq!(parsed[1].1, "https://example.com/b.git");
    }

    #[test]
    fn parse_gitlink_accepts_gitlinks_only() {
        assert_eq!(
            parse_gitlink("160000 commit c5ccca92c5f136833ad85614feb2aa4f5bd8b7c3\tsubmod"),
            Some("c5ccca92c5f136833ad85614feb2aa4f5bd8b7c3".to_string())
        );
        assert_eq!(parse_gitlink("100644 blob abcdef\tREADME"), None);
    }

    #[test]
    fn relative_submodule_urls() {
        assert_eq!(
            resolve_submodule_url("https://host/org/repo", "../other.git"),
            "https://host/org/other.git"
        );
        assert_eq!(
            resolve_submodule_url("https://host/org/repo", "./sub.git"),
            "https://host/org/repo/sub.git"
        );
        assert_eq!(
            resolve_submodule_url("https://host/org/repo", "https://x/y.git"),
            "https://x/y.git"
        );
    }
}
