//! Unpacking a spec's declared sources into a build directory.

use std::path::{Component, Path, PathBuf};

use hdist_source_cache::{SourceCache, Strip, UnpackMode};

use crate::error::BuildError;
use crate::spec::SourceRecord;

/// Unpacks each record into `root` at its stated target.
///
/// Targets are confined to `root`; absolute targets or `..` escapes are
/// rejected before anything is written. Extraction streams (fast mode)
/// since a build directory is discarded wholesale on failure.
pub fn unpack_sources(
    source_cache: &SourceCache,
    sources: &[SourceRecord],
    root: &Path,
) -> Result<(), BuildError> {
    for record in sources {
        let target = checked_target(root, &record.target)?;
        let strip = match record.strip {
            None => Strip::CommonPrefix,
            Some(n) => Strip::Components(n),
        };
        source_cache.unpack_with_strip(&record.key, &target, UnpackMode::Fast, strip)?;
    }
    Ok(())
}

/// Joins `target` onto `root`, rejecting anything that would escape.
fn checked_target(root: &Path, target: &str) -> Result<PathBuf, BuildError> {
    let path = Path::new(target);
    if path.is_absolute() {
        return Err(BuildError::SourceTargetEscape {
            target: target.to_string(),
        });
    }
    let mut depth = 0isize;
    let mut out = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(BuildError::SourceTargetEscape {
                        target: target.to_string(),
                    });
                }
                out.pop();
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(BuildError::SourceTargetEscape {
                    target: target.to_string(),
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_targets_accepted() {
        let root = Path::new("/bld/foo");
        assert_eq!(checked_target(root, ".").unwrap(), root);
        assert_eq!(checked_target(root, "subdir").unwrap(), root.join("subdir"));
        assert_eq!(
            checked_target(root, "a/./b").unwrap(),
            root.join("a").join("b")
        );
    }

    #[test]
    fn internal_updirs_accepted() {
        let root = Path::new("/bld/foo");
        assert_eq!(checked_target(root, "a/../b").unwrap(), root.join("b"));
    }

    #[test]
    fn escapes_rejected() {
        let root = Path::new("/bld/foo");
        for target in ["..", "../etc", "a/../../b", "/etc"] {
            assert!(
                matches!(
                    checked_target(root, target),
                    Err(BuildError::SourceTargetEscape { .. })
                ),
                "{target}"
            );
        }
    }
}
