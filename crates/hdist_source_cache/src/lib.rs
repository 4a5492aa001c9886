//! Content-addressed storage of build sources.
//!
//! The source cache stores everything retrievable by a `scheme:digest` key:
//! downloaded archives (`tar.gz`, `tar.bz2`, `zip`) under their byte
//! digest, canonically-serialized file sets under the `files` scheme, and
//! version-control snapshots as commits in one shared bare git repository.
//! Entries are created when first referenced, never mutated, and removed
//! only by explicit purge.
//!
//! On-disk layout:
//!
//! ```text
//! <cache>/packs/<scheme>/<digest>   raw archive bytes
//! <cache>/meta/<digest>.info        JSON sidecar {type, retrieved_from}
//! <cache>/all-git.git               shared bare repository
//! ```

#![warn(missing_docs)]

mod archive;
mod bundle;
mod error;
mod git;
mod key;

use std::path::{Path, PathBuf};

pub use archive::{ArchiveInfo, Strip, UnpackMode};
pub use bundle::FileSet;
pub use error::SourceCacheError;
pub use key::{Scheme, SourceKey};

use archive::ArchiveStore;
use git::GitCache;

/// Directory-based source object database.
pub struct SourceCache {
    cache_path: PathBuf,
    archive: ArchiveStore,
    git: GitCache,
}

impl SourceCache {
    /// Opens (or creates) a source cache rooted at `cache_path`.
    pub fn new(cache_path: &Path) -> Result<Self, SourceCacheError> {
        Self::with_mirrors(cache_path, Vec::new())
    }

    /// Opens a source cache with an ordered list of mirror roots.
    ///
    /// Mirrors are consulted before the primary URL for any fetch with a
    /// known key; each mirror is expected to expose the cache's own
    /// `packs/<scheme>/<digest>` layout.
    pub fn with_mirrors(
        cache_path: &Path,
        mirrors: Vec<String>,
    ) -> Result<Self, SourceCacheError> {
        std::fs::create_dir_all(cache_path).map_err(|e| SourceCacheError::io(cache_path, e))?;
        Ok(Self {
            cache_path: cache_path.to_path_buf(),
            archive: ArchiveStore::new(cache_path, mirrors),
            git: GitCache::new(cache_path),
        })
    }

    /// The cache root.
    pub fn path(&self) -> &Path {
        &self.cache_path
    }

    /// Fetches a source with a known key.
    ///
    /// A no-op if the key is already cached. For archive keys the mirrors
    /// are tried before `url`; for git keys `url` is the repository and the
    /// key digest is the commit. `name` labels git sources (and their
    /// submodules) inside the cache.
    pub fn fetch(
        &self,
        url: Option<&str>,
        key: &SourceKey,
        name: &str,
    ) -> Result<(), SourceCacheError> {
        match key.scheme {
            Scheme::Git => {
                self.git.fetch(url, &key.digest, name)?;
                Ok(())
            }
            _ => self.archive.fetch(url, key),
        }
    }

    /// Downloads an archive whose digest is not known up front and returns
    /// the key it was stored under.
    ///
    /// The archive type is inferred from the URL's trailing extension when
    /// not given explicitly.
    pub fn fetch_archive(
        &self,
        url: &str,
        archive_type: Option<Scheme>,
    ) -> Result<SourceKey, SourceCacheError> {
        self.archive.fetch_archive(url, archive_type)
    }

    /// Fetches `rev` (a branch, tag or full commit hash) from a git
    /// repository and returns the pinned `git:<commit>` key.
    pub fn fetch_git(
        &self,
        repository: &str,
        rev: &str,
        name: &str,
    ) -> Result<SourceKey, SourceCacheError> {
        self.git.fetch(Some(repository), rev, name)
    }

    /// Stores an in-memory file set under the `files:` scheme.
    ///
    /// The key is a pure function of the mapping, independent of this
    /// particular cache.
    pub fn put(&self, files: &FileSet) -> Result<SourceKey, SourceCacheError> {
        let digest = bundle::bundle_digest(files).to_string();
        let key = SourceKey::new(Scheme::Files, &digest)?;
        self.archive
            .store_bytes(&bundle::encode_bundle(files), &key, "<put>")?;
        Ok(key)
    }

    /// True if the key's bytes are present in this cache.
    pub fn contains(&self, key: &SourceKey) -> Result<bool, SourceCacheError> {
        match key.scheme {
            Scheme::Git => {
                // Presence is owned by the pinning branch; asking git
                // directly would also count unpinned loose objects.
                Ok(self
                    .git
                    .fetch(None, &key.digest, "probe")
                    .is_ok())
            }
            _ => Ok(self.archive.contains(key)),
        }
    }

    /// Unpacks the sources identified by `key` into `target`, stripping
    /// the common leading directory.
    ///
    /// Contents are verified against the key digest; see [`UnpackMode`]
    /// for the safety/speed trade-off.
    pub fn unpack(
        &self,
        key: &SourceKey,
        target: &Path,
        mode: UnpackMode,
    ) -> Result<(), SourceCacheError> {
        self.unpack_with_strip(key, target, mode, Strip::CommonPrefix)
    }

    /// Unpacks with explicit control over component stripping.
    pub fn unpack_with_strip(
        &self,
        key: &SourceKey,
        target: &Path,
        mode: UnpackMode,
        strip: Strip,
    ) -> Result<(), SourceCacheError> {
        match key.scheme {
            Scheme::Git => self.git.unpack(key, target),
            _ => self.archive.unpack(key, target, mode, strip),
        }
    }

    /// Removes every cached source.
    pub fn delete_all(&self) -> Result<(), SourceCacheError> {
        self.archive.delete_all()?;
        let git_dir = self.cache_path.join("all-git.git");
        if git_dir.exists() {
            std::fs::remove_dir_all(&git_dir).map_err(|e| SourceCacheError::io(&git_dir, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::process::Command;

    /// Builds a `.tar.gz` with the given (path, contents) entries and
    /// returns (archive path, key).
    fn make_tarball(dir: &Path, entries: &[(&str, &str)]) -> (PathBuf, SourceKey) {
        let tar_gz_path = dir.join("mock.tar.gz");
        let file = fs::File::create(&tar_gz_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();

        let bytes = fs::read(&tar_gz_path).unwrap();
        let digest = hdist_common::Digest::from_data(&bytes).to_string();
        let key = SourceKey::new(Scheme::TarGz, &digest).unwrap();
        (tar_gz_path, key)
    }

    fn file_url(path: &Path) -> String {
        format!("file:{}", path.display())
    }

    #[test]
    fn fetch_and_unpack_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let (tarball, expected_key) = make_tarball(
            tmp.path(),
            &[("a/b/0/README", "file contents"), ("a/b/1/README", "file contents")],
        );

        let key = sc.fetch_archive(&file_url(&tarball), None).unwrap();
        assert_eq!(key, expected_key);

        for mode in [UnpackMode::Safe, UnpackMode::Fast] {
            let target = tempfile::tempdir().unwrap();
            sc.unpack(&key, target.path(), mode).unwrap();
            // common prefix a/b is stripped
            assert_eq!(
                fs::read_to_string(target.path().join("0/README")).unwrap(),
                "file contents"
            );
            assert_eq!(
                fs::read_to_string(target.path().join("1/README")).unwrap(),
                "file contents"
            );
            assert!(!target.path().join("a").exists());
        }
    }

    #[test]
    fn single_top_directory_is_stripped() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let (tarball, _) = make_tarball(tmp.path(), &[("coolproject-2.3/README", "Welcome!")]);
        let key = sc.fetch_archive(&file_url(&tarball), None).unwrap();

        let target = tempfile::tempdir().unwrap();
        sc.unpack(&key, target.path(), UnpackMode::Fast).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("README")).unwrap(),
            "Welcome!"
        );
    }

    #[test]
    fn explicit_strip_components() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let (tarball, _) = make_tarball(
            tmp.path(),
            &[("top/sub/one", "1"), ("top/other", "2")],
        );
        let key = sc.fetch_archive(&file_url(&tarball), None).unwrap();

        let target = tempfile::tempdir().unwrap();
        sc.unpack_with_strip(&key, target.path(), UnpackMode::Safe, Strip::Components(1))
            .unwrap();
        assert!(target.path().join("sub/one").is_file());
        assert!(target.path().join("other").is_file());
    }

    #[test]
    fn fetch_with_expected_key_verifies() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let (tarball, key) = make_tarball(tmp.path(), &[("f", "x")]);
        sc.fetch(Some(&file_url(&tarball)), &key, "mock").unwrap();
        assert!(sc.contains(&key).unwrap());
    }

    #[test]
    fn corrupt_download_rejected_and_no_temp_left() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_dir = tmp.path().join("cache");
        let sc = SourceCache::new(&cache_dir).unwrap();
        let (tarball, _) = make_tarball(tmp.path(), &[("f", "x")]);

        let wrong = hdist_common::Digest::from_data(b"something else").to_string();
        let wrong_key = SourceKey::new(Scheme::TarGz, &wrong).unwrap();
        let err = sc
            .fetch(Some(&file_url(&tarball)), &wrong_key, "mock")
            .unwrap_err();
        assert!(matches!(err, SourceCacheError::DigestMismatch { .. }));

        let packs = cache_dir.join("packs");
        if packs.exists() {
            for entry in walk_files(&packs) {
                panic!("unexpected leftover file {}", entry.display());
            }
        }
    }

    fn walk_files(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                out.extend(walk_files(&entry.path()));
            } else {
                out.push(entry.path());
            }
        }
        out
    }

    #[test]
    fn does_not_re_download_present_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let (tarball, key) = make_tarball(tmp.path(), &[("f", "x")]);
        sc.fetch(Some(&file_url(&tarball)), &key, "mock").unwrap();
        // The URL no longer matters once the key is present.
        sc.fetch(Some("file:does-not-exist"), &key, "mock").unwrap();
        sc.fetch(None, &key, "mock").unwrap();
    }

    #[test]
    fn missing_key_without_url_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let digest = hdist_common::Digest::from_data(b"absent").to_string();
        let key = SourceKey::new(Scheme::TarGz, &digest).unwrap();
        let err = sc.fetch(None, &key, "mock").unwrap_err();
        assert!(matches!(err, SourceCacheError::KeyNotFound { .. }));
    }

    #[test]
    fn unpack_nonexistent_key_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let digest = hdist_common::Digest::from_data(b"absent").to_string();
        let key = SourceKey::new(Scheme::TarGz, &digest).unwrap();
        let target = tempfile::tempdir().unwrap();
        let err = sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap_err();
        assert!(matches!(err, SourceCacheError::KeyNotFound { .. }));
    }

    #[test]
    fn corrupt_store_detected_in_safe_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let cache_dir = tmp.path().join("cache");
        let sc = SourceCache::new(&cache_dir).unwrap();
        let (tarball, key) = make_tarball(tmp.path(), &[("f", "x")]);
        sc.fetch(Some(&file_url(&tarball)), &key, "mock").unwrap();

        // Tamper with the stored pack.
        let pack = cache_dir.join("packs/tar.gz").join(&key.digest);
        fs::write(&pack, b"corrupt archive").unwrap();

        let target = tempfile::tempdir().unwrap();
        let err = sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap_err();
        assert!(matches!(err, SourceCacheError::Corrupt { .. }));
        // Safe mode has no side effects.
        assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
    }

    /// Like `make_tarball`, but writes entry names verbatim so hostile
    /// paths (`..`, absolute) can be represented.
    fn make_evil_tarball(dir: &Path, name: &str) -> (PathBuf, SourceKey) {
        let tar_gz_path = dir.join("evil.tar.gz");
        let file = fs::File::create(&tar_gz_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let contents = b"hello";
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name.len()].copy_from_slice(name.as_bytes());
        }
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, &contents[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let bytes = fs::read(&tar_gz_path).unwrap();
        let digest = hdist_common::Digest::from_data(&bytes).to_string();
        let key = SourceKey::new(Scheme::TarGz, &digest).unwrap();
        (tar_gz_path, key)
    }

    #[test]
    fn escaping_entries_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();

        for attack in ["../escapes", "a/../../escapes"] {
            let (tarball, _) = make_evil_tarball(tmp.path(), attack);
            let key = sc.fetch_archive(&file_url(&tarball), None).unwrap();
            let target = tempfile::tempdir().unwrap();
            let err = sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap_err();
            assert!(matches!(err, SourceCacheError::Security { .. }), "{attack}");
            // Safe mode extracts nothing from a hostile archive.
            assert_eq!(fs::read_dir(target.path()).unwrap().count(), 0);
            fs::remove_file(&tarball).unwrap();
        }
    }

    #[test]
    fn put_and_unpack_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let mut files = FileSet::new();
        files.insert("foofile".to_string(), "the contents".to_string());
        files.insert("sub/dir/file".to_string(), "nested".to_string());

        let key = sc.put(&files).unwrap();
        assert_eq!(key.scheme, Scheme::Files);

        let target = tempfile::tempdir().unwrap();
        sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("foofile")).unwrap(),
            "the contents"
        );
        assert_eq!(
            fs::read_to_string(target.path().join("sub/dir/file")).unwrap(),
            "nested"
        );
    }

    #[test]
    fn put_key_is_store_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let sc1 = SourceCache::new(&tmp.path().join("c1")).unwrap();
        let sc2 = SourceCache::new(&tmp.path().join("c2")).unwrap();
        let mut files = FileSet::new();
        files.insert("f".to_string(), "same".to_string());
        assert_eq!(sc1.put(&files).unwrap(), sc2.put(&files).unwrap());
    }

    #[test]
    fn unknown_extension_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let garbage = tmp.path().join("f.foo");
        fs::write(&garbage, "x").unwrap();
        let err = sc.fetch_archive(&file_url(&garbage), None).unwrap_err();
        assert!(matches!(err, SourceCacheError::UnknownArchiveType { .. }));
    }

    #[test]
    fn non_archive_bytes_fail_at_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let garbage = tmp.path().join("fake.tar.gz");
        fs::write(&garbage, "foo").unwrap();
        let err = sc.fetch_archive(&file_url(&garbage), None).unwrap_err();
        assert!(matches!(err, SourceCacheError::DownloadFailed { .. }));
    }

    #[test]
    fn malformed_local_path_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let err = sc.fetch_archive("/tmp/foo/garbage.tar.gz", None).unwrap_err();
        assert!(matches!(err, SourceCacheError::InvalidUrl { .. }));
    }

    #[test]
    fn mirrors_consulted_before_primary() {
        let tmp = tempfile::tempdir().unwrap();
        let (tarball, key) = make_tarball(tmp.path(), &[("f", "mirrored")]);

        // Lay the pack out in the second mirror using the cache layout.
        let mirror1 = tmp.path().join("mirror1");
        let mirror2 = tmp.path().join("mirror2");
        let dest_dir = mirror2.join("packs/tar.gz");
        fs::create_dir_all(&mirror1).unwrap();
        fs::create_dir_all(&dest_dir).unwrap();
        fs::copy(&tarball, dest_dir.join(&key.digest)).unwrap();

        let sc = SourceCache::with_mirrors(
            &tmp.path().join("cache"),
            vec![
                format!("file:{}", mirror1.display()),
                format!("file:{}", mirror2.display()),
            ],
        )
        .unwrap();
        // The primary URL is unreachable; the mirror satisfies the fetch.
        sc.fetch(Some("file:does-not-exist"), &key, "mock").unwrap();
        assert!(sc.contains(&key).unwrap());
    }

    #[test]
    fn zip_fetch_and_unpack() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();

        let zip_path = tmp.path().join("test.zip");
        {
            let file = fs::File::create(&zip_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("a/b/0/README", options).unwrap();
            writer.write_all(b"file contents").unwrap();
            writer.start_file("a/b/1/README", options).unwrap();
            writer.write_all(b"file contents").unwrap();
            writer.finish().unwrap();
        }

        let key = sc.fetch_archive(&file_url(&zip_path), None).unwrap();
        assert_eq!(key.scheme, Scheme::Zip);

        let target = tempfile::tempdir().unwrap();
        sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("0/README")).unwrap(),
            "file contents"
        );
    }

    // -- git --

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    fn make_git_repo(dir: &Path) -> String {
        fs::create_dir_all(dir).unwrap();
        git_in(dir, &["init", "-q", "-b", "main"]);
        fs::write(dir.join("README"), "First revision").unwrap();
        git_in(dir, &["add", "README"]);
        git_in(dir, &["commit", "-q", "-m", "First revision"]);
        let out = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    #[test]
    fn git_fetch_and_unpack() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        let commit = make_git_repo(&repo);

        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let key = sc
            .fetch_git(repo.to_str().unwrap(), "main", "mock")
            .unwrap();
        assert_eq!(key.to_string(), format!("git:{commit}"));

        // Fetching again with the pinned commit skips the network path.
        let again = sc
            .fetch_git(repo.to_str().unwrap(), &commit, "mock")
            .unwrap();
        assert_eq!(again, key);

        let target = tempfile::tempdir().unwrap();
        sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap();
        assert_eq!(
            fs::read_to_string(target.path().join("README")).unwrap(),
            "First revision"
        );
    }

    #[test]
    fn git_short_rev_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        make_git_repo(&repo);
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let err = sc
            .fetch_git(repo.to_str().unwrap(), "abc123", "mock")
            .unwrap_err();
        assert!(matches!(err, SourceCacheError::Git { .. }));
    }

    #[test]
    fn git_unpack_unknown_commit_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("cache")).unwrap();
        let key = SourceKey::new(Scheme::Git, "267897bb6a35ad602943612ab61d252341fe27b2").unwrap();
        let target = tempfile::tempdir().unwrap();
        let err = sc.unpack(&key, target.path(), UnpackMode::Safe).unwrap_err();
        assert!(matches!(err, SourceCacheError::KeyNotFound { .. }));
    }
}
