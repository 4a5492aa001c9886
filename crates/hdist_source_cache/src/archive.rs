//! Archive storage: fetch, verification, and extraction.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use hdist_common::Digest;

use crate::error::SourceCacheError;
use crate::key::{Scheme, SourceKey};

const CHUNK_SIZE: usize = 16 * 1024;

/// How much verification happens during unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackMode {
    /// Load the archive into memory, verify its digest, then extract.
    /// A corrupt archive has no side effects on the target.
    Safe,
    /// Stream the archive through the hasher and the extractor at once;
    /// the digest is verified at the end, so a corrupt archive may leave
    /// partial output. Callers are expected to extract into a throwaway
    /// directory they can delete.
    Fast,
}

/// Component stripping applied to extracted entry paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strip {
    /// Remove the longest directory prefix shared by every file entry, so
    /// the caller sees the content rooted flat.
    CommonPrefix,
    /// Remove exactly this many leading components; entries that do not
    /// reach below the cut are skipped.
    Components(usize),
}

/// The `meta/<digest>.info` sidecar written next to each pack.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// The scheme the pack was stored under.
    #[serde(rename = "type")]
    pub archive_type: String,
    /// Where the bytes came from.
    pub retrieved_from: String,
}

/// The archive half of the source cache: everything stored as
/// `packs/<scheme>/<digest>` with a JSON sidecar in `meta/`.
pub(crate) struct ArchiveStore {
    packs_path: PathBuf,
    meta_path: PathBuf,
    mirrors: Vec<String>,
}

impl ArchiveStore {
    pub(crate) fn new(cache_path: &Path, mirrors: Vec<String>) -> Self {
        Self {
            packs_path: cache_path.join("packs"),
            meta_path: cache_path.join("meta"),
            mirrors,
        }
    }

    pub(crate) fn pack_path(&self, key: &SourceKey) -> PathBuf {
        self.packs_path.join(key.scheme.as_str()).join(&key.digest)
    }

    fn info_path(&self, digest: &str) -> PathBuf {
        self.meta_path.join(format!("{digest}.info"))
    }

    pub(crate) fn contains(&self, key: &SourceKey) -> bool {
        self.pack_path(key).is_file()
    }

    /// Fetches a pack with a known key, consulting mirrors first.
    ///
    /// A no-op if the key is already present. With no primary URL, only
    /// the mirrors are tried.
    pub(crate) fn fetch(
        &self,
        url: Option<&str>,
        key: &SourceKey,
    ) -> Result<(), SourceCacheError> {
        if self.contains(key) {
            return Ok(());
        }
        let mut candidates: Vec<String> = self
            .mirrors
            .iter()
            .map(|m| format!("{m}/packs/{}/{}", key.scheme, key.digest))
            .collect();
        if let Some(url) = url {
            candidates.push(url.to_string());
        }
        if candidates.is_empty() {
            return Err(SourceCacheError::KeyNotFound {
                key: key.to_string(),
            });
        }

        let mut last_err = None;
        for candidate in &candidates {
            match self.download_and_hash(candidate) {
                Ok((temp, digest)) => {
                    let digest_str = digest.to_string();
                    if digest_str != key.digest {
                        // Removing the temporary happens on drop.
                        last_err = Some(SourceCacheError::DigestMismatch {
                            url: candidate.clone(),
                            expected: key.digest.clone(),
                            actual: digest_str,
                        });
                        continue;
                    }
                    self.commit_pack(temp, key.scheme, &key.digest, candidate)?;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("candidates is non-empty"))
    }

    /// Downloads an archive with an unknown digest and stores it.
    pub(crate) fn fetch_archive(
        &self,
        url: &str,
        archive_type: Option<Scheme>,
    ) -> Result<SourceKey, SourceCacheError> {
        let scheme = match archive_type {
            Some(s) => s,
            None => Scheme::from_url(url)?,
        };
        let (temp, digest) = self.download_and_hash(url)?;
        self.check_magic(temp.path(), scheme, url)?;
        let digest_str = digest.to_string();
        self.commit_pack(temp, scheme, &digest_str, url)?;
        SourceKey::new(scheme, &digest_str)
    }

    /// Stores bytes produced in-process (the `files:` scheme).
    pub(crate) fn store_bytes(
        &self,
        bytes: &[u8],
        key: &SourceKey,
        origin: &str,
    ) -> Result<(), SourceCacheError> {
        if self.contains(key) {
            return Ok(());
        }
        let dir = self.packs_path.join(key.scheme.as_str());
        fs::create_dir_all(&dir).map_err(|e| SourceCacheError::io(&dir, e))?;
        let mut temp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| SourceCacheError::io(&dir, e))?;
        temp.write_all(bytes)
            .map_err(|e| SourceCacheError::io(temp.path(), e))?;
        self.commit_pack(temp, key.scheme, &key.digest, origin)
    }

    fn commit_pack(
        &self,
        temp: tempfile::NamedTempFile,
        scheme: Scheme,
        digest: &str,
        url: &str,
    ) -> Result<(), SourceCacheError> {
        fs::create_dir_all(&self.meta_path).map_err(|e| SourceCacheError::io(&self.meta_path, e))?;
        let info = ArchiveInfo {
            archive_type: scheme.as_str().to_string(),
            retrieved_from: url.to_string(),
        };
        let info_path = self.info_path(digest);
        let encoded = serde_json::to_vec(&info).expect("sidecars always serialize");
        // Racing writers produce identical sidecars, so a plain overwrite
        // is fine; the same goes for the rename below.
        fs::write(&info_path, encoded).map_err(|e| SourceCacheError::io(&info_path, e))?;

        let target = self
            .packs_path
            .join(scheme.as_str())
            .join(digest);
        temp.persist(&target)
            .map_err(|e| SourceCacheError::io(&target, e.error))?;
        Ok(())
    }

    /// Streams a URL to a temporary file inside the cache while hashing it.
    fn download_and_hash(
        &self,
        url: &str,
    ) -> Result<(tempfile::NamedTempFile, Digest), SourceCacheError> {
        let mut stream = open_url(url)?;

        fs::create_dir_all(&self.packs_path)
            .map_err(|e| SourceCacheError::io(&self.packs_path, e))?;
        let mut temp = tempfile::NamedTempFile::new_in(&self.packs_path)
            .map_err(|e| SourceCacheError::io(&self.packs_path, e))?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = stream
                .read(&mut buf)
                .map_err(|e| SourceCacheError::DownloadFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            temp.write_all(&buf[..n])
                .map_err(|e| SourceCacheError::io(temp.path(), e))?;
        }
        Ok((temp, Digest::from_sha256(hasher)))
    }

    fn check_magic(
        &self,
        path: &Path,
        scheme: Scheme,
        url: &str,
    ) -> Result<(), SourceCacheError> {
        let mut f = fs::File::open(path).map_err(|e| SourceCacheError::io(path, e))?;
        let mut magic = [0u8; 4];
        let n = f.read(&mut magic).map_err(|e| SourceCacheError::io(path, e))?;
        let ok = match scheme {
            Scheme::TarGz => n >= 2 && magic[..2] == [0x1f, 0x8b],
            Scheme::TarBz2 => n >= 3 && &magic[..3] == b"BZh",
            Scheme::Zip => n >= 2 && &magic[..2] == b"PK",
            Scheme::Files | Scheme::Git => true,
        };
        if ok {
            Ok(())
        } else {
            Err(SourceCacheError::DownloadFailed {
                url: url.to_string(),
                reason: format!("not a {scheme} archive"),
            })
        }
    }

    /// Unpacks a stored archive into `target`.
    pub(crate) fn unpack(
        &self,
        key: &SourceKey,
        target: &Path,
        mode: UnpackMode,
        strip: Strip,
    ) -> Result<(), SourceCacheError> {
        let pack = self.pack_path(key);
        if !pack.is_file() {
            return Err(SourceCacheError::KeyNotFound {
                key: key.to_string(),
            });
        }
        fs::create_dir_all(target).map_err(|e| SourceCacheError::io(target, e))?;

        match (key.scheme, mode) {
            // Zip needs a seekable reader, so both modes verify up front.
            (Scheme::Zip, _) => self.unpack_zip(key, &pack, target, strip),
            (Scheme::TarGz | Scheme::TarBz2, UnpackMode::Safe) => {
                self.unpack_tar_safe(key, &pack, target, strip)
            }
            (Scheme::TarGz | Scheme::TarBz2, UnpackMode::Fast) => {
                self.unpack_tar_fast(key, &pack, target, strip)
            }
            (Scheme::Files, _) => self.unpack_bundle(key, &pack, target),
            (Scheme::Git, _) => Err(SourceCacheError::UnknownScheme {
                scheme: "git keys are handled by the git cache".to_string(),
            }),
        }
    }

    fn verified_bytes(&self, key: &SourceKey, pack: &Path) -> Result<Vec<u8>, SourceCacheError> {
        let bytes = fs::read(pack).map_err(|e| SourceCacheError::io(pack, e))?;
        if Digest::from_data(&bytes).to_string() != key.digest {
            return Err(SourceCacheError::Corrupt {
                path: pack.to_path_buf(),
            });
        }
        Ok(bytes)
    }

    fn unpack_tar_safe(
        &self,
        key: &SourceKey,
        pack: &Path,
        target: &Path,
        strip: Strip,
    ) -> Result<(), SourceCacheError> {
        let bytes = self.verified_bytes(key, pack)?;

        // First pass: validate every entry path and record file locations
        // so stripping can happen during extraction.
        let mut files = Vec::new();
        {
            let mut archive = tar_archive(key.scheme, &bytes[..]);
            for entry in archive.entries().map_err(|e| tar_err(pack, e))? {
                let entry = entry.map_err(|e| tar_err(pack, e))?;
                let raw = entry.path().map_err(|e| tar_err(pack, e))?;
                let safe = sanitize_entry_path(&raw)?;
                if !entry.header().entry_type().is_dir() {
                    if let Some(safe) = safe {
                        files.push(safe);
                    }
                }
            }
        }
        let prefix = strip_prefix_for(strip, &files);

        let mut archive = tar_archive(key.scheme, &bytes[..]);
        for entry in archive.entries().map_err(|e| tar_err(pack, e))? {
            let mut entry = entry.map_err(|e| tar_err(pack, e))?;
            let raw = entry.path().map_err(|e| tar_err(pack, e))?.into_owned();
            let Some(safe) = sanitize_entry_path(&raw)? else {
                continue;
            };
            let Some(dest) = apply_strip(&safe, strip, &prefix) else {
                continue;
            };
            extract_tar_entry(&mut entry, &target.join(dest), pack)?;
        }
        Ok(())
    }

    fn unpack_tar_fast(
        &self,
        key: &SourceKey,
        pack: &Path,
        target: &Path,
        strip: Strip,
    ) -> Result<(), SourceCacheError> {
        let file = fs::File::open(pack).map_err(|e| SourceCacheError::io(pack, e))?;
        let reader = HashingReader::new(file);
        // Concrete decoder types so the hashing reader can be recovered
        // once the tar stream has been consumed.
        let (extracted, mut raw) = match key.scheme {
            Scheme::TarGz => {
                let archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
                let (files, decoder) = extract_tar_streaming(archive, target, strip, pack)?;
                (files, decoder.into_inner())
            }
            Scheme::TarBz2 => {
                let archive = tar::Archive::new(bzip2::read::BzDecoder::new(reader));
                let (files, decoder) = extract_tar_streaming(archive, target, strip, pack)?;
                (files, decoder.into_inner())
            }
            _ => unreachable!("only tarballs are unpacked in fast mode"),
        };

        // Drain whatever trails the compressed stream so the digest covers
        // the whole pack file, then verify.
        let mut sink = [0u8; CHUNK_SIZE];
        loop {
            let n = raw.read(&mut sink).map_err(|e| SourceCacheError::io(pack, e))?;
            if n == 0 {
                break;
            }
        }
        if raw.finish().to_string() != key.digest {
            return Err(SourceCacheError::Corrupt {
                path: pack.to_path_buf(),
            });
        }

        if let Strip::CommonPrefix = strip {
            let prefix = common_path_prefix(&extracted);
            move_tree_up(target, &prefix)?;
        }
        Ok(())
    }

    fn unpack_zip(
        &self,
        key: &SourceKey,
        pack: &Path,
        target: &Path,
        strip: Strip,
    ) -> Result<(), SourceCacheError> {
        let bytes = self.verified_bytes(key, pack)?;
        let mut archive =
            zip::ZipArchive::new(io::Cursor::new(&bytes[..])).map_err(|e| {
                SourceCacheError::MalformedBundle {
                    path: pack.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;

        let mut files = Vec::new();
        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(|e| zip_err(pack, e))?;
            let raw = PathBuf::from(entry.name());
            let safe = sanitize_entry_path(&raw)?;
            if !entry.is_dir() {
                if let Some(safe) = safe {
                    files.push(safe);
                }
            }
        }
        let prefix = strip_prefix_for(strip, &files);

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| zip_err(pack, e))?;
            let raw = PathBuf::from(entry.name());
            let Some(safe) = sanitize_entry_path(&raw)? else {
                continue;
            };
            let Some(dest) = apply_strip(&safe, strip, &prefix) else {
                continue;
            };
            let dest = target.join(dest);
            if entry.is_dir() {
                fs::create_dir_all(&dest).map_err(|e| SourceCacheError::io(&dest, e))?;
            } else {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| SourceCacheError::io(parent, e))?;
                }
                let mut out =
                    fs::File::create(&dest).map_err(|e| SourceCacheError::io(&dest, e))?;
                io::copy(&mut entry, &mut out).map_err(|e| SourceCacheError::io(&dest, e))?;
            }
        }
        Ok(())
    }

    fn unpack_bundle(
        &self,
        key: &SourceKey,
        pack: &Path,
        target: &Path,
    ) -> Result<(), SourceCacheError> {
        let bytes = fs::read(pack).map_err(|e| SourceCacheError::io(pack, e))?;
        let files = crate::bundle::decode_bundle(&bytes, pack)?;
        if crate::bundle::bundle_digest(&files).to_string() != key.digest {
            return Err(SourceCacheError::Corrupt {
                path: pack.to_path_buf(),
            });
        }
        crate::bundle::scatter_files(&files, target)
    }

    pub(crate) fn delete_all(&self) -> Result<(), SourceCacheError> {
        for dir in [&self.packs_path, &self.meta_path] {
            if dir.exists() {
                fs::remove_dir_all(dir).map_err(|e| SourceCacheError::io(dir, e))?;
            }
        }
        Ok(())
    }
}

/// Opens a URL for reading. `file:` URLs in the simple form (`file:path`,
/// no authority part) read the local filesystem; `http`/`https` go through
/// the HTTP client.
fn open_url(url: &str) -> Result<Box<dyn Read>, SourceCacheError> {
    if let Some(path) = url.strip_prefix("file:") {
        if path.starts_with("//") {
            return Err(SourceCacheError::InvalidUrl {
                url: url.to_string(),
                reason: "file URLs with an authority part are not supported; \
                         use file:/absolute/path"
                    .to_string(),
            });
        }
        let f = fs::File::open(path).map_err(|e| SourceCacheError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        return Ok(Box::new(f));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        tracing::info!("downloading {url}");
        let response = ureq::get(url)
            .call()
            .map_err(|e| SourceCacheError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        return Ok(Box::new(response.into_reader()));
    }
    Err(SourceCacheError::InvalidUrl {
        url: url.to_string(),
        reason: "expected a file:, http:// or https:// URL".to_string(),
    })
}

/// Normalizes an archive entry path, rejecting anything that would land
/// outside the extraction target.
///
/// Returns `None` for entries that normalize to nothing (e.g. `./`).
pub(crate) fn sanitize_entry_path(path: &Path) -> Result<Option<PathBuf>, SourceCacheError> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(SourceCacheError::Security {
                        entry: path.display().to_string(),
                    });
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SourceCacheError::Security {
                    entry: path.display().to_string(),
                });
            }
        }
    }
    if depth == 0 {
        Ok(None)
    } else {
        Ok(Some(out))
    }
}

/// The longest directory prefix shared by every file path.
pub(crate) fn common_path_prefix(files: &[PathBuf]) -> PathBuf {
    let mut prefix: Option<Vec<std::ffi::OsString>> = None;
    for file in files {
        let dirs: Vec<_> = file
            .parent()
            .map(|p| p.iter().map(|c| c.to_os_string()).collect())
            .unwrap_or_default();
        prefix = Some(match prefix {
            None => dirs,
            Some(prev) => prev
                .iter()
                .zip(dirs.iter())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a.clone())
                .collect(),
        });
        if prefix.as_ref().is_some_and(|p| p.is_empty()) {
            break;
        }
    }
    prefix.unwrap_or_default().iter().collect()
}

fn strip_prefix_for(strip: Strip, files: &[PathBuf]) -> PathBuf {
    match strip {
        Strip::CommonPrefix => common_path_prefix(files),
        Strip::Components(_) => PathBuf::new(),
    }
}

fn apply_strip(safe: &Path, strip: Strip, prefix: &Path) -> Option<PathBuf> {
    match strip {
        Strip::Components(n) => strip_n(safe, n),
        Strip::CommonPrefix => match safe.strip_prefix(prefix) {
            Ok(stripped) if stripped.as_os_str().is_empty() => None,
            Ok(stripped) => Some(stripped.to_path_buf()),
            // Directory entries above the common prefix
            Err(_) => None,
        },
    }
}

fn strip_n(path: &Path, n: usize) -> Option<PathBuf> {
    let stripped: PathBuf = path.iter().skip(n).collect();
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped)
    }
}

/// Moves the children of `target/prefix` up into `target` and removes the
/// now-empty prefix chain.
fn move_tree_up(target: &Path, prefix: &Path) -> Result<(), SourceCacheError> {
    if prefix.as_os_str().is_empty() {
        return Ok(());
    }
    let from = target.join(prefix);
    if !from.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&from).map_err(|e| SourceCacheError::io(&from, e))? {
        let entry = entry.map_err(|e| SourceCacheError::io(&from, e))?;
        let dest = target.join(entry.file_name());
        fs::rename(entry.path(), &dest).map_err(|e| SourceCacheError::io(&dest, e))?;
    }
    // Remove prefix directories inside-out.
    let mut current = Some(prefix);
    while let Some(p) = current {
        if p.as_os_str().is_empty() {
            break;
        }
        let dir = target.join(p);
        fs::remove_dir(&dir).map_err(|e| SourceCacheError::io(&dir, e))?;
        current = p.parent();
    }
    Ok(())
}

fn extract_tar_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    dest: &Path,
    pack: &Path,
) -> Result<(), SourceCacheError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| SourceCacheError::io(parent, e))?;
    }
    entry.unpack(dest).map_err(|e| tar_err(pack, e))?;
    Ok(())
}

fn tar_archive<'a>(scheme: Scheme, reader: &'a [u8]) -> tar::Archive<Box<dyn Read + 'a>> {
    let decoded: Box<dyn Read + 'a> = match scheme {
        Scheme::TarGz => Box::new(flate2::read::GzDecoder::new(reader)),
        Scheme::TarBz2 => Box::new(bzip2::read::BzDecoder::new(reader)),
        _ => Box::new(reader),
    };
    tar::Archive::new(decoded)
}

/// Streams tar entries to disk, applying explicit component stripping
/// in-line; common-prefix stripping is deferred to the caller since the
/// prefix is only known once the stream ends. Returns the extracted file
/// paths (pre-strip) and hands the reader back.
fn extract_tar_streaming<R: Read>(
    mut archive: tar::Archive<R>,
    target: &Path,
    strip: Strip,
    pack: &Path,
) -> Result<(Vec<PathBuf>, R), SourceCacheError> {
    let mut extracted = Vec::new();
    for entry in archive.entries().map_err(|e| tar_err(pack, e))? {
        let mut entry = entry.map_err(|e| tar_err(pack, e))?;
        let raw = entry.path().map_err(|e| tar_err(pack, e))?.into_owned();
        let Some(safe) = sanitize_entry_path(&raw)? else {
            continue;
        };
        let is_dir = entry.header().entry_type().is_dir();
        let dest = match strip {
            Strip::Components(n) => match strip_n(&safe, n) {
                Some(stripped) => stripped,
                None => continue,
            },
            Strip::CommonPrefix => safe.clone(),
        };
        extract_tar_entry(&mut entry, &target.join(&dest), pack)?;
        if !is_dir {
            extracted.push(safe);
        }
    }
    Ok((extracted, archive.into_inner()))
}

fn tar_err(pack: &Path, e: io::Error) -> SourceCacheError {
    SourceCacheError::io(pack, e)
}

fn zip_err(pack: &Path, e: zip::result::ZipError) -> SourceCacheError {
    SourceCacheError::MalformedBundle {
        path: pack.to_path_buf(),
        reason: e.to_string(),
    }
}

/// A reader that hashes every byte passing through it.
pub(crate) struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub(crate) fn finish(self) -> Digest {
        Digest::from_sha256(self.hasher)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
