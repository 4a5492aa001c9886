//! Filesystem primitives shared by the store and the builder.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Creates a symlink, ignoring the error if the destination already exists.
pub fn silent_symlink(target: &Path, link: &Path) -> io::Result<()> {
    match std::os::unix::fs::symlink(target, link) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        other => other,
    }
}

/// Removes a file, ignoring the error if it does not exist.
pub fn silent_unlink(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Overwrites `link` with a symlink to `target` atomically.
///
/// A symlink is first created under a temporary sibling name and then
/// renamed over `link`; rename is atomic on POSIX filesystems, so readers
/// observe either the old or the new link, never a missing one.
pub fn atomic_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let mut i = 0;
    let temp = loop {
        let mut name = link.as_os_str().to_owned();
        name.push(format!("-{i}"));
        let candidate = PathBuf::from(name);
        match std::os::unix::fs::symlink(target, &candidate) {
            Ok(()) => break candidate,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => i += 1,
            Err(e) => return Err(e),
        }
    };
    match fs::rename(&temp, link) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

/// Removes all write permission bits from a file.
///
/// Directories and symlinks are left alone.
pub fn write_protect(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_file() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    let mode = std::os::unix::fs::PermissionsExt::mode(&perms);
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, mode & !0o222);
    fs::set_permissions(path, perms)
}

/// Gzip-compresses `source` into `dest`.
pub fn gzip_compress(source: &Path, dest: &Path) -> io::Result<()> {
    let mut input = fs::File::open(source)?;
    let output = fs::File::create(dest)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    encoder.finish()?;
    Ok(())
}

/// Removes the tree at `path`, then removes any empty parent directories up
/// to (and excluding) `parent`.
pub fn rmtree_up_to(path: &Path, parent: &Path) -> io::Result<()> {
    if path == parent {
        return Ok(());
    }
    if !path.starts_with(parent) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not inside {}", path.display(), parent.display()),
        ));
    }
    if path.exists() {
        // Artifact trees may be write-protected; restore owner write bits
        // on directories so that the removal can proceed.
        restore_dir_write(path)?;
        fs::remove_dir_all(path)?;
    }
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == parent {
            break;
        }
        match fs::remove_dir(dir) {
            Ok(()) => {}
            // Stop at the first non-empty ancestor.
            Err(_) => break,
        }
        current = dir.parent();
    }
    Ok(())
}

fn restore_dir_write(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let p = entry.path();
        if entry.file_type()?.is_dir() {
            let mut perms = fs::symlink_metadata(&p)?.permissions();
            perms.set_mode(perms.mode() | 0o700);
            fs::set_permissions(&p, perms)?;
            restore_dir_write(&p)?;
        }
    }
    Ok(())
}
