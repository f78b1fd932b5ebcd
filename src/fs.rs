//! Shared filesystem helpers for cache and data directories.

use camino::Utf8Path;
use color_eyre::eyre::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;

#[cfg(unix)]
use camino::Utf8PathBuf;
#[cfg(unix)]
use cap_std::{
    ambient_authority,
    fs::{Dir, Permissions, PermissionsExt},
};

/// Resolves a path to an ambient directory handle paired with the relative path component.
///
/// Absolute paths are opened relative to the ambient root; relative paths reuse the current
/// working directory.
#[cfg(unix)]
fn ambient_dir_and_path(path: &Utf8Path) -> Result<(Dir, Utf8PathBuf)> {
    if path.has_root() {
        let stripped = path
            .strip_prefix("/")
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf());
        let dir = Dir::open_ambient_dir("/", ambient_authority())
            .context("open ambient root directory")?;
        Ok((dir, stripped))
    } else {
        let dir = Dir::open_ambient_dir(".", ambient_authority())
            .context("open ambient working directory")?;
        Ok((dir, path.to_path_buf()))
    }
}

/// Ensures the provided path exists, creating intermediate directories when required.
pub(crate) fn ensure_dir_exists(path: &Utf8Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .or_else(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(err)
            }
        })
        .with_context(|| format!("could not create {path}"))
}

/// Adds the given POSIX mode bits to an existing path, keeping its current bits.
///
/// Symbolic links are left untouched so the bits never leak onto a link target.
#[cfg(unix)]
pub(crate) fn add_mode_bits(path: &Utf8Path, bits: u32) -> Result<()> {
    let (dir, relative) = ambient_dir_and_path(path)?;
    if relative.as_str().is_empty() {
        return Ok(());
    }
    let metadata = dir
        .symlink_metadata(relative.as_std_path())
        .with_context(|| format!("stat {path}"))?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mode = metadata.permissions().mode() | bits;
    dir.set_permissions(relative.as_std_path(), Permissions::from_mode(mode))
        .with_context(|| format!("chmod {path}"))
}

/// Adding mode bits is a no-op where POSIX permissions do not exist.
#[cfg(not(unix))]
pub(crate) fn add_mode_bits(_path: &Utf8Path, _bits: u32) -> Result<()> {
    Ok(())
}

/// Outcome of a recursive directory removal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RemovalOutcome {
    Removed,
    Missing,
}

/// Removes `path` recursively, treating an already-missing directory as success.
pub(crate) fn remove_dir_all_if_exists(path: &Path) -> std::io::Result<RemovalOutcome> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(RemovalOutcome::Removed),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RemovalOutcome::Missing),
        Err(err) => Err(err),
    }
}
