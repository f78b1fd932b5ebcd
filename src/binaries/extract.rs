//! Unpacks xz-compressed tar archives of `PostgreSQL` binaries.
//!
//! File bodies are read sequentially from the archive stream and handed to
//! Tokio's blocking pool so disk writes overlap with decompression. Every
//! dispatched write is joined before [`extract_txz`] returns.

use std::collections::BTreeSet;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, Report, eyre};
use filetime::FileTime;
use tar::{Archive, Entry, EntryType};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use xz2::read::XzDecoder;

use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::fs::{add_mode_bits, ensure_dir_exists};
use crate::observability::BINARIES_TARGET;

/// Execute bits granted to everything beneath `bin/`.
const EXECUTE_BITS: u32 = 0o111;

/// Extracts the `.txz` stream in `reader` into `target_dir`.
///
/// Paths that already exist are not rewritten; their modification time is
/// refreshed instead, together with every ancestor up to `target_dir`.
///
/// # Errors
///
/// Returns [`ErrorKind::UnsupportedArchive`] when the stream is not a valid
/// archive, contains an entry type other than file, directory, symlink or
/// hard link, or contains a path escaping `target_dir`. Write failures are
/// reported after all outstanding writes have finished.
///
/// Inside a Tokio runtime the extraction runs on a dedicated thread, since
/// the write pool cannot be driven from an async context.
pub fn extract_txz<R: Read + Send>(reader: R, target_dir: &Utf8Path) -> Result<()> {
    if Handle::try_current().is_err() {
        return extract_blocking(reader, target_dir);
    }
    debug!(target: BINARIES_TARGET, "async runtime detected; extracting on a dedicated thread");
    thread::scope(|scope| -> Result<()> {
        thread::Builder::new()
            .name("pg-embed-extract".to_owned())
            .spawn_scoped(scope, || extract_blocking(reader, target_dir))
            .wrap_err("failed to spawn extraction thread")?
            .join()
            .unwrap_or_else(|_| {
                Err(Error::new(
                    ErrorKind::Other,
                    eyre!("archive extraction thread panicked"),
                ))
            })
    })
}

fn extract_blocking<R: Read>(reader: R, target_dir: &Utf8Path) -> Result<()> {
    ensure_dir_exists(target_dir)?;
    let mut extractor = Extractor::new(target_dir)?;
    let unpacked = extractor.unpack(reader);
    let written = extractor.writes.join_all();
    unpacked?;
    written?;
    extractor.refresh_touched_dirs()
}

struct Extractor<'a> {
    target_dir: &'a Utf8Path,
    writes: PendingWrites,
    touched_dirs: BTreeSet<Utf8PathBuf>,
}

impl<'a> Extractor<'a> {
    fn new(target_dir: &'a Utf8Path) -> Result<Self> {
        Ok(Self {
            target_dir,
            writes: PendingWrites::new()?,
            touched_dirs: BTreeSet::new(),
        })
    }

    fn unpack<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut archive = Archive::new(XzDecoder::new(reader));
        let entries = archive
            .entries()
            .wrap_err("failed to read binary archive")
            .kind(ErrorKind::UnsupportedArchive)?;
        for entry in entries {
            let entry = entry
                .wrap_err("failed to read binary archive entry")
                .kind(ErrorKind::UnsupportedArchive)?;
            self.unpack_entry(entry)?;
        }
        Ok(())
    }

    fn unpack_entry<R: Read>(&mut self, mut entry: Entry<'_, R>) -> Result<()> {
        let raw = entry
            .path()
            .wrap_err("archive entry has an unreadable path")
            .kind(ErrorKind::UnsupportedArchive)?
            .into_owned();
        let relative = contained_path(&raw)?;
        let dest = self.target_dir.join(&relative);
        let executable = relative.starts_with("bin");
        let entry_type = entry.header().entry_type();

        if entry_type == EntryType::XGlobalHeader {
            trace!(target: BINARIES_TARGET, entry = %relative, "skipping pax global header");
            return Ok(());
        }

        if dest.symlink_metadata().is_ok() {
            self.refresh_existing(&dest, executable)?;
            return Ok(());
        }

        match entry_type {
            EntryType::Regular | EntryType::Continuous => {
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .wrap_err_with(|| format!("could not read {relative}"))
                    .kind(ErrorKind::UnsupportedArchive)?;
                if let Some(parent) = dest.parent() {
                    ensure_dir_exists(parent)?;
                }
                self.writes
                    .spawn(move || write_file(&dest, &contents, executable));
            }
            EntryType::Directory => {
                ensure_dir_exists(&dest)?;
                if executable {
                    add_mode_bits(&dest, EXECUTE_BITS)?;
                }
            }
            EntryType::Symlink => {
                let target = link_target(&entry, &relative)?;
                if let Some(parent) = dest.parent() {
                    ensure_dir_exists(parent)?;
                }
                create_symlink(&target, dest.as_std_path())
                    .wrap_err_with(|| format!("could not create symlink {dest}"))?;
            }
            EntryType::Link => {
                let target = link_target(&entry, &relative)?;
                let original = self.target_dir.join(contained_path(&target)?);
                // The link target may still be queued for writing.
                self.writes.join_all()?;
                if let Some(parent) = dest.parent() {
                    ensure_dir_exists(parent)?;
                }
                std::fs::hard_link(&original, &dest)
                    .wrap_err_with(|| format!("could not link {dest} to {original}"))?;
            }
            other => {
                return Err(Error::new(
                    ErrorKind::UnsupportedArchive,
                    eyre!("unsupported entry found: {relative} ({other:?})"),
                ));
            }
        }
        Ok(())
    }

    fn refresh_existing(&mut self, dest: &Utf8Path, executable: bool) -> Result<()> {
        let now = FileTime::now();
        filetime::set_symlink_file_times(dest, now, now)
            .wrap_err_with(|| format!("could not refresh modification time of {dest}"))?;
        if executable {
            add_mode_bits(dest, EXECUTE_BITS)?;
        }

        let mut ancestor = dest.parent();
        while let Some(dir) = ancestor {
            self.touched_dirs.insert(dir.to_path_buf());
            if dir == self.target_dir {
                break;
            }
            ancestor = dir.parent();
        }
        Ok(())
    }

    fn refresh_touched_dirs(&self) -> Result<()> {
        let now = FileTime::now();
        for dir in &self.touched_dirs {
            filetime::set_file_mtime(dir, now)
                .wrap_err_with(|| format!("could not refresh modification time of {dir}"))?;
        }
        debug!(
            target: BINARIES_TARGET,
            refreshed = self.touched_dirs.len(),
            target_dir = %self.target_dir,
            "archive extracted"
        );
        Ok(())
    }
}

/// Converts an archive path into a relative path that stays inside the target.
fn contained_path(raw: &Path) -> Result<Utf8PathBuf> {
    let mut relative = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::new(
                    ErrorKind::UnsupportedArchive,
                    eyre!("archive entry escapes the target directory: {}", raw.display()),
                ));
            }
        }
    }
    Utf8PathBuf::from_path_buf(relative).map_err(|path| {
        Error::new(
            ErrorKind::UnsupportedArchive,
            eyre!("archive entry path is not UTF-8: {}", path.display()),
        )
    })
}

fn link_target<R: Read>(entry: &Entry<'_, R>, relative: &Utf8Path) -> Result<PathBuf> {
    entry
        .link_name()
        .wrap_err_with(|| format!("unreadable link target for {relative}"))
        .kind(ErrorKind::UnsupportedArchive)?
        .map(std::borrow::Cow::into_owned)
        .ok_or_else(|| {
            Error::new(
                ErrorKind::UnsupportedArchive,
                eyre!("link entry {relative} has no target"),
            )
        })
}

fn write_file(dest: &Utf8Path, contents: &[u8], executable: bool) -> color_eyre::Result<()> {
    std::fs::write(dest, contents).wrap_err_with(|| format!("could not write file {dest}"))?;
    if executable {
        add_mode_bits(dest, EXECUTE_BITS)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symbolic links are not supported on this platform",
    ))
}

/// File writes dispatched to the blocking pool and not yet joined.
struct PendingWrites {
    runtime: Runtime,
    handles: Vec<JoinHandle<color_eyre::Result<()>>>,
}

impl PendingWrites {
    fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .build()
            .wrap_err("failed to create runtime for archive extraction")?;
        Ok(Self {
            runtime,
            handles: Vec::new(),
        })
    }

    fn spawn<F>(&mut self, job: F)
    where
        F: FnOnce() -> color_eyre::Result<()> + Send + 'static,
    {
        self.handles.push(self.runtime.spawn_blocking(job));
    }

    /// Waits for every outstanding write and returns the first failure.
    fn join_all(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.handles);
        let failure = self.runtime.block_on(async move {
            let mut first: Option<Report> = None;
            for handle in handles {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(join_err) => Err(eyre!("file write task failed: {join_err}")),
                };
                if let Err(report) = outcome {
                    tracing::error!(target: BINARIES_TARGET, error = %report, "archive write failed");
                    first.get_or_insert(report);
                }
            }
            first
        });
        failure.map_or(Ok(()), |report| Err(Error::from(report)))
    }
}
