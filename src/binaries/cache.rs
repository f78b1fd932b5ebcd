//! Digest-keyed cache of extracted binaries shared across processes.
//!
//! Each archive is unpacked once into `<working dir>/PG-<sha256>`. Within a
//! process the resulting directory is memoised per resolver and working
//! directory; across processes an `epg-lock` file elects one extractor while
//! the others poll for the `.exists` completion marker.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use sha2::{Digest, Sha256};
use tracing::{error, info, info_span};

use super::extract::extract_txz;
use super::resolver::BinaryResolver;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::fs::{add_mode_bits, ensure_dir_exists};
use crate::lock::FileLock;
use crate::observability::BINARIES_TARGET;
use crate::platform::{OperatingSystem, current_architecture};

/// Lock file shared by cache entries and data directories.
pub(crate) const LOCK_FILE_NAME: &str = "epg-lock";

/// Completion marker written once extraction has finished.
const READY_MARKER: &str = ".exists";

/// Tolerance between the marker and its directory's modification times.
const MARKER_SLACK: Duration = Duration::from_millis(100);

/// Write bits granted on the working directory so other users can share it.
const SHARED_WRITE_BITS: u32 = 0o222;

type PreparedKey = (String, Utf8PathBuf);

static PREPARED: OnceLock<Mutex<HashMap<PreparedKey, Utf8PathBuf>>> = OnceLock::new();

/// How long a non-extracting process waits for the marker.
#[derive(Debug, Clone, Copy)]
struct ReadyPoll {
    attempts: u32,
    interval: Duration,
}

impl ReadyPoll {
    const DEFAULT: Self = Self {
        attempts: 60,
        interval: Duration::from_secs(1),
    };
}

/// Returns the directory holding extracted binaries for `resolver`.
///
/// The first call for a given resolver and working directory resolves,
/// hashes and (when needed) extracts the archive; later calls reuse the
/// memoised directory as long as it still exists. Calls are serialised by a
/// process-wide mutex.
///
/// # Errors
///
/// Propagates resolver failures, returns [`ErrorKind::ExtractionTimeout`]
/// when another process never completes extraction, and extraction errors.
pub fn prepare_binaries(
    resolver: &dyn BinaryResolver,
    working_dir: &Utf8Path,
) -> Result<Utf8PathBuf> {
    let key = (resolver.cache_key(), working_dir.to_path_buf());
    let mut prepared = PREPARED
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = prepared.get(&key).filter(|dir| dir.exists()) {
        return Ok(existing.clone());
    }

    let pg_dir = prepare_uncached(resolver, working_dir, ReadyPoll::DEFAULT)?;
    info!(target: BINARIES_TARGET, path = %pg_dir, "postgres binaries ready");
    prepared.insert(key, pg_dir.clone());
    Ok(pg_dir)
}

fn prepare_uncached(
    resolver: &dyn BinaryResolver,
    working_dir: &Utf8Path,
    poll: ReadyPoll,
) -> Result<Utf8PathBuf> {
    let system = OperatingSystem::current()?;
    let machine = current_architecture();
    info!(target: BINARIES_TARGET, %system, machine, "detected host platform");

    let mut archive = Vec::new();
    resolver
        .resolve(system, machine)?
        .read_to_end(&mut archive)
        .wrap_err("failed to read postgres binary archive")?;
    let digest = format!("{:x}", Sha256::digest(&archive));

    ensure_dir_exists(working_dir)?;
    let pg_dir = working_dir.join(format!("PG-{digest}"));
    ensure_dir_exists(&pg_dir)?;
    add_mode_bits(working_dir, SHARED_WRITE_BITS)?;

    let span = info_span!(target: BINARIES_TARGET, "prepare_binaries", digest = %digest);
    let _entered = span.enter();
    if !binaries_ready(&pg_dir.join(READY_MARKER))? {
        populate(&archive, &pg_dir, poll)?;
    }
    Ok(pg_dir)
}

/// Extracts into `pg_dir` when this process wins the lock, else waits.
fn populate(archive: &[u8], pg_dir: &Utf8Path, poll: ReadyPoll) -> Result<()> {
    let lock_path = pg_dir.join(LOCK_FILE_NAME);
    let marker = pg_dir.join(READY_MARKER);
    let lock = FileLock::try_acquire(&lock_path)
        .wrap_err_with(|| format!("could not open extraction lock {lock_path}"))?;

    let outcome = match lock {
        Some(held) => {
            info!(target: BINARIES_TARGET, path = %pg_dir, "extracting postgres binaries");
            let extracted = extract_txz(archive, pg_dir).and_then(|()| touch_marker(&marker));
            held.release();
            extracted
        }
        None => wait_until_ready(&marker, poll),
    };

    if let Err(err) = remove_lock_file(&lock_path) {
        error!(target: BINARIES_TARGET, path = %lock_path, error = %err, "could not remove lock file");
    }
    outcome
}

fn wait_until_ready(marker: &Utf8Path, poll: ReadyPoll) -> Result<()> {
    info!(
        target: BINARIES_TARGET,
        marker = %marker,
        "another process is extracting postgres binaries; waiting"
    );
    for _ in 0..poll.attempts {
        if binaries_ready(marker)? {
            return Ok(());
        }
        thread::sleep(poll.interval);
    }
    if binaries_ready(marker)? {
        return Ok(());
    }
    let waited = poll.interval.saturating_mul(poll.attempts).as_secs();
    Err(Error::new(
        ErrorKind::ExtractionTimeout,
        eyre!("waited {waited} seconds for postgres to be unpacked into {marker} but it never finished"),
    ))
}

fn touch_marker(marker: &Utf8Path) -> Result<()> {
    if marker.exists() {
        let now = filetime::FileTime::now();
        filetime::set_file_mtime(marker, now)
            .wrap_err_with(|| format!("could not refresh {marker}"))?;
    } else {
        fs::File::create(marker).wrap_err_with(|| format!("could not create {marker}"))?;
    }
    Ok(())
}

fn remove_lock_file(path: &Utf8Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Reports whether the cache entry owning `marker` is completely extracted.
///
/// The marker must be no older than any sibling entry and at most
/// [`MARKER_SLACK`] older than the cache directory itself. A directory with
/// nothing besides the marker is never ready.
fn binaries_ready(marker: &Utf8Path) -> Result<bool> {
    let Some(pg_dir) = marker.parent() else {
        return Ok(false);
    };
    let Ok(marker_meta) = fs::metadata(marker) else {
        return Ok(false);
    };
    let marker_time = modified(&marker_meta, marker)?;

    let mut newest_sibling: Option<SystemTime> = None;
    let listing = fs::read_dir(pg_dir).wrap_err_with(|| format!("could not list {pg_dir}"))?;
    for entry in listing {
        let entry = entry.wrap_err_with(|| format!("could not list {pg_dir}"))?;
        if entry.file_name() == READY_MARKER {
            continue;
        }
        let meta = entry
            .metadata()
            .wrap_err_with(|| format!("could not stat {}", entry.path().display()))?;
        let time = modified(&meta, pg_dir)?;
        newest_sibling = Some(newest_sibling.map_or(time, |current| current.max(time)));
    }
    let Some(newest_sibling) = newest_sibling else {
        return Ok(false);
    };

    let dir_meta = fs::metadata(pg_dir).wrap_err_with(|| format!("could not stat {pg_dir}"))?;
    let dir_time = modified(&dir_meta, pg_dir)?;
    Ok(dir_time <= marker_time + MARKER_SLACK && newest_sibling <= marker_time)
}

fn modified(meta: &fs::Metadata, path: &Utf8Path) -> Result<SystemTime> {
    meta.modified()
        .wrap_err_with(|| format!("failed to read last modified time of {path}"))
        .kind(ErrorKind::Other)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaries::extract::tests::txz_with_files;
    use crate::binaries::resolver::ArchiveFileResolver;
    use filetime::FileTime;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUICK_POLL: ReadyPoll = ReadyPoll {
        attempts: 5,
        interval: Duration::from_millis(10),
    };

    #[derive(Debug)]
    struct CountingResolver {
        inner: ArchiveFileResolver,
        calls: Arc<AtomicUsize>,
    }

    impl BinaryResolver for CountingResolver {
        fn resolve(&self, system: OperatingSystem, raw_arch: &str) -> Result<Box<dyn Read + Send>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(system, raw_arch)
        }

        fn cache_key(&self) -> String {
            self.inner.cache_key()
        }
    }

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
        (dir, path)
    }

    fn archive_file(dir: &Utf8Path) -> Utf8PathBuf {
        let path = dir.join("postgres-test.txz");
        fs::write(&path, txz_with_files(&[("bin/postgres", b"#!/bin/sh\n")])).expect("write archive");
        path
    }

    #[test]
    fn prepares_once_and_reuses_the_directory() {
        let (_guard, root) = utf8_tempdir();
        let working_dir = root.join("work");
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = CountingResolver {
            inner: ArchiveFileResolver::new(archive_file(&root)),
            calls: Arc::clone(&calls),
        };

        let first = prepare_binaries(&resolver, &working_dir).expect("first prepare");
        let second = prepare_binaries(&resolver, &working_dir).expect("second prepare");

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "archive should be resolved once");
        assert!(first.file_name().is_some_and(|name| name.starts_with("PG-")));
        assert!(first.join("bin/postgres").is_file());
        assert!(first.join(READY_MARKER).is_file());
        assert!(!first.join(LOCK_FILE_NAME).exists(), "lock file should be removed");
    }

    #[test]
    fn vanished_directories_are_prepared_again() {
        let (_guard, root) = utf8_tempdir();
        let working_dir = root.join("work");
        let resolver = ArchiveFileResolver::new(archive_file(&root));

        let first = prepare_binaries(&resolver, &working_dir).expect("first prepare");
        fs::remove_dir_all(&first).expect("remove cache entry");
        let second = prepare_binaries(&resolver, &working_dir).expect("second prepare");

        assert_eq!(first, second);
        assert!(second.join("bin/postgres").is_file());
    }

    #[test]
    fn marker_older_than_content_is_not_ready() {
        let (_guard, pg_dir) = utf8_tempdir();
        fs::write(pg_dir.join("PG_VERSION"), b"16").expect("write content");
        let marker = pg_dir.join(READY_MARKER);
        fs::write(&marker, b"").expect("write marker");
        assert!(binaries_ready(&marker).expect("check"));

        let stale = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(60));
        filetime::set_file_mtime(&marker, stale).expect("age marker");

        assert!(!binaries_ready(&marker).expect("check"));
    }

    #[test]
    fn marker_alone_is_not_ready() {
        let (_guard, pg_dir) = utf8_tempdir();
        let marker = pg_dir.join(READY_MARKER);
        fs::write(&marker, b"").expect("write marker");

        assert!(!binaries_ready(&marker).expect("check"));
    }

    #[test]
    fn waits_for_a_concurrent_extractor() {
        let (_guard, pg_dir) = utf8_tempdir();
        let other = FileLock::try_acquire(&pg_dir.join(LOCK_FILE_NAME))
            .expect("open lock")
            .expect("lock granted");

        let writer_dir = pg_dir.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            fs::write(writer_dir.join("postgres"), b"bin").expect("write content");
            touch_marker(&writer_dir.join(READY_MARKER)).expect("mark ready");
            other.release();
        });

        // A garbage archive proves this process never extracts.
        populate(b"not an archive", &pg_dir, ReadyPoll {
            attempts: 100,
            interval: Duration::from_millis(10),
        })
        .expect("wait for other extractor");
        writer.join().expect("writer thread");

        assert_eq!(fs::read(pg_dir.join("postgres")).expect("read"), b"bin");
    }

    #[test]
    fn waiting_gives_up_after_bounded_polls() {
        let (_guard, pg_dir) = utf8_tempdir();
        let held = FileLock::try_acquire(&pg_dir.join(LOCK_FILE_NAME))
            .expect("open lock")
            .expect("lock granted");

        let err = populate(b"unused", &pg_dir, QUICK_POLL).expect_err("must time out");
        held.release();

        assert_eq!(err.kind(), ErrorKind::ExtractionTimeout);
    }
}
