//! Removal of data directories abandoned by crashed processes.
//!
//! A directory qualifies when its lock file is older than [`STALE_AFTER`]
//! and nobody holds the lock. Every failure is logged and skipped so one bad
//! directory never blocks a start.

use std::fs;
use std::time::{Duration, SystemTime};

use camino::Utf8Path;
use tracing::{debug, info, trace, warn};

use super::command::PgTools;
use crate::binaries::LOCK_FILE_NAME;
use crate::fs::remove_dir_all_if_exists;
use crate::lock::FileLock;
use crate::observability::LOG_TARGET;

/// Age after which an unlocked data directory is considered abandoned.
pub(super) const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// Prefix of binary cache entries, which are never reaped.
const BINARY_CACHE_PREFIX: &str = "PG-";

/// Deletes stale sibling data directories beneath `working_dir`.
pub(super) fn reap_stale_data_dirs(working_dir: &Utf8Path, tools: &PgTools) {
    let entries = match working_dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(err) => {
            warn!(target: LOG_TARGET, dir = %working_dir, error = %err, "could not scan for stale data directories");
            return;
        }
    };

    for entry in entries {
        match entry {
            Ok(entry) => {
                let path = entry.path();
                if path.is_dir() && !entry.file_name().starts_with(BINARY_CACHE_PREFIX) {
                    reap_if_stale(path, tools);
                }
            }
            Err(err) => {
                warn!(target: LOG_TARGET, dir = %working_dir, error = %err, "while cleaning old data directories");
            }
        }
    }
}

fn reap_if_stale(dir: &Utf8Path, tools: &PgTools) {
    let lock_path = dir.join(LOCK_FILE_NAME);
    if !is_old(&lock_path) {
        return;
    }

    let held = match FileLock::try_acquire(&lock_path) {
        Ok(Some(held)) => held,
        Ok(None) => {
            trace!(target: LOG_TARGET, dir = %dir, "data directory still locked; skipping");
            return;
        }
        Err(err) => {
            warn!(target: LOG_TARGET, dir = %dir, error = %err, "while cleaning old data directories");
            return;
        }
    };

    info!(target: LOG_TARGET, dir = %dir, "found stale data directory");
    if dir.join("postmaster.pid").exists() {
        match tools.stop(dir) {
            Ok(()) => info!(target: LOG_TARGET, dir = %dir, "shut down orphaned postmaster"),
            Err(err) => warn!(target: LOG_TARGET, dir = %dir, error = %err, "failed to stop orphaned postmaster"),
        }
    }
    match remove_dir_all_if_exists(dir.as_std_path()) {
        Ok(outcome) => debug!(target: LOG_TARGET, dir = %dir, ?outcome, "removed stale data directory"),
        Err(err) => warn!(target: LOG_TARGET, dir = %dir, error = %err, "could not remove stale data directory"),
    }
    held.release();
}

/// Reports whether `lock_path` exists and was last touched before the cutoff.
fn is_old(lock_path: &Utf8Path) -> bool {
    let Ok(modified) = fs::metadata(lock_path).and_then(|meta| meta.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age >= STALE_AFTER)
}
