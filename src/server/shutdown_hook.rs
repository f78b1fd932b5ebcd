//! Process-exit hook that closes every live server.
//!
//! Instances register themselves once their data directory is locked. A
//! single `extern "C"` callback installed with [`libc::atexit`] drains the
//! registry at exit and runs the regular close path for each survivor, so
//! servers held in process-wide statics are still stopped.
//!
//! The signal helpers below are shared with the close path, which escalates
//! to `SIGTERM`/`SIGKILL` when `pg_ctl stop` fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use uuid::Uuid;

use super::Instance;
use crate::error::Result;
use crate::observability::LOG_TARGET;

type Registry = Mutex<HashMap<Uuid, Weak<Instance>>>;

static LIVE: OnceLock<Registry> = OnceLock::new();
static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

fn registry() -> &'static Registry {
    LIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Tracks `instance` so it is closed at process exit.
///
/// # Errors
///
/// Returns an error if `atexit(3)` registration fails.
pub(super) fn register(instance: &Arc<Instance>) -> Result<()> {
    install_hook()?;
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(instance.id, Arc::downgrade(instance));
    Ok(())
}

/// Forgets a closed instance.
pub(super) fn unregister(id: Uuid) {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

#[cfg(unix)]
fn install_hook() -> Result<()> {
    if HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    // SAFETY: `close_live_instances` is an `extern "C"` function with no
    // parameters and no return value, matching the signature required by
    // `atexit(3)`. It only touches the `LIVE` static, which lives for the
    // whole process.
    let rc = unsafe { libc::atexit(close_live_instances) };
    if rc != 0 {
        HOOK_INSTALLED.store(false, Ordering::SeqCst);
        return Err(color_eyre::eyre::eyre!("libc::atexit registration failed (rc={rc})").into());
    }
    tracing::debug!(target: LOG_TARGET, "registered atexit shutdown hook");
    Ok(())
}

#[cfg(not(unix))]
fn install_hook() -> Result<()> {
    if !HOOK_INSTALLED.swap(true, Ordering::SeqCst) {
        tracing::debug!(
            target: LOG_TARGET,
            "process-exit hook unavailable on this platform; servers stop on drop only"
        );
    }
    Ok(())
}

/// Callback invoked by the C runtime during process exit.
#[cfg(unix)]
extern "C" fn close_live_instances() {
    let survivors: Vec<Arc<Instance>> = registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .filter_map(|(_, instance)| instance.upgrade())
        .collect();
    for instance in survivors {
        instance.close();
    }
}

#[cfg(unix)]
pub(super) mod signals {
    //! Last-resort termination of a postmaster through its pid file.

    use std::path::Path;
    use std::time::{Duration, Instant};

    /// Polling interval when waiting for the postmaster to exit.
    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Grace period after `SIGKILL` before the data directory is touched.
    const POST_SIGKILL_GRACE: Duration = Duration::from_millis(100);

    /// Waits up to `timeout` for `postmaster.pid` to name a process.
    ///
    /// A `pg_ctl` killed mid-start may already have forked the postmaster,
    /// which writes its pid file shortly afterwards.
    pub(crate) fn await_postmaster_pid(data_dir: &Path, timeout: Duration) -> Option<libc::pid_t> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pid) = read_postmaster_pid(data_dir) {
                return Some(pid);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Sends `SIGTERM` and escalates to `SIGKILL` after `timeout`.
    ///
    /// Returns `true` when the process is gone afterwards.
    pub(crate) fn terminate(pid: libc::pid_t, timeout: Duration) -> bool {
        if !process_is_running(pid) {
            return true;
        }
        send_signal(pid, libc::SIGTERM);
        if wait_for_exit(pid, timeout) {
            return true;
        }
        send_signal(pid, libc::SIGKILL);
        std::thread::sleep(POST_SIGKILL_GRACE);
        !process_is_running(pid)
    }

    fn send_signal(pid: libc::pid_t, signal: libc::c_int) {
        // SAFETY: The PID was read from the postmaster.pid file written by a
        // server this crate started. A stale PID yields ESRCH, which is ignored.
        unsafe {
            libc::kill(pid, signal);
        }
    }

    fn wait_for_exit(pid: libc::pid_t, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !process_is_running(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Reads the postmaster PID from `data_dir/postmaster.pid`.
    pub(crate) fn read_postmaster_pid(data_dir: &Path) -> Option<libc::pid_t> {
        let contents = std::fs::read_to_string(data_dir.join("postmaster.pid")).ok()?;
        contents.lines().next()?.trim().parse::<libc::pid_t>().ok()
    }

    /// Returns `true` if a process with the given PID exists.
    pub(crate) fn process_is_running(pid: libc::pid_t) -> bool {
        if pid <= 0 {
            return false;
        }
        // SAFETY: Signal 0 probes for existence without delivering anything.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        !matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(code) if code == libc::ESRCH
        )
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::fs;
        use std::process::Command;
        use tempfile::tempdir;

        #[test]
        fn reads_pid_from_first_line() {
            let dir = tempdir().expect("tempdir");
            fs::write(dir.path().join("postmaster.pid"), "12345\n/data\n").expect("write");

            assert_eq!(read_postmaster_pid(dir.path()), Some(12345));
        }

        #[test]
        fn missing_or_empty_pid_file_yields_none() {
            let dir = tempdir().expect("tempdir");
            assert_eq!(read_postmaster_pid(dir.path()), None);

            fs::write(dir.path().join("postmaster.pid"), "").expect("write");
            assert_eq!(read_postmaster_pid(dir.path()), None);
        }

        #[test]
        fn current_process_is_running() {
            #[expect(
                clippy::cast_possible_wrap,
                reason = "process IDs are always within i32 range on Unix"
            )]
            let pid = std::process::id() as libc::pid_t;

            assert!(process_is_running(pid));
            assert!(!process_is_running(i32::MAX));
        }

        #[test]
        fn terminate_stops_a_child_process() {
            let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
            #[expect(
                clippy::cast_possible_wrap,
                reason = "process IDs are always within i32 range on Unix"
            )]
            let pid = child.id() as libc::pid_t;

            let reaper = std::thread::spawn(move || child.wait());
            assert!(terminate(pid, Duration::from_secs(2)));
            reaper.join().expect("reaper thread").expect("wait child");
        }
    }
}
