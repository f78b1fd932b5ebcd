//! Linux-only host probes: distribution name and user-namespace isolation.
//!
//! Both probes are evaluated once per process and cached.

use std::process::{Command, Stdio};
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::observability::BINARIES_TARGET;

/// Files consulted for the distribution name, in order.
const OS_RELEASE_CANDIDATES: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

static DISTRIBUTION: OnceLock<Option<String>> = OnceLock::new();
static UNSHARE: OnceLock<bool> = OnceLock::new();

/// Returns the detected Linux distribution name (for example `Ubuntu`).
///
/// Returns `None` on other operating systems or when detection fails.
#[must_use]
pub fn distribution_name() -> Option<&'static str> {
    DISTRIBUTION.get_or_init(detect_distribution).as_deref()
}

/// Reports whether commands should be wrapped in `unshare -U`.
///
/// Only root processes with working unprivileged user namespaces qualify;
/// `initdb` refuses to run as root, so the namespace maps root away.
#[must_use]
pub fn unshare_available() -> bool {
    *UNSHARE.get_or_init(detect_unshare)
}

fn detect_distribution() -> Option<String> {
    if !cfg!(target_os = "linux") {
        return None;
    }

    let contents = OS_RELEASE_CANDIDATES
        .iter()
        .find_map(|path| std::fs::read_to_string(path).ok());
    let Some(contents) = contents else {
        warn!(
            target: BINARIES_TARGET,
            "cannot detect the Linux distribution: no os-release file found"
        );
        return None;
    };

    let name = parse_os_release_name(&contents);
    if name.is_none() {
        warn!(
            target: BINARIES_TARGET,
            "cannot detect the Linux distribution: os-release has no NAME entry"
        );
    }
    name
}

/// Extracts and normalises the `NAME=` value of an os-release file.
pub(crate) fn parse_os_release_name(contents: &str) -> Option<String> {
    let raw = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("NAME="))?
        .trim()
        .trim_matches(|ch| ch == '"' || ch == '\'')
        .trim();

    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("Debian") {
        return Some("Debian".to_owned());
    }
    if raw == "openSUSE project" {
        return Some("openSUSE".to_owned());
    }
    Some(raw.to_owned())
}

fn detect_unshare() -> bool {
    if !cfg!(target_os = "linux") || !running_as_root() {
        return false;
    }

    let Some(uid) = probe_output(&["-U", "id", "-u"]) else {
        return false;
    };
    let available = uid.trim() != "0" && probe_output(&["-U", "id", "-un"]).is_some();
    debug!(
        target: BINARIES_TARGET,
        available,
        "probed unshare user-namespace support"
    );
    available
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
const fn running_as_root() -> bool {
    false
}

/// Runs `unshare` with `args`, returning stdout when it exits successfully.
fn probe_output(args: &[&str]) -> Option<String> {
    let output = Command::new("unshare")
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}
