//! Soft-skip heuristics for tests that need real `PostgreSQL` binaries.
//!
//! Hosts without a resolvable archive, or where `initdb` refuses to run,
//! log a `SKIP-TEST-CLUSTER` warning instead of failing.

use pg_embed_prepared::{EmbeddedPostgres, EmbeddedPostgresBuilder, Error, ErrorKind};

/// Prefix carried by every soft-skip warning.
pub const SKIP_TEST_CLUSTER_PREFIX: &str = "SKIP-TEST-CLUSTER";

/// Process failures caused by the host rather than the code under test.
const PROCESS_SKIP_CONDITIONS: &[(&str, &str)] = &[
    (
        "cannot be run as root",
        "initdb refuses to run as root and unshare is unavailable",
    ),
    (
        "No such file or directory",
        "PostgreSQL binaries were unavailable for the requested operation",
    ),
    (
        "Permission denied",
        "the working directory is not writable",
    ),
];

/// Returns the skip reason when `err` stems from the host environment.
pub fn skip_reason(err: &Error) -> Option<String> {
    let message = format!("{err:?}");
    match err.kind() {
        ErrorKind::MissingBinaries => Some(format!(
            "{SKIP_TEST_CLUSTER_PREFIX}: no PostgreSQL archive resolvable: {err}"
        )),
        ErrorKind::ProcessFailed => PROCESS_SKIP_CONDITIONS
            .iter()
            .find(|(needle, _)| message.contains(needle))
            .map(|(_, reason)| format!("{SKIP_TEST_CLUSTER_PREFIX}: {reason}: {err}")),
        _ => None,
    }
}

/// Starts `builder`, or logs a skip and returns `None` on host failures.
///
/// # Panics
///
/// Panics on failures that are not host-related.
pub fn start_or_skip(builder: &EmbeddedPostgresBuilder) -> Option<EmbeddedPostgres> {
    match builder.start() {
        Ok(pg) => Some(pg),
        Err(err) => match skip_reason(&err) {
            Some(reason) => {
                tracing::warn!("{reason}");
                None
            }
            None => panic!("embedded postgres failed to start: {err:?}"),
        },
    }
}

/// Routes `tracing` output through the test harness so skips stay visible.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init(),
    );
}
