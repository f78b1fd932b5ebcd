//! Lifecycle of a single embedded `PostgreSQL` server.
//!
//! [`EmbeddedPostgresBuilder::start`] resolves binaries, initialises and
//! locks a data directory, then launches the postmaster. The resulting
//! [`EmbeddedPostgres`] owns the server until [`EmbeddedPostgres::close`] or
//! drop. A process-exit hook closes anything still running at exit.

mod builder;
pub(crate) mod command;
mod reaper;
mod shutdown_hook;

pub use self::builder::EmbeddedPostgresBuilder;

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use postgres::Client;
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

use self::builder::DEFAULT_STARTUP_WAIT;
use self::command::{PgTools, SUPERUSER};
use crate::binaries::{BinaryResolver, DefaultBinaryResolver, LOCK_FILE_NAME, prepare_binaries};
use crate::config::EmbedSettings;
use crate::connection::ConnectionInfo;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::{ensure_dir_exists, remove_dir_all_if_exists};
use crate::lock::FileLock;
use crate::observability::LOG_TARGET;

/// Template database every `CREATE DATABASE` copies from.
pub const TEMPLATE_DATABASE: &str = "template1";

/// How long close waits for a half-started postmaster to write its pid file.
#[cfg(unix)]
const PID_FILE_WAIT: Duration = Duration::from_secs(1);

/// How long a `SIGTERM`ed postmaster gets before `SIGKILL`.
#[cfg(unix)]
const FORCED_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination of `initdb` and `pg_ctl` output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ProcessOutput {
    /// Forward each line to `tracing` at debug level.
    #[default]
    Log,
    /// Share the test process's stdout and stderr.
    Inherit,
    /// Drop all output.
    Discard,
}

/// A running embedded `PostgreSQL` server.
///
/// Closing is idempotent and never fails; dropping the value closes it.
pub struct EmbeddedPostgres {
    inner: Arc<Instance>,
}

/// State shared between an [`EmbeddedPostgres`] and the exit hook.
pub(crate) struct Instance {
    id: Uuid,
    port: u16,
    data_dir: Utf8PathBuf,
    connect_config: BTreeMap<String, String>,
    tools: PgTools,
    clean_data_directory: bool,
    cleanup_suppressed: bool,
    lock: Mutex<Option<FileLock>>,
    postmaster_launched: AtomicBool,
    closed: AtomicBool,
}

impl EmbeddedPostgres {
    /// Returns a builder with default settings.
    #[must_use]
    pub fn builder() -> EmbeddedPostgresBuilder {
        EmbeddedPostgresBuilder::new()
    }

    /// Starts a server with default settings.
    ///
    /// # Errors
    ///
    /// See [`EmbeddedPostgresBuilder::start`].
    pub fn start() -> Result<Self> {
        Self::builder().start()
    }

    fn start_with(config: &EmbeddedPostgresBuilder) -> Result<Self> {
        let settings = EmbedSettings::load()?;
        let working_dir = config
            .working_directory
            .clone()
            .unwrap_or_else(|| settings.working_directory());
        let resolver = config.resolver.clone().map_or_else(
            || {
                DefaultBinaryResolver::from_settings(&settings)
                    .map(|found| Arc::new(found) as Arc<dyn BinaryResolver>)
            },
            Ok,
        )?;
        let pg_dir = prepare_binaries(resolver.as_ref(), &working_dir)?;
        let tools = PgTools::new(&pg_dir, config.output);

        let id = Uuid::new_v4();
        let span = info_span!(target: LOG_TARGET, "start", instance = %id);
        let _entered = span.enter();

        reaper::reap_stale_data_dirs(&working_dir, &tools);
        let data_dir = config
            .data_directory
            .clone()
            .unwrap_or_else(|| working_dir.join(id.to_string()));
        ensure_dir_exists(&data_dir)?;
        let port = match config.port {
            0 => detect_free_port()?,
            port => port,
        };
        let startup_wait = config
            .startup_wait
            .or_else(|| settings.startup_timeout())
            .unwrap_or(DEFAULT_STARTUP_WAIT);
        debug!(target: LOG_TARGET, data_dir = %data_dir, port, "postgres data directory selected");

        if !data_dir.join("postgresql.conf").exists() {
            initialise(&tools, &data_dir, config)?;
        }
        let lock = lock_data_dir(&data_dir)?;

        // From here on, dropping `pg` closes the server and releases the lock.
        let pg = Self {
            inner: Arc::new(Instance {
                id,
                port,
                data_dir,
                connect_config: config.connect_config.clone(),
                tools,
                clean_data_directory: config.clean_data_directory,
                cleanup_suppressed: settings.cleanup_suppressed(),
                lock: Mutex::new(Some(lock)),
                postmaster_launched: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };
        shutdown_hook::register(&pg.inner)?;
        if let Some(customizer) = &config.customizer {
            debug!(target: LOG_TARGET, customizer = %customizer.name, "customizing data directory");
            (customizer.customize)(pg.inner.data_dir.as_path())?;
        }
        pg.inner.launch(&config.server_config, startup_wait)?;
        Ok(pg)
    }

    /// Returns the unique identifier of this instance.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the TCP port the server listens on.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Returns the data directory owned by this instance.
    #[must_use]
    pub fn data_directory(&self) -> &Utf8Path {
        &self.inner.data_dir
    }

    /// Returns the properties copied into every issued [`ConnectionInfo`].
    #[must_use]
    pub fn connect_config(&self) -> &BTreeMap<String, String> {
        &self.inner.connect_config
    }

    /// Describes the `postgres` database as the superuser.
    #[must_use]
    pub fn postgres_database(&self) -> ConnectionInfo {
        self.database(SUPERUSER, SUPERUSER)
    }

    /// Describes the `postgres` database with `properties` layered over the
    /// connect config.
    #[must_use]
    pub fn postgres_database_with_properties<I, K, V>(&self, properties: I) -> ConnectionInfo
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.database_with_properties(SUPERUSER, SUPERUSER, properties)
    }

    /// Describes the `template1` database as the superuser.
    #[must_use]
    pub fn template_database(&self) -> ConnectionInfo {
        self.database(SUPERUSER, TEMPLATE_DATABASE)
    }

    /// Describes `db_name` accessed as `user`, with the builder's connect config.
    #[must_use]
    pub fn database(&self, user: &str, db_name: &str) -> ConnectionInfo {
        ConnectionInfo::with_properties(db_name, self.inner.port, user, &self.inner.connect_config)
    }

    /// Like [`Self::database`]; entries in `properties` win over the
    /// connect config.
    #[must_use]
    pub fn database_with_properties<I, K, V>(
        &self,
        user: &str,
        db_name: &str,
        properties: I,
    ) -> ConnectionInfo
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.inner.connect_config.clone();
        merged.extend(
            properties
                .into_iter()
                .map(|(key, value)| (key.into(), value.into())),
        );
        ConnectionInfo::with_properties(db_name, self.inner.port, user, merged)
    }

    /// Renders the connection URL for `db_name` accessed as `user`.
    #[must_use]
    pub fn database_url(&self, user: &str, db_name: &str) -> String {
        ConnectionInfo::new(db_name, self.inner.port, user).url()
    }

    /// Opens a client connection to `db_name` as `user`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Database`] when the connection fails.
    pub fn connect(&self, user: &str, db_name: &str) -> Result<Client> {
        self.database(user, db_name).connect()
    }

    /// Reports whether [`Self::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stops the server, releases the lock and removes the data directory.
    ///
    /// Only the first call has any effect. Failures are logged, never
    /// returned.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for EmbeddedPostgres {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Display for EmbeddedPostgres {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmbeddedPG-{}", self.inner.id)
    }
}

impl fmt::Debug for EmbeddedPostgres {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedPostgres")
            .field("instance_id", &self.inner.id)
            .field("port", &self.inner.port)
            .field("data_dir", &self.inner.data_dir)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Instance {
    fn launch(&self, server_config: &BTreeMap<String, String>, startup_wait: Duration) -> Result<()> {
        let begun = Instant::now();
        self.postmaster_launched.store(true, Ordering::SeqCst);
        self.tools
            .start(&self.data_dir, self.port, server_config, startup_wait)?;
        info!(
            target: LOG_TARGET,
            instance = %self.id,
            port = self.port,
            elapsed_ms = elapsed_ms(begun),
            "postmaster startup finished"
        );
        Ok(())
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = info_span!(target: LOG_TARGET, "close", instance = %self.id);
        let _entered = span.enter();

        if self.postmaster_launched.load(Ordering::SeqCst) {
            self.stop_postmaster();
        }
        if let Some(lock) = self
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            lock.release();
        }
        self.remove_data_dir();
        shutdown_hook::unregister(self.id);
    }

    fn stop_postmaster(&self) {
        let begun = Instant::now();
        match self.tools.stop(&self.data_dir) {
            Ok(()) => info!(
                target: LOG_TARGET,
                elapsed_ms = elapsed_ms(begun),
                "shut down postmaster"
            ),
            Err(err) => {
                error!(target: LOG_TARGET, error = %err, "could not stop postmaster");
                self.force_stop();
            }
        }
    }

    #[cfg(unix)]
    fn force_stop(&self) {
        use self::shutdown_hook::signals;

        let Some(pid) = signals::await_postmaster_pid(self.data_dir.as_std_path(), PID_FILE_WAIT)
        else {
            debug!(target: LOG_TARGET, "no postmaster pid file; nothing left to terminate");
            return;
        };
        if signals::terminate(pid, FORCED_STOP_TIMEOUT) {
            tracing::warn!(target: LOG_TARGET, pid, "terminated postmaster with signals");
        } else {
            error!(target: LOG_TARGET, pid, "postmaster survived SIGKILL");
        }
    }

    #[cfg(not(unix))]
    fn force_stop(&self) {
        debug!(target: LOG_TARGET, "signal escalation unavailable on this platform");
    }

    fn remove_data_dir(&self) {
        if !self.clean_data_directory || self.cleanup_suppressed {
            info!(target: LOG_TARGET, data_dir = %self.data_dir, "did not clean up directory");
            return;
        }
        match remove_dir_all_if_exists(self.data_dir.as_std_path()) {
            Ok(outcome) => debug!(target: LOG_TARGET, data_dir = %self.data_dir, ?outcome, "data directory removed"),
            Err(err) => error!(
                target: LOG_TARGET,
                data_dir = %self.data_dir,
                error = %err,
                "could not clean up directory"
            ),
        }
    }
}

/// Runs `initdb`, discarding a generated data directory when it fails.
fn initialise(tools: &PgTools, data_dir: &Utf8Path, config: &EmbeddedPostgresBuilder) -> Result<()> {
    let begun = Instant::now();
    if let Err(err) = tools.initdb(data_dir, &config.locale_config) {
        if config.data_directory.is_none() {
            drop(remove_dir_all_if_exists(data_dir.as_std_path()));
        }
        return Err(err);
    }
    info!(target: LOG_TARGET, elapsed_ms = elapsed_ms(begun), "initdb completed");
    Ok(())
}

fn lock_data_dir(data_dir: &Utf8Path) -> Result<FileLock> {
    let lock_path = data_dir.join(LOCK_FILE_NAME);
    let lock = FileLock::try_acquire(&lock_path)
        .wrap_err_with(|| format!("could not open {lock_path}"))?;
    lock.ok_or_else(|| Error::new(ErrorKind::LockHeld, eyre!("could not lock {lock_path}")))
}

fn detect_free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).wrap_err("failed to detect a free port")?;
    let port = listener
        .local_addr()
        .wrap_err("failed to detect a free port")?
        .port();
    Ok(port)
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaries::ArchiveFileResolver;
    use serial_test::serial;
    use temp_env::with_vars;

    fn sandbox() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
        (dir, path)
    }

    #[test]
    fn free_port_is_non_zero() {
        assert_ne!(detect_free_port().expect("port"), 0);
    }

    #[cfg(unix)]
    #[test]
    fn held_data_directory_lock_is_reported() {
        let (_guard, dir) = sandbox();
        let _held = lock_data_dir(&dir).expect("first lock");

        let err = lock_data_dir(&dir).expect_err("second lock must fail");

        assert_eq!(err.kind(), ErrorKind::LockHeld);
    }

    #[test]
    #[serial]
    fn missing_archive_fails_before_touching_the_working_directory() {
        let (_guard, root) = sandbox();
        let working_dir = root.join("work");

        let err = with_vars([("PG_EMBED_STARTUP_TIMEOUT_SECS", None::<&str>)], || {
            EmbeddedPostgres::builder()
                .working_directory(working_dir.clone())
                .binary_resolver(Arc::new(ArchiveFileResolver::new(root.join("absent.txz"))))
                .start()
        })
        .expect_err("start must fail");

        assert_eq!(err.kind(), ErrorKind::MissingBinaries);
        assert!(!working_dir.exists());
    }

    #[test]
    fn connection_helpers_use_the_instance_port() {
        let (_guard, root) = sandbox();
        let pg = EmbeddedPostgres {
            inner: Arc::new(Instance {
                id: Uuid::new_v4(),
                port: 15432,
                data_dir: root.join("data"),
                connect_config: BTreeMap::from([("application_name".to_owned(), "unit".to_owned())]),
                tools: PgTools::new(&root, ProcessOutput::Discard),
                clean_data_directory: true,
                cleanup_suppressed: false,
                lock: Mutex::new(None),
                postmaster_launched: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };

        assert_eq!(pg.template_database().db_name(), TEMPLATE_DATABASE);
        assert_eq!(pg.postgres_database().user(), SUPERUSER);
        assert_eq!(
            pg.database("alice", "orders").url(),
            "postgresql://localhost:15432/orders?user=alice&application_name=unit"
        );
        assert_eq!(
            pg.database_url("alice", "orders"),
            "postgresql://localhost:15432/orders?user=alice"
        );
        assert_eq!(
            pg.database_with_properties("alice", "orders", [("application_name", "call"), ("sslmode", "disable")])
                .url(),
            "postgresql://localhost:15432/orders?user=alice&application_name=call&sslmode=disable"
        );
        let admin = pg.postgres_database_with_properties([("connect_timeout", "3")]);
        assert_eq!(admin.db_name(), SUPERUSER);
        assert_eq!(admin.properties().len(), 2);
        assert_eq!(pg.connect_config().len(), 1);
    }

    #[test]
    fn close_is_idempotent_and_removes_the_data_directory() {
        let (_guard, root) = sandbox();
        let data_dir = root.join("data");
        std::fs::create_dir_all(&data_dir).expect("data dir");
        let lock = lock_data_dir(&data_dir).expect("lock");
        let pg = EmbeddedPostgres {
            inner: Arc::new(Instance {
                id: Uuid::new_v4(),
                port: 15433,
                data_dir: data_dir.clone(),
                connect_config: BTreeMap::new(),
                tools: PgTools::new(&root, ProcessOutput::Discard),
                clean_data_directory: true,
                cleanup_suppressed: false,
                lock: Mutex::new(Some(lock)),
                postmaster_launched: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };

        pg.close();
        pg.close();

        assert!(pg.is_closed());
        assert!(!data_dir.exists());
    }

    #[test]
    fn suppressed_cleanup_keeps_the_data_directory() {
        let (_guard, root) = sandbox();
        let data_dir = root.join("kept");
        std::fs::create_dir_all(&data_dir).expect("data dir");
        let pg = EmbeddedPostgres {
            inner: Arc::new(Instance {
                id: Uuid::new_v4(),
                port: 15434,
                data_dir: data_dir.clone(),
                connect_config: BTreeMap::new(),
                tools: PgTools::new(&root, ProcessOutput::Discard),
                clean_data_directory: true,
                cleanup_suppressed: true,
                lock: Mutex::new(None),
                postmaster_launched: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        };

        drop(pg);

        assert!(data_dir.exists());
    }
}
