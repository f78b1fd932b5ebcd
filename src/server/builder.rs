//! Value-typed configuration collected before a server is started.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use super::{EmbeddedPostgres, ProcessOutput};
use crate::binaries::BinaryResolver;
use crate::error::Result;

/// Startup wait applied when neither the builder nor the environment sets one.
pub(crate) const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(10);

pub(super) type CustomizeFn = dyn Fn(&Utf8Path) -> Result<()> + Send + Sync;

/// A data-directory callback identified by name.
#[derive(Clone)]
pub(super) struct DataDirectoryCustomizer {
    pub(super) name: String,
    pub(super) customize: Arc<CustomizeFn>,
}

/// Collects overrides for an [`EmbeddedPostgres`] instance.
///
/// Two builders compare equal when every setting is equal; the binary
/// resolver is compared through [`BinaryResolver::cache_key`] and a
/// data-directory customizer through its name. This makes the builder usable
/// as part of a memoisation key.
///
/// # Examples
/// ```no_run
/// use std::time::Duration;
/// use pg_embed_prepared::EmbeddedPostgres;
///
/// let pg = EmbeddedPostgres::builder()
///     .server_config("log_statement", "all")
///     .startup_wait(Duration::from_secs(30))
///     .start()?;
/// println!("listening on {}", pg.port());
/// # Ok::<(), pg_embed_prepared::Error>(())
/// ```
#[derive(Clone)]
pub struct EmbeddedPostgresBuilder {
    pub(super) server_config: BTreeMap<String, String>,
    pub(super) locale_config: BTreeMap<String, String>,
    pub(super) connect_config: BTreeMap<String, String>,
    pub(super) port: u16,
    pub(super) data_directory: Option<Utf8PathBuf>,
    pub(super) clean_data_directory: bool,
    pub(super) startup_wait: Option<Duration>,
    pub(super) working_directory: Option<Utf8PathBuf>,
    pub(super) resolver: Option<Arc<dyn BinaryResolver>>,
    pub(super) output: ProcessOutput,
    pub(super) customizer: Option<DataDirectoryCustomizer>,
}

impl Default for EmbeddedPostgresBuilder {
    fn default() -> Self {
        let server_config = [
            ("timezone", "UTC"),
            ("synchronous_commit", "off"),
            ("max_connections", "300"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect();
        Self {
            server_config,
            locale_config: BTreeMap::new(),
            connect_config: BTreeMap::new(),
            port: 0,
            data_directory: None,
            clean_data_directory: true,
            startup_wait: None,
            working_directory: None,
            resolver: None,
            output: ProcessOutput::default(),
            customizer: None,
        }
    }
}

impl EmbeddedPostgresBuilder {
    /// Creates a builder with the default server configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a server parameter passed to the postmaster as `-c key=value`.
    pub fn server_config(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.server_config.insert(key.into(), value.into());
        self
    }

    /// Sets a locale option passed to `initdb` as `--key=value`.
    pub fn locale_config(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.locale_config.insert(key.into(), value.into());
        self
    }

    /// Adds a connection property copied into every issued connection info.
    pub fn connect_config(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.connect_config.insert(key.into(), value.into());
        self
    }

    /// Listens on `port`; `0` picks a free port at start.
    pub const fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    /// Uses an explicit data directory instead of a fresh one in the working
    /// directory.
    pub fn data_directory(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.data_directory = Some(path.into());
        self
    }

    /// Controls whether the data directory is deleted on close.
    pub const fn clean_data_directory(&mut self, clean: bool) -> &mut Self {
        self.clean_data_directory = clean;
        self
    }

    /// Bounds how long `pg_ctl start` may take before the start fails.
    pub const fn startup_wait(&mut self, wait: Duration) -> &mut Self {
        self.startup_wait = Some(wait);
        self
    }

    /// Overrides the directory holding binaries and generated data directories.
    pub fn working_directory(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Replaces the default archive resolver.
    pub fn binary_resolver(&mut self, resolver: Arc<dyn BinaryResolver>) -> &mut Self {
        self.resolver = Some(resolver);
        self
    }

    /// Chooses where `initdb` and `pg_ctl` output goes.
    pub const fn process_output(&mut self, output: ProcessOutput) -> &mut Self {
        self.output = output;
        self
    }

    /// Runs `customize` on the locked data directory after `initdb` and
    /// before the postmaster starts.
    ///
    /// `name` stands in for the callback in builder equality, so two
    /// callbacks sharing a name must behave the same. A failing callback
    /// aborts the start.
    pub fn data_directory_customizer<F>(&mut self, name: impl Into<String>, customize: F) -> &mut Self
    where
        F: Fn(&Utf8Path) -> Result<()> + Send + Sync + 'static,
    {
        self.customizer = Some(DataDirectoryCustomizer {
            name: name.into(),
            customize: Arc::new(customize),
        });
        self
    }

    /// Resolves binaries, initialises the data directory and starts the server.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from binary resolution,
    /// [`ErrorKind::ProcessFailed`](crate::ErrorKind::ProcessFailed) when
    /// `initdb` or `pg_ctl` fails, [`ErrorKind::LockHeld`](crate::ErrorKind::LockHeld)
    /// when another instance owns the data directory, and
    /// [`ErrorKind::StartTimeout`](crate::ErrorKind::StartTimeout) when the
    /// server is not ready within the startup wait.
    pub fn start(&self) -> Result<EmbeddedPostgres> {
        EmbeddedPostgres::start_with(self)
    }

    fn resolver_key(&self) -> Option<String> {
        self.resolver.as_ref().map(|resolver| resolver.cache_key())
    }

    fn customizer_name(&self) -> Option<&str> {
        self.customizer.as_ref().map(|customizer| customizer.name.as_str())
    }
}

impl PartialEq for EmbeddedPostgresBuilder {
    fn eq(&self, other: &Self) -> bool {
        self.server_config == other.server_config
            && self.locale_config == other.locale_config
            && self.connect_config == other.connect_config
            && self.port == other.port
            && self.data_directory == other.data_directory
            && self.clean_data_directory == other.clean_data_directory
            && self.startup_wait == other.startup_wait
            && self.working_directory == other.working_directory
            && self.output == other.output
            && self.resolver_key() == other.resolver_key()
            && self.customizer_name() == other.customizer_name()
    }
}

impl Eq for EmbeddedPostgresBuilder {}

impl Hash for EmbeddedPostgresBuilder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.server_config.hash(state);
        self.locale_config.hash(state);
        self.connect_config.hash(state);
        self.port.hash(state);
        self.data_directory.hash(state);
        self.clean_data_directory.hash(state);
        self.startup_wait.hash(state);
        self.working_directory.hash(state);
        self.output.hash(state);
        self.resolver_key().hash(state);
        self.customizer_name().hash(state);
    }
}

impl fmt::Debug for EmbeddedPostgresBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedPostgresBuilder")
            .field("server_config", &self.server_config)
            .field("locale_config", &self.locale_config)
            .field("connect_config", &self.connect_config)
            .field("port", &self.port)
            .field("data_directory", &self.data_directory)
            .field("clean_data_directory", &self.clean_data_directory)
            .field("startup_wait", &self.startup_wait)
            .field("working_directory", &self.working_directory)
            .field("resolver", &self.resolver_key())
            .field("output", &self.output)
            .field("customizer", &self.customizer_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaries::ArchiveFileResolver;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(builder: &EmbeddedPostgresBuilder) -> u64 {
        let mut hasher = DefaultHasher::new();
        builder.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn defaults_tune_the_server_for_tests() {
        let builder = EmbeddedPostgresBuilder::new();

        assert_eq!(builder.server_config.get("timezone").map(String::as_str), Some("UTC"));
        assert_eq!(
            builder.server_config.get("synchronous_commit").map(String::as_str),
            Some("off")
        );
        assert_eq!(
            builder.server_config.get("max_connections").map(String::as_str),
            Some("300")
        );
        assert!(builder.clean_data_directory);
        assert_eq!(builder.port, 0);
    }

    #[test]
    fn equality_is_value_based() {
        let mut first = EmbeddedPostgresBuilder::new();
        first
            .server_config("work_mem", "64MB")
            .binary_resolver(Arc::new(ArchiveFileResolver::new("/tmp/pg.txz")));
        let mut second = EmbeddedPostgresBuilder::new();
        second
            .binary_resolver(Arc::new(ArchiveFileResolver::new("/tmp/pg.txz")))
            .server_config("work_mem", "64MB");

        assert_eq!(first, second);
        assert_eq!(hash_of(&first), hash_of(&second));
    }

    #[test]
    fn any_setting_changes_identity() {
        let base = EmbeddedPostgresBuilder::new();
        let mut waited = base.clone();
        waited.startup_wait(Duration::from_secs(30));
        let mut resolved = base.clone();
        resolved.binary_resolver(Arc::new(ArchiveFileResolver::new("/tmp/other.txz")));

        assert_ne!(base, waited);
        assert_ne!(base, resolved);
    }

    #[test]
    fn customizers_are_compared_by_name() {
        let mut first = EmbeddedPostgresBuilder::new();
        first.data_directory_customizer("hba", |_dir: &Utf8Path| Ok(()));
        let mut same_name = EmbeddedPostgresBuilder::new();
        same_name.data_directory_customizer("hba", |dir: &Utf8Path| {
            assert!(dir.is_dir());
            Ok(())
        });
        let mut other_name = EmbeddedPostgresBuilder::new();
        other_name.data_directory_customizer("conf", |_dir: &Utf8Path| Ok(()));

        assert_eq!(first, same_name);
        assert_eq!(hash_of(&first), hash_of(&same_name));
        assert_ne!(first, other_name);
        assert_ne!(first, EmbeddedPostgresBuilder::new());
    }
}
