//! Locates the compressed `PostgreSQL` archive for the running platform.

use std::fmt;
use std::fs::File;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{Context, eyre};
use tracing::{debug, info, trace, warn};

use crate::config::EmbedSettings;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::observability::BINARIES_TARGET;
use crate::platform::{OperatingSystem, linux, normalize_architecture};

/// Where operators can obtain archives for platforms that are not present.
const ADDITIONAL_BINARIES_HINT: &str =
    "https://github.com/zonkyio/embedded-postgres#additional-architectures";

/// Produces a readable archive stream for a platform.
///
/// Implementations must be cheap to clone behind an `Arc` and report a
/// [`cache_key`](Self::cache_key) that is equal for resolvers returning the
/// same archive; extracted binaries are memoised by that key.
pub trait BinaryResolver: Send + Sync + fmt::Debug {
    /// Opens the archive matching `system` and the raw architecture string.
    ///
    /// # Errors
    ///
    /// Returns a configuration-class error when no archive matches, when the
    /// lookup is ambiguous, or when the architecture is unknown.
    fn resolve(&self, system: OperatingSystem, raw_arch: &str) -> Result<Box<dyn Read + Send>>;

    /// Returns the value identity of this resolver.
    fn cache_key(&self) -> String;
}

/// Builds the archive file name for a platform triple or quadruple.
///
/// The result is lower-cased and spaces become underscores.
///
/// # Examples
/// ```
/// use pg_embed_prepared::binaries::archive_name;
///
/// assert_eq!(
///     archive_name("Linux", "x86_64", Some("Alpine Linux")),
///     "postgres-linux-x86_64-alpine_linux.txz"
/// );
/// ```
#[must_use]
pub fn archive_name(system: &str, arch: &str, distribution: Option<&str>) -> String {
    let raw = distribution.map_or_else(
        || format!("postgres-{system}-{arch}.txz"),
        |distribution| format!("postgres-{system}-{arch}-{distribution}.txz"),
    );
    raw.replace(' ', "_").to_lowercase()
}

/// Searches an ordered list of directories for platform archives.
///
/// # Examples
/// ```
/// use pg_embed_prepared::binaries::{BinaryResolver, DefaultBinaryResolver};
///
/// let resolver = DefaultBinaryResolver::new(["/opt/pg-archives"]).with_distribution(None);
/// assert!(resolver.cache_key().contains("/opt/pg-archives"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultBinaryResolver {
    search_path: Vec<Utf8PathBuf>,
    distribution: Option<String>,
}

impl DefaultBinaryResolver {
    /// Creates a resolver over `dirs`, detecting the Linux distribution.
    ///
    /// Repeated directories are searched once.
    #[must_use]
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        let mut search_path: Vec<Utf8PathBuf> = Vec::new();
        for dir in dirs {
            let candidate = dir.into();
            if !search_path.contains(&candidate) {
                search_path.push(candidate);
            }
        }
        Self {
            search_path,
            distribution: linux::distribution_name().map(str::to_owned),
        }
    }

    /// Creates a resolver from `PG_EMBED_BINARY_PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] when the settings cannot be read
    /// or a search path entry is not valid UTF-8.
    pub fn from_env() -> Result<Self> {
        let settings = EmbedSettings::load()?;
        Self::from_settings(&settings)
    }

    /// Creates a resolver from previously loaded settings.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] when a search path entry is not
    /// valid UTF-8.
    pub fn from_settings(settings: &EmbedSettings) -> Result<Self> {
        let Some(raw) = settings.binary_path.as_deref() else {
            return Ok(Self::new(Vec::<Utf8PathBuf>::new()));
        };
        let dirs = std::env::split_paths(raw)
            .map(|path| {
                Utf8PathBuf::from_path_buf(path).map_err(|path| {
                    Error::new(
                        ErrorKind::Configuration,
                        eyre!("binary search path entry is not UTF-8: {}", path.display()),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(dirs))
    }

    /// Overrides the detected distribution qualifier.
    #[must_use]
    pub fn with_distribution(mut self, distribution: Option<&str>) -> Self {
        self.distribution = distribution.map(str::to_owned);
        self
    }

    /// Returns the directories searched, in order.
    #[must_use]
    pub fn search_path(&self) -> &[Utf8PathBuf] {
        &self.search_path
    }

    fn find(&self, name: &str) -> Result<Option<Utf8PathBuf>> {
        trace!(target: BINARIES_TARGET, archive = name, "searching for postgres binaries");
        let mut matches: Vec<Utf8PathBuf> = self
            .search_path
            .iter()
            .map(|dir| dir.join(name))
            .filter(|candidate| candidate.is_file())
            .collect();

        if matches.len() > 1 {
            let listed = matches
                .iter()
                .map(|dir| dir.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::new(
                ErrorKind::DuplicateBinaries,
                eyre!("detected multiple binaries for {name}: {listed}"),
            ));
        }
        Ok(matches.pop())
    }

    fn lookup(&self, system: OperatingSystem, raw_arch: &str) -> Result<Utf8PathBuf> {
        let arch = normalize_architecture(raw_arch)?;
        let distribution = match system {
            OperatingSystem::Linux => self.distribution.as_deref(),
            OperatingSystem::Darwin | OperatingSystem::Windows => None,
        };
        info!(
            target: BINARIES_TARGET,
            distribution = distribution.unwrap_or("unknown"),
            "detected distribution"
        );

        if let Some(distribution) = distribution {
            if let Some(found) = self.find(&archive_name(system.as_str(), arch, Some(distribution)))? {
                info!(target: BINARIES_TARGET, archive = %found, "distribution specific postgres binaries found");
                return Ok(found);
            }
            debug!(target: BINARIES_TARGET, "distribution specific postgres binaries not found");
        }

        if let Some(found) = self.find(&archive_name(system.as_str(), arch, None))? {
            info!(target: BINARIES_TARGET, archive = %found, "system specific postgres binaries found");
            return Ok(found);
        }

        if needs_emulation_fallback(system, raw_arch, arch) {
            if let Some(found) = self.find(&archive_name(system.as_str(), "x86_64", None))? {
                warn!(
                    target: BINARIES_TARGET,
                    archive = %found,
                    "no native ARM binaries found; using x86_64 binaries under emulation, performance may be degraded"
                );
                return Ok(found);
            }
        }

        Err(Error::new(
            ErrorKind::MissingBinaries,
            eyre!(
                "missing embedded postgres binaries for system '{system}', architecture '{arch}'; \
                 add a matching archive to PG_EMBED_BINARY_PATH ({ADDITIONAL_BINARIES_HINT})"
            ),
        ))
    }
}

impl BinaryResolver for DefaultBinaryResolver {
    fn resolve(&self, system: OperatingSystem, raw_arch: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.lookup(system, raw_arch)?;
        open_archive(&path)
    }

    fn cache_key(&self) -> String {
        let dirs = self
            .search_path
            .iter()
            .map(|dir| dir.as_str())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "search:{dirs}#{}",
            self.distribution.as_deref().unwrap_or_default()
        )
    }
}

/// ARM hosts on platforms that never shipped ARM server binaries.
fn needs_emulation_fallback(system: OperatingSystem, raw_arch: &str, arch: &str) -> bool {
    matches!(
        (system, raw_arch, arch),
        (OperatingSystem::Darwin, "aarch64", _) | (OperatingSystem::Windows, _, "arm_64")
    )
}

/// Serves one explicitly chosen archive regardless of platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFileResolver {
    path: Utf8PathBuf,
}

impl ArchiveFileResolver {
    /// Creates a resolver that always opens `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the archive served by this resolver.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl BinaryResolver for ArchiveFileResolver {
    fn resolve(&self, _system: OperatingSystem, _raw_arch: &str) -> Result<Box<dyn Read + Send>> {
        open_archive(&self.path)
    }

    fn cache_key(&self) -> String {
        format!("file:{}", self.path)
    }
}

fn open_archive(path: &Utf8Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path)
        .wrap_err_with(|| format!("failed to open binary archive {path}"))
        .kind(ErrorKind::MissingBinaries)?;
    Ok(Box::new(file))
}
