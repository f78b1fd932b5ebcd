//! Domain error types for embedded `PostgreSQL` provisioning.

use color_eyre::Report;
use thiserror::Error;

/// Result alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Categorises provisioning failures so callers can branch on structured errors.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum ErrorKind {
    /// Represents errors without a more specific semantic meaning.
    #[default]
    Other,
    /// A required setting is missing, blank, or malformed.
    Configuration,
    /// The CPU architecture is not in the known alias table.
    UnsupportedArchitecture,
    /// No binary archive matches the detected platform.
    MissingBinaries,
    /// More than one binary archive matches the same lookup name.
    DuplicateBinaries,
    /// The binary archive contains an entry type that cannot be extracted.
    UnsupportedArchive,
    /// Another process never finished populating the shared binary cache.
    ExtractionTimeout,
    /// A `PostgreSQL` tool exited unsuccessfully or could not be spawned.
    ProcessFailed,
    /// The server did not become ready within the startup wait.
    StartTimeout,
    /// The data directory is already locked by another live instance.
    LockHeld,
    /// A SQL statement against the running cluster failed.
    Database,
}

/// Captures provisioning failures alongside their diagnostic report.
#[derive(Debug, Error)]
#[error("{report}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    report: Report,
}

impl Error {
    /// Constructs a new error with the provided kind and diagnostic report.
    #[must_use]
    pub const fn new(kind: ErrorKind, report: Report) -> Self {
        Self { kind, report }
    }

    /// Returns the semantic category for this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Extracts the underlying diagnostic report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl From<Report> for Error {
    fn from(report: Report) -> Self {
        Self::new(ErrorKind::Other, report)
    }
}

/// Extension for tagging an eyre result with an [`ErrorKind`].
pub(crate) trait ResultExt<T> {
    /// Converts the error side into an [`Error`] of the given kind.
    fn kind(self, kind: ErrorKind) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Report> {
    fn kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|report| Error::new(kind, report))
    }
}
