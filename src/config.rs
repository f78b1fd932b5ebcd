//! Process-wide settings read from `PG_EMBED_*` environment variables.

use std::time::Duration;

use camino::Utf8PathBuf;
use color_eyre::eyre::eyre;
use figment::{Figment, providers::Env};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Prefix shared by every environment override.
const ENV_PREFIX: &str = "PG_EMBED_";

/// Directory name used beneath the system temporary directory.
const DEFAULT_WORKING_SUBDIR: &str = "embedded-pg";

/// Upper bound accepted for `PG_EMBED_STARTUP_TIMEOUT_SECS`.
const MAX_STARTUP_TIMEOUT_SECS: u64 = 600;

/// Environment overrides captured when an instance is constructed.
///
/// | Variable | Field |
/// |---|---|
/// | `PG_EMBED_WORKING_DIR` | [`EmbedSettings::working_dir`] |
/// | `PG_EMBED_NO_CLEANUP` | [`EmbedSettings::no_cleanup`] |
/// | `PG_EMBED_BINARY_PATH` | [`EmbedSettings::binary_path`] |
/// | `PG_EMBED_STARTUP_TIMEOUT_SECS` | [`EmbedSettings::startup_timeout_secs`] |
///
/// # Examples
/// ```
/// use pg_embed_prepared::EmbedSettings;
///
/// let settings = EmbedSettings::default();
/// assert!(!settings.cleanup_suppressed());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedSettings {
    /// Directory holding extracted binaries and generated data directories.
    pub working_dir: Option<Utf8PathBuf>,
    /// Keeps data directories on close when `true`, for post-mortem inspection.
    pub no_cleanup: Option<bool>,
    /// Search path (platform list syntax) scanned for binary archives.
    pub binary_path: Option<String>,
    /// Replaces the default startup wait, in whole seconds.
    pub startup_timeout_secs: Option<u64>,
}

impl EmbedSettings {
    /// Loads the overrides from the current process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] when a variable cannot be parsed
    /// into its field type or falls outside its accepted range.
    pub fn load() -> Result<Self> {
        let settings: Self = Figment::new()
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|err| {
                Error::new(
                    ErrorKind::Configuration,
                    eyre!("failed to read {ENV_PREFIX}* settings: {err}"),
                )
            })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        match self.startup_timeout_secs {
            Some(0) => Err(Error::new(
                ErrorKind::Configuration,
                eyre!("{ENV_PREFIX}STARTUP_TIMEOUT_SECS must be at least 1 second"),
            )),
            Some(secs) if secs > MAX_STARTUP_TIMEOUT_SECS => Err(Error::new(
                ErrorKind::Configuration,
                eyre!(
                    "{ENV_PREFIX}STARTUP_TIMEOUT_SECS must be {MAX_STARTUP_TIMEOUT_SECS} seconds or less (received {secs})"
                ),
            )),
            _ => Ok(()),
        }
    }

    /// Returns the working directory, defaulting to `<tmp>/embedded-pg`.
    #[must_use]
    pub fn working_directory(&self) -> Utf8PathBuf {
        self.working_dir.clone().unwrap_or_else(default_working_dir)
    }

    /// Returns `true` when data directories must survive `close`.
    #[must_use]
    pub fn cleanup_suppressed(&self) -> bool {
        self.no_cleanup.unwrap_or(false)
    }

    /// Returns the startup wait override, when configured.
    #[must_use]
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_secs.map(Duration::from_secs)
    }
}

fn default_working_dir() -> Utf8PathBuf {
    let temp = std::env::temp_dir();
    Utf8PathBuf::from_path_buf(temp)
        .unwrap_or_else(|path| Utf8PathBuf::from(path.to_string_lossy().into_owned()))
        .join(DEFAULT_WORKING_SUBDIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use temp_env::with_vars;

    const VARS: [&str; 4] = [
        "PG_EMBED_WORKING_DIR",
        "PG_EMBED_NO_CLEANUP",
        "PG_EMBED_BINARY_PATH",
        "PG_EMBED_STARTUP_TIMEOUT_SECS",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        VARS.iter().map(|name| (*name, None)).collect()
    }

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        let settings = with_vars(cleared(), EmbedSettings::load).expect("load settings");

        assert_eq!(settings, EmbedSettings::default());
        assert!(settings.working_directory().ends_with(DEFAULT_WORKING_SUBDIR));
        assert!(settings.startup_timeout().is_none());
    }

    #[test]
    #[serial]
    fn overrides_are_read_from_environment() {
        let mut vars = cleared();
        vars.push(("PG_EMBED_WORKING_DIR", Some("/custom/epg")));
        vars.push(("PG_EMBED_NO_CLEANUP", Some("true")));
        vars.push(("PG_EMBED_STARTUP_TIMEOUT_SECS", Some("42")));

        let settings = with_vars(vars, EmbedSettings::load).expect("load settings");

        assert_eq!(settings.working_directory(), Utf8PathBuf::from("/custom/epg"));
        assert!(settings.cleanup_suppressed());
        assert_eq!(settings.startup_timeout(), Some(Duration::from_secs(42)));
    }

    #[test]
    #[serial]
    fn zero_startup_timeout_is_rejected() {
        let mut vars = cleared();
        vars.push(("PG_EMBED_STARTUP_TIMEOUT_SECS", Some("0")));

        let err = with_vars(vars, EmbedSettings::load).expect_err("zero must fail");

        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
