//! Host platform detection used to pick a binary archive.

mod arch;
pub(crate) mod linux;

pub use self::arch::normalize_architecture;

use std::fmt;

use color_eyre::eyre::eyre;

use crate::error::{Error, ErrorKind, Result};

/// Operating systems for which `PostgreSQL` archives are published.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum OperatingSystem {
    /// Any Linux distribution.
    Linux,
    /// macOS.
    Darwin,
    /// Microsoft Windows.
    Windows,
}

impl OperatingSystem {
    /// Detects the operating system this process was compiled for.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Configuration`] on any other operating system.
    pub fn current() -> Result<Self> {
        Self::from_target(std::env::consts::OS)
    }

    fn from_target(os: &str) -> Result<Self> {
        match os {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::Darwin),
            "windows" => Ok(Self::Windows),
            other => Err(Error::new(
                ErrorKind::Configuration,
                eyre!("unknown operating system: {other}"),
            )),
        }
    }

    /// Returns the token used in archive names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "Linux",
            Self::Darwin => "Darwin",
            Self::Windows => "Windows",
        }
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the raw machine architecture of the running process.
#[must_use]
pub fn current_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "amd64" => "x86_64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_names_map_to_archive_tokens() {
        assert_eq!(
            OperatingSystem::from_target("macos").expect("macos").as_str(),
            "Darwin"
        );
        assert_eq!(
            OperatingSystem::from_target("linux").expect("linux").to_string(),
            "Linux"
        );
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = OperatingSystem::from_target("plan9").expect_err("plan9 unsupported");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
