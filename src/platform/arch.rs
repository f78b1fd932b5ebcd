//! CPU architecture normalisation.
//!
//! Different systems report the same architecture under many spellings
//! (`amd64`, `x86_64`, `em64t`, ...). Binary archives are named after one
//! canonical token per family, so every raw value is funnelled through
//! [`normalize_architecture`] before lookup.

use color_eyre::eyre::eyre;

use crate::error::{Error, ErrorKind, Result};

/// Exact aliases, matched after lower-casing and stripping punctuation.
const EXACT_ALIASES: &[(&str, &[&str])] = &[
    ("x86_64", &["x8664", "amd64", "ia32e", "em64t", "x64"]),
    (
        "x86_32",
        &["x8632", "x86", "i386", "i486", "i586", "i686", "ia32", "x32"],
    ),
    ("itanium_64", &["ia64", "ia64w", "itanium64"]),
    ("itanium_32", &["ia64n"]),
    ("sparc_64", &["sparcv9", "sparc64"]),
    ("sparc_32", &["sparc", "sparc32"]),
    ("mips_32", &["mips", "mips32"]),
    ("mipsel_32", &["mipsel", "mips32el"]),
    ("mips_64", &["mips64"]),
    ("mipsel_64", &["mips64el"]),
    ("ppc_32", &["ppc", "ppc32"]),
    ("ppcle_32", &["ppcle", "ppc32le"]),
    ("ppc_64", &["ppc64"]),
    ("ppcle_64", &["ppc64le"]),
    ("s390_32", &["s390"]),
    ("s390_64", &["s390x"]),
];

/// Prefix aliases; the 64-bit ARM prefixes must be tried before plain `arm`.
const PREFIX_ALIASES: &[(&str, &[&str])] = &[
    ("arm_64", &["aarch64", "armv8", "arm64"]),
    ("arm_32", &["arm32", "arm"]),
];

/// Maps a raw architecture identifier to its canonical archive token.
///
/// # Errors
///
/// Returns [`ErrorKind::Configuration`] for blank input and
/// [`ErrorKind::UnsupportedArchitecture`] when no alias matches.
///
/// # Examples
/// ```
/// use pg_embed_prepared::normalize_architecture;
///
/// assert_eq!(normalize_architecture("AMD64").ok(), Some("x86_64"));
/// assert!(normalize_architecture("sparc128").is_err());
/// ```
pub fn normalize_architecture(raw: &str) -> Result<&'static str> {
    if raw.trim().is_empty() {
        return Err(Error::new(
            ErrorKind::Configuration,
            eyre!("no architecture detected"),
        ));
    }

    let cleaned: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect();

    let exact = EXACT_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&cleaned.as_str()))
        .map(|(canonical, _)| *canonical);
    let prefixed = || {
        PREFIX_ALIASES
            .iter()
            .find(|(_, prefixes)| prefixes.iter().any(|prefix| cleaned.starts_with(prefix)))
            .map(|(canonical, _)| *canonical)
    };

    exact.or_else(prefixed).ok_or_else(|| {
        Error::new(
            ErrorKind::UnsupportedArchitecture,
            eyre!("unsupported architecture: {raw}"),
        )
    })
}
