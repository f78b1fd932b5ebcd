//! Resolution, extraction and caching of `PostgreSQL` binary archives.
//!
//! A [`BinaryResolver`] supplies the `.txz` archive for the host platform,
//! [`extract_txz`] unpacks it, and [`prepare_binaries`] coordinates both so
//! every archive digest is extracted once per machine.

mod cache;
mod extract;
mod resolver;

pub(crate) use self::cache::LOCK_FILE_NAME;
pub use self::cache::prepare_binaries;
pub use self::extract::extract_txz;
pub use self::resolver::{ArchiveFileResolver, BinaryResolver, DefaultBinaryResolver, archive_name};
