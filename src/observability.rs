//! Shared tracing configuration for observability instrumentation.
//!
//! Centralises the log targets used by the crate so subscribers can filter
//! events per subsystem without pulling in unrelated application logs.

/// Target used by server lifecycle spans and logs.
pub(crate) const LOG_TARGET: &str = "pg_embed::lifecycle";

/// Target used while resolving and extracting binary archives.
pub(crate) const BINARIES_TARGET: &str = "pg_embed::binaries";

/// Target used by the prepared-database pipeline.
pub(crate) const PIPELINE_TARGET: &str = "pg_embed::pipeline";
