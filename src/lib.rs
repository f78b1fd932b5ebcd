//! Runs throwaway `PostgreSQL` servers for tests and hands out fresh
//! databases cloned from a prepared template.
//!
//! The library resolves a platform-appropriate binary archive, unpacks it
//! once into a cache shared across processes, and manages `initdb` and
//! `pg_ctl` for each [`EmbeddedPostgres`]. [`PreparedDbProvider`] layers a
//! background pipeline on top so every test receives its own database that
//! already contains the schema loaded by a [`DatabasePreparer`].
//!
//! # Examples
//! ```no_run
//! use pg_embed_prepared::EmbeddedPostgres;
//!
//! let pg = EmbeddedPostgres::start()?;
//! let mut client = pg.connect("postgres", "postgres")?;
//! let row = client.query_one("SELECT 1", &[])?;
//! assert_eq!(row.get::<_, i32>(0), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod binaries;
mod config;
mod connection;
mod error;
mod fs;
mod lock;
mod observability;
pub mod platform;
mod prepared;
mod server;

pub use config::EmbedSettings;
pub use connection::{ConnectionInfo, DatabaseInfo, LOCALHOST};
pub use error::{Error, ErrorKind, Result};
pub use platform::{OperatingSystem, normalize_architecture};
pub use prepared::{
    DATABASE_NAME_LEN, DatabaseFactory, DatabasePreparer, DatabaseRecord, FnPreparer,
    PrepPipeline, PreparedDbProvider, SqlPreparer,
};
pub use server::{EmbeddedPostgres, EmbeddedPostgresBuilder, ProcessOutput, TEMPLATE_DATABASE};
