//! Background creation of fresh databases, handed over one at a time.
//!
//! A dedicated worker thread creates a database with a random name and then
//! blocks on a zero-capacity channel until some caller takes it. At most one
//! database is therefore created ahead of demand. The worker exits once every
//! receiver is gone.

use std::thread;

use color_eyre::eyre::{Context, eyre};
use crossbeam_channel::{Receiver, Sender, bounded};
use rand::Rng;
use tracing::{debug, info_span, warn};

use crate::connection::DatabaseInfo;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::observability::PIPELINE_TARGET;
use crate::server::EmbeddedPostgres;
use crate::server::command::SUPERUSER;

/// Length of generated database names.
pub const DATABASE_NAME_LEN: usize = 12;

/// Creates one database on demand.
pub trait DatabaseFactory: Send + Sync {
    /// Creates the database `name` and describes how to reach it.
    ///
    /// # Errors
    ///
    /// Returns the failure to hand to the consumer that takes this record.
    fn create_database(&self, name: &str) -> Result<DatabaseInfo>;
}

impl DatabaseFactory for EmbeddedPostgres {
    fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        let mut client = self.postgres_database().connect()?;
        let sql = create_database_sql(name, SUPERUSER);
        client
            .batch_execute(&sql)
            .wrap_err_with(|| format!("failed to create database '{name}'"))
            .kind(ErrorKind::Database)?;
        Ok(DatabaseInfo::new(self.database(SUPERUSER, name)))
    }
}

/// Outcome of one worker iteration.
#[derive(Debug)]
pub enum DatabaseRecord {
    /// The database exists and is owned by the superuser.
    Ready(DatabaseInfo),
    /// Creation failed; the worker has already moved on.
    Failed(Error),
}

impl DatabaseRecord {
    /// Converts the record into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the creation failure carried by [`DatabaseRecord::Failed`].
    pub fn into_result(self) -> Result<DatabaseInfo> {
        match self {
            Self::Ready(info) => Ok(info),
            Self::Failed(err) => Err(err),
        }
    }
}

/// Receiving end of a database-creation worker.
#[derive(Debug)]
pub struct PrepPipeline {
    records: Receiver<DatabaseRecord>,
}

impl PrepPipeline {
    /// Spawns the worker thread `cluster-<label>-preparer` around `factory`.
    ///
    /// The factory moves into the worker and is dropped when the worker exits.
    ///
    /// # Errors
    ///
    /// Returns an error when the thread cannot be spawned.
    pub fn start<F>(factory: F, label: &str) -> Result<Self>
    where
        F: DatabaseFactory + 'static,
    {
        let (sender, records) = bounded(0);
        let name = format!("cluster-{label}-preparer");
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || produce(&factory, &sender))
            .wrap_err_with(|| format!("failed to spawn {name}"))?;
        debug!(target: PIPELINE_TARGET, worker = %name, "database pipeline started");
        Ok(Self { records })
    }

    /// Blocks until the worker hands over its next record.
    #[must_use]
    pub fn next_record(&self) -> DatabaseRecord {
        self.records.recv().unwrap_or_else(|_| {
            DatabaseRecord::Failed(Error::new(
                ErrorKind::Other,
                eyre!("database pipeline worker has stopped"),
            ))
        })
    }

    /// Blocks until a fresh database is available.
    ///
    /// No two calls, on any thread, return the same database.
    ///
    /// # Errors
    ///
    /// Returns the worker's creation failure, or an error when the worker has
    /// stopped.
    pub fn next_database(&self) -> Result<DatabaseInfo> {
        self.next_record().into_result()
    }
}

fn produce(factory: &dyn DatabaseFactory, sender: &Sender<DatabaseRecord>) {
    let mut rng = rand::thread_rng();
    loop {
        let name = random_database_name(&mut rng);
        let span = info_span!(target: PIPELINE_TARGET, "create_database", db = %name);
        let record = span.in_scope(|| match factory.create_database(&name) {
            Ok(info) => DatabaseRecord::Ready(info),
            Err(err) => {
                warn!(target: PIPELINE_TARGET, db = %name, error = %err, "database creation failed");
                DatabaseRecord::Failed(err)
            }
        });
        if sender.send(record).is_err() {
            debug!(target: PIPELINE_TARGET, "no consumers left; stopping database pipeline");
            return;
        }
    }
}

/// Draws a lowercase alphabetic name of [`DATABASE_NAME_LEN`] characters.
fn random_database_name(rng: &mut impl Rng) -> String {
    (0..DATABASE_NAME_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

fn escape_identifier(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

fn create_database_sql(name: &str, owner: &str) -> String {
    format!(
        "CREATE DATABASE \"{}\" OWNER \"{}\" ENCODING = 'utf8'",
        escape_identifier(name),
        escape_identifier(owner)
    )
}
