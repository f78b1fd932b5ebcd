//! Schema loaders run once against a cluster's template database.

use std::fmt;

use color_eyre::eyre::Context;
use postgres::Client;

use crate::error::{ErrorKind, Result, ResultExt};

/// Loads schema or data into a freshly started cluster's `template1`.
///
/// Every database handed out afterwards is cloned from that template, so the
/// preparer runs once per cluster. Two preparers with the same
/// [`cache_key`](Self::cache_key) share a cluster.
pub trait DatabasePreparer: Send + Sync {
    /// Applies the preparation through an open client.
    ///
    /// # Errors
    ///
    /// Returns any failure; cluster creation is aborted with it.
    fn prepare(&self, client: &mut Client) -> Result<()>;

    /// Identity used to memoise the prepared cluster.
    fn cache_key(&self) -> String;
}

/// Runs a batch of SQL statements.
///
/// # Examples
/// ```
/// use pg_embed_prepared::{DatabasePreparer, SqlPreparer};
///
/// let preparer = SqlPreparer::new("CREATE TABLE widgets (id serial PRIMARY KEY);");
/// assert!(preparer.cache_key().starts_with("sql:"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlPreparer {
    sql: String,
}

impl SqlPreparer {
    /// Wraps `sql`, which may hold several `;`-separated statements.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// Returns the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl DatabasePreparer for SqlPreparer {
    fn prepare(&self, client: &mut Client) -> Result<()> {
        client
            .batch_execute(&self.sql)
            .wrap_err("failed to run preparation SQL")
            .kind(ErrorKind::Database)
    }

    fn cache_key(&self) -> String {
        format!("sql:{}", self.sql)
    }
}

/// Runs a named closure.
///
/// The name alone identifies the preparer, so two closures with the same
/// name must do the same thing.
pub struct FnPreparer<F> {
    name: String,
    prepare: F,
}

impl<F> FnPreparer<F>
where
    F: Fn(&mut Client) -> Result<()> + Send + Sync,
{
    /// Creates a preparer identified by `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, prepare: F) -> Self {
        Self {
            name: name.into(),
            prepare,
        }
    }
}

impl<F> DatabasePreparer for FnPreparer<F>
where
    F: Fn(&mut Client) -> Result<()> + Send + Sync,
{
    fn prepare(&self, client: &mut Client) -> Result<()> {
        (self.prepare)(client)
    }

    fn cache_key(&self) -> String {
        format!("fn:{}", self.name)
    }
}

impl<F> fmt::Debug for FnPreparer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPreparer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_distinguish_kinds_and_content() {
        let sql = SqlPreparer::new("CREATE TABLE a (id int);");
        let same_sql = SqlPreparer::new("CREATE TABLE a (id int);");
        let other_sql = SqlPreparer::new("CREATE TABLE b (id int);");
        let named = FnPreparer::new("CREATE TABLE a (id int);", |_client: &mut Client| Ok(()));

        assert_eq!(sql.cache_key(), same_sql.cache_key());
        assert_ne!(sql.cache_key(), other_sql.cache_key());
        assert_ne!(sql.cache_key(), named.cache_key());
    }

    #[test]
    fn fn_preparer_debug_shows_name() {
        let named = FnPreparer::new("seed-users", |_client: &mut Client| Ok(()));

        assert!(format!("{named:?}").contains("seed-users"));
    }
}
