//! Immutable descriptions of a database a test may connect to.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use color_eyre::eyre::Context;
use postgres::{Client, Config, NoTls};
use tracing::debug;
use url::form_urlencoded;

use crate::error::{ErrorKind, Result, ResultExt};
use crate::observability::LOG_TARGET;

/// Host every embedded server listens on.
pub const LOCALHOST: &str = "localhost";

/// Snapshot of a database's name, port, owner and connection properties.
///
/// Properties are copied on construction, so later changes to the source
/// map never reach an issued value.
///
/// # Examples
/// ```
/// use std::collections::BTreeMap;
/// use pg_embed_prepared::ConnectionInfo;
///
/// let mut props = BTreeMap::new();
/// props.insert("application_name".to_owned(), "suite".to_owned());
/// let info = ConnectionInfo::with_properties("abcdefghijkl", 5432, "postgres", &props);
/// props.clear();
///
/// assert_eq!(
///     info.url(),
///     "postgresql://localhost:5432/abcdefghijkl?user=postgres&application_name=suite"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    db_name: String,
    port: u16,
    user: String,
    properties: BTreeMap<String, String>,
}

impl ConnectionInfo {
    /// Creates connection info without extra properties.
    #[must_use]
    pub fn new(db_name: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            port,
            user: user.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Creates connection info, copying every entry of `properties`.
    #[must_use]
    pub fn with_properties<I, K, V>(
        db_name: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        properties: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            properties: properties
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            ..Self::new(db_name, port, user)
        }
    }

    /// Returns the database name.
    #[must_use]
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Returns the server port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the connecting role.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the extra connection properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Renders `postgresql://localhost:<port>/<db>?user=<user>[&key=value...]`.
    ///
    /// Every path and query component is percent-encoded.
    #[must_use]
    pub fn url(&self) -> String {
        let mut url = format!(
            "postgresql://{LOCALHOST}:{}/{}?user={}",
            self.port,
            encode_component(&self.db_name),
            encode_component(&self.user)
        );
        for (key, value) in &self.properties {
            url.push('&');
            url.push_str(&encode_component(key));
            url.push('=');
            url.push_str(&encode_component(value));
        }
        url
    }

    /// Builds a client configuration for this database.
    ///
    /// Recognised properties are `application_name`, `options`, `password`
    /// and `connect_timeout` (seconds); others only appear in [`Self::url`].
    #[must_use]
    pub fn pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(LOCALHOST)
            .port(self.port)
            .dbname(&self.db_name)
            .user(&self.user);
        for (key, value) in &self.properties {
            match key.as_str() {
                "application_name" => {
                    config.application_name(value);
                }
                "options" => {
                    config.options(value);
                }
                "password" => {
                    config.password(value);
                }
                "connect_timeout" => match value.parse::<u64>() {
                    Ok(secs) => {
                        config.connect_timeout(Duration::from_secs(secs));
                    }
                    Err(_) => debug!(target: LOG_TARGET, value = %value, "ignoring invalid connect_timeout"),
                },
                other => debug!(target: LOG_TARGET, property = other, "property not applied to client config"),
            }
        }
        config
    }

    /// Opens a blocking client connection.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Database`] when the connection cannot be made.
    pub fn connect(&self) -> Result<Client> {
        self.pg_config()
            .connect(NoTls)
            .wrap_err_with(|| format!("failed to connect to {}", self.url()))
            .kind(ErrorKind::Database)
    }

    /// Opens a Diesel connection to this database.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Database`] when the connection cannot be made.
    #[cfg(feature = "diesel-support")]
    pub fn diesel_connection(&self) -> Result<diesel::PgConnection> {
        use diesel::Connection as _;

        diesel::PgConnection::establish(&self.url())
            .wrap_err_with(|| format!("failed to connect to {}", self.url()))
            .kind(ErrorKind::Database)
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Percent-encodes one URL component.
///
/// libpq only decodes `%XX` escapes, so the `+` that form encoding uses for
/// spaces is rewritten to `%20`. A literal `+` is already escaped as `%2B`.
fn encode_component(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// A database produced by the prepared-database pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    info: ConnectionInfo,
}

impl DatabaseInfo {
    pub(crate) const fn new(info: ConnectionInfo) -> Self {
        Self { info }
    }

    /// Returns the database name.
    #[must_use]
    pub fn db_name(&self) -> &str {
        self.info.db_name()
    }

    /// Returns the server port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.info.port()
    }

    /// Returns the owning role.
    #[must_use]
    pub fn user(&self) -> &str {
        self.info.user()
    }

    /// Returns the connection properties.
    #[must_use]
    pub const fn properties(&self) -> &BTreeMap<String, String> {
        self.info.properties()
    }

    /// Borrows the underlying connection info.
    #[must_use]
    pub const fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }
}

impl From<DatabaseInfo> for ConnectionInfo {
    fn from(database: DatabaseInfo) -> Self {
        database.info
    }
}
