//! Fresh databases cloned from a prepared template cluster.
//!
//! Each distinct pairing of preparer and builder settings gets one cluster
//! for the life of the process. Its `template1` is prepared once, and every
//! database handed out afterwards is a copy made by a background
//! [`PrepPipeline`].

mod pipeline;
mod preparer;

pub use self::pipeline::{DATABASE_NAME_LEN, DatabaseFactory, DatabaseRecord, PrepPipeline};
pub use self::preparer::{DatabasePreparer, FnPreparer, SqlPreparer};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use postgres::Client;
use tracing::{info, info_span};

use crate::connection::ConnectionInfo;
use crate::error::Result;
use crate::observability::PIPELINE_TARGET;
use crate::server::EmbeddedPostgresBuilder;

/// Identity of a prepared cluster: preparer key plus customised builder.
type ClusterKey = (String, EmbeddedPostgresBuilder);

static CLUSTERS: OnceLock<Mutex<HashMap<ClusterKey, Arc<PrepPipeline>>>> = OnceLock::new();

/// Hands out databases that already contain a preparer's schema.
///
/// # Examples
/// ```no_run
/// use pg_embed_prepared::{PreparedDbProvider, SqlPreparer};
///
/// let preparer = SqlPreparer::new("CREATE TABLE widgets (id serial PRIMARY KEY);");
/// let provider = PreparedDbProvider::for_preparer(&preparer)?;
/// let info = provider.create_new_database()?;
/// let mut client = provider.connect(&info)?;
/// client.batch_execute("INSERT INTO widgets DEFAULT VALUES")?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct PreparedDbProvider {
    pipeline: Arc<PrepPipeline>,
}

impl PreparedDbProvider {
    /// Returns a provider backed by the default cluster for `preparer`.
    ///
    /// # Errors
    ///
    /// See [`Self::for_preparer_with`].
    pub fn for_preparer(preparer: &dyn DatabasePreparer) -> Result<Self> {
        Self::for_preparer_with(preparer, std::iter::empty::<fn(&mut EmbeddedPostgresBuilder)>())
    }

    /// Returns a provider whose cluster is started from a builder adjusted by
    /// `customizers`, applied in order.
    ///
    /// The first call for a given preparer key and resulting builder starts
    /// the cluster and runs the preparer against `template1`; later calls
    /// share it. Creation is serialised process-wide.
    ///
    /// # Errors
    ///
    /// Returns start failures from [`EmbeddedPostgresBuilder::start`] and any
    /// error raised by the preparer.
    pub fn for_preparer_with<I, F>(preparer: &dyn DatabasePreparer, customizers: I) -> Result<Self>
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(&mut EmbeddedPostgresBuilder),
    {
        let mut builder = EmbeddedPostgresBuilder::new();
        for customize in customizers {
            customize(&mut builder);
        }
        let key = (preparer.cache_key(), builder);

        let mut clusters = CLUSTERS
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pipeline) = clusters.get(&key) {
            return Ok(Self {
                pipeline: Arc::clone(pipeline),
            });
        }

        let pipeline = Arc::new(start_prepared_cluster(preparer, &key.1)?);
        clusters.insert(key, Arc::clone(&pipeline));
        Ok(Self { pipeline })
    }

    /// Creates a database and returns its connection URL.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's creation failure.
    pub fn create_database(&self) -> Result<String> {
        Ok(self.create_new_database()?.url())
    }

    /// Creates a database and returns its connection info.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's creation failure.
    pub fn create_new_database(&self) -> Result<ConnectionInfo> {
        self.pipeline.next_database().map(ConnectionInfo::from)
    }

    /// Opens a client for a database issued by this provider.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Database`](crate::ErrorKind::Database) when the
    /// connection fails.
    pub fn connect(&self, info: &ConnectionInfo) -> Result<Client> {
        info.connect()
    }

    /// Creates a database and describes it as `ot.db.<module>.*` settings.
    ///
    /// The map holds `ot.db.<module>.uri` and `ot.db.<module>.ds.user`.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's creation failure.
    pub fn configuration_tweak(&self, module: &str) -> Result<BTreeMap<String, String>> {
        let info = self.create_new_database()?;
        Ok(BTreeMap::from([
            (format!("ot.db.{module}.uri"), info.url()),
            (format!("ot.db.{module}.ds.user"), info.user().to_owned()),
        ]))
    }
}

fn start_prepared_cluster(
    preparer: &dyn DatabasePreparer,
    builder: &EmbeddedPostgresBuilder,
) -> Result<PrepPipeline> {
    let span = info_span!(target: PIPELINE_TARGET, "prepare_cluster", preparer = %preparer.cache_key());
    let _entered = span.enter();
    let begun = Instant::now();

    let pg = builder.start()?;
    let mut client = pg.template_database().connect()?;
    preparer.prepare(&mut client)?;
    drop(client);
    info!(
        target: PIPELINE_TARGET,
        instance = %pg.instance_id(),
        elapsed_ms = u64::try_from(begun.elapsed().as_millis()).unwrap_or(u64::MAX),
        "template database prepared"
    );

    let label = pg.to_string();
    PrepPipeline::start(pg, &label)
}
