#![cfg(unix)]
//! Prepared databases cloned from a shared template cluster.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use pg_embed_prepared::{
    DATABASE_NAME_LEN, DatabasePreparer, ErrorKind, FnPreparer, PreparedDbProvider, SqlPreparer,
};
use postgres::Client;
use rstest::rstest;

#[path = "support/skip.rs"]
mod skip;

use skip::{init_tracing, skip_reason};

fn provider_or_skip(preparer: &dyn DatabasePreparer) -> Option<PreparedDbProvider> {
    init_tracing();
    match PreparedDbProvider::for_preparer(preparer) {
        Ok(provider) => Some(provider),
        Err(err) => match skip_reason(&err) {
            Some(reason) => {
                tracing::warn!("{reason}");
                None
            }
            None => panic!("prepared cluster failed to start: {err:?}"),
        },
    }
}

fn count_rows(client: &mut Client) -> i64 {
    client
        .query_one("SELECT count(*) FROM foo", &[])
        .expect("count rows")
        .get(0)
}

#[rstest]
fn databases_are_isolated_copies_of_the_template() {
    let preparer = SqlPreparer::new("CREATE TABLE foo (a int);");
    let Some(provider) = provider_or_skip(&preparer) else {
        return;
    };

    let first = provider.create_new_database().expect("first database");
    let second = provider.create_new_database().expect("second database");
    let mut first_client = provider.connect(&first).expect("connect first");
    let mut second_client = provider.connect(&second).expect("connect second");

    assert_ne!(first.db_name(), second.db_name());
    assert_eq!(count_rows(&mut first_client), 0);
    assert_eq!(count_rows(&mut second_client), 0);

    first_client
        .batch_execute("INSERT INTO foo VALUES (1)")
        .expect("insert");

    assert_eq!(count_rows(&mut first_client), 1);
    assert_eq!(count_rows(&mut second_client), 0);
}

#[rstest]
fn equal_preparers_share_one_cluster() {
    static RUNS: AtomicUsize = AtomicUsize::new(0);
    let preparer = FnPreparer::new("shared-cluster-counter", |client: &mut Client| {
        RUNS.fetch_add(1, Ordering::SeqCst);
        client
            .batch_execute("CREATE TABLE foo (a int);")
            .map_err(|err| pg_embed_prepared::Error::new(ErrorKind::Database, err.into()))
    });
    let Some(first) = provider_or_skip(&preparer) else {
        return;
    };
    let second = PreparedDbProvider::for_preparer(&preparer).expect("memoised provider");

    let url = first.create_database().expect("url");
    let info = second.create_new_database().expect("info");

    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    assert!(url.contains(&format!(":{}/", info.port())));
    assert_eq!(info.db_name().len(), DATABASE_NAME_LEN);
}

#[rstest]
fn handed_out_names_never_repeat() {
    let preparer = SqlPreparer::new("CREATE TABLE foo (a int);");
    let Some(provider) = provider_or_skip(&preparer) else {
        return;
    };

    let names: HashSet<String> = (0..5)
        .map(|_| {
            provider
                .create_new_database()
                .expect("database")
                .db_name()
                .to_owned()
        })
        .collect();

    assert_eq!(names.len(), 5);
}

#[rstest]
fn configuration_tweak_points_at_a_fresh_database() {
    let preparer = SqlPreparer::new("CREATE TABLE foo (a int);");
    let Some(provider) = provider_or_skip(&preparer) else {
        return;
    };

    let tweak = provider.configuration_tweak("orders").expect("tweak");

    assert_eq!(tweak.get("ot.db.orders.ds.user").map(String::as_str), Some("postgres"));
    assert!(
        tweak
            .get("ot.db.orders.uri")
            .is_some_and(|uri| uri.starts_with("postgresql://localhost:"))
    );
}
