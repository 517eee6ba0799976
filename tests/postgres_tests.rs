/// Same checks against a real PostgreSQL server
///
/// Set CONCURRENCY_REPRO_TEST_PG to a connection string to run them, e.g.
/// CONCURRENCY_REPRO_TEST_PG="host=127.0.0.1 user=postgres dbname=postgres" \
///     cargo test --test postgres_tests -- --test-threads=1
///
/// Every test recreates the `people` table, so they must not run in parallel
/// against the same database.

use concurrency_token_repro::scenario::{self, SECOND_SESSION_PHONE, TokenAssertion};
use concurrency_token_repro::{BackendKind, ConnectionConfig, Database, Person, TokenPolicy};
use std::time::Duration;

fn database(policy: TokenPolicy) -> Option<Database> {
    let Ok(connection_string) = std::env::var("CONCURRENCY_REPRO_TEST_PG") else {
        eprintln!("CONCURRENCY_REPRO_TEST_PG not set, skipping");
        return None;
    };

    let config = ConnectionConfig::from_connection_string(&connection_string)
        .expect("invalid CONCURRENCY_REPRO_TEST_PG")
        .command_timeout(Duration::from_secs(10))
        .token_policy(policy);
    assert_eq!(config.backend, BackendKind::Postgres);
    Some(Database::open(config).expect("failed to open database"))
}

#[tokio::test]
async fn test_pg_conflict_detected() {
    let Some(db) = database(TokenPolicy::SessionManaged) else {
        return;
    };

    let report = scenario::run(&db).await.unwrap();
    assert!(report.conflict_detected());
    assert!(!report.lost_update);
}

#[tokio::test]
async fn test_pg_unchecked_loses_update() {
    let Some(db) = database(TokenPolicy::Unchecked) else {
        return;
    };

    let report = scenario::run(&db).await.unwrap();
    assert!(report.lost_update);
    assert_eq!(report.final_phone_number.as_deref(), Some(SECOND_SESSION_PHONE));
}

#[tokio::test]
async fn test_pg_client_asserted_bypass() {
    let Some(db) = database(TokenPolicy::ClientAsserted) else {
        return;
    };

    let report = scenario::run_with(&db, TokenAssertion::Current).await.unwrap();
    assert!(report.lost_update);
}

#[tokio::test]
async fn test_pg_round_trip_and_rollback() {
    let Some(db) = database(TokenPolicy::SessionManaged) else {
        return;
    };
    let (id, initial) = scenario::seed(&db).await.unwrap();

    let mut stale = db.session().await.unwrap();
    stale.find(id).await.unwrap();

    let mut winner = db.session().await.unwrap();
    winner.find(id).await.unwrap().set_phone_number("winner");
    winner.save_changes().await.unwrap();

    let stored = winner.find_untracked(id).await.unwrap();
    assert_eq!(stored.phone_number(), Some("winner"));
    assert_ne!(stored.row_version(), initial);

    stale.add(Person::new("Jane Roe", "555-000-0000", "987-65-4321"));
    stale.find(id).await.unwrap().set_phone_number("loser");
    assert!(stale.save_changes().await.unwrap_err().is_conflict());
    assert_eq!(stale.pending_inserts().len(), 1);

    let stored = stale.find_untracked(id).await.unwrap();
    assert_eq!(stored.phone_number(), Some("winner"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pg_parallel_sessions() {
    let Some(db) = database(TokenPolicy::SessionManaged) else {
        return;
    };

    let report = scenario::run_parallel(&db, 5).await.unwrap();
    assert_eq!(report.saved, 5);
    assert_eq!(report.conflicts, 5);
    assert_eq!(report.lost_updates, 0);
}
