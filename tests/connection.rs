mod helpers;

use courierq::prelude::*;
use courierq::queue::{MemoryQueueFactory, SyncFactory};
use helpers::{Flaky, calls, registry};
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn sync_connection() -> Connection {
    let settings = QueueSettings::with_default("sync").with_connection("sync", json!({}));
    Connection::new(settings, Arc::new(registry()))
}

#[tokio::test]
async fn sync_push_runs_job_once_before_returning() {
    let connection = sync_connection();

    let id = assert_ok!(connection.push(&Flaky::new("sync-once")).await);
    assert!(!id.is_empty());
    assert_eq!(calls("sync-once"), 1);

    // Nothing is stored for a worker
    assert_eq!(assert_ok!(connection.size("default").await), 0);
    assert_eq!(
        assert_ok!(connection.run("default").await),
        RunOutcome::Idle
    );
    assert_eq!(calls("sync-once"), 1);
}

#[tokio::test]
async fn sync_push_propagates_job_error() {
    let connection = sync_connection();

    let err = assert_err!(connection.push(&Flaky::new("sync-fails").failing(1)).await);
    assert!(matches!(err, CourierError::JobFailed { .. }));
    assert_eq!(calls("sync-fails"), 1);
}

#[tokio::test]
async fn duplicate_driver_registration_is_rejected_and_original_kept() {
    let settings = QueueSettings::with_default("sync")
        .with_connection("sync", json!({}))
        .with_connection("scratch", json!({"driver": "scratch", "wait_time_ms": 0}));
    let mut connection = Connection::new(settings, Arc::new(registry()));

    assert_ok!(connection.push_connection("scratch", Arc::new(MemoryQueueFactory)));
    let err = assert_err!(connection.push_connection("scratch", Arc::new(SyncFactory)));
    assert!(matches!(err, CourierError::DuplicateConnection { ref name } if name == "scratch"));

    connection.set_connection("scratch");
    let adapter = assert_ok!(connection.adapter().await);
    assert_eq!(adapter.driver(), "memory");
}

#[tokio::test]
async fn default_sync_without_entry_names_missing_key() {
    let config = CourierConfig::from_toml_str("[queue]\ndefault = \"sync\"\n").unwrap();
    let connection = Connection::from_config(&config, Arc::new(registry()))
        .await
        .unwrap();

    let err = assert_err!(connection.push(&Flaky::new("never-runs")).await);
    assert!(err.is_configuration());
    assert!(err.to_string().contains("connections.sync"));
    assert_eq!(calls("never-runs"), 0);
}

#[tokio::test]
async fn config_file_selects_named_connection() {
    let config = CourierConfig::from_toml_str(
        r#"
        [queue]
        default = "local"

        [queue.connections.local]
        driver = "memory"
        wait_time_ms = 0

        [cache]
        driver = "memory"
        "#,
    )
    .unwrap();
    let connection = Connection::from_config(&config, Arc::new(registry()))
        .await
        .unwrap();

    assert_eq!(connection.connection_name(), "local");
    assert_ok!(connection.push(&Flaky::new("from-config")).await);
    assert_eq!(assert_ok!(connection.size("default").await), 1);
    assert_eq!(
        assert_ok!(connection.run("default").await),
        RunOutcome::Completed
    );
    assert_eq!(calls("from-config"), 1);
}
