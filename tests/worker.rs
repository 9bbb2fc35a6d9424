mod helpers;

use courierq::core::FailedJob;
use courierq::prelude::*;
use helpers::{Flaky, calls, registry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

async fn memory_connection(cache: Arc<InMemoryCache>) -> (Connection, Arc<dyn QueueAdapter>) {
    let settings = QueueSettings::with_default("local")
        .with_connection("local", json!({"driver": "memory", "wait_time_ms": 0}));
    let connection = Connection::new(settings, Arc::new(registry())).with_cache(cache);
    let adapter = connection.adapter().await.unwrap();
    (connection, adapter)
}

#[tokio::test]
async fn worker_drains_queue_and_stops_when_empty() {
    let cache = Arc::new(InMemoryCache::new());
    let (connection, adapter) = memory_connection(cache.clone()).await;

    for name in ["w-first", "w-second", "w-third"] {
        assert_ok!(connection.push(&Flaky::new(name).on("mail")).await);
    }
    // Failed jobs are recorded under the envelope id, not the transport's message id
    let doomed =
        JobEnvelope::from_job(&Flaky::new("w-doomed").on("mail").failing(u32::MAX).retries(1))
            .unwrap();
    let doomed_id = doomed.id.clone();
    assert_ok!(connection.push_envelope(doomed).await);
    assert_ok!(connection.push(&Flaky::new("w-elsewhere").on("other")).await);

    let worker =
        Worker::new(adapter).with_config(WorkerConfig::for_queue("mail").stop_when_empty());
    let stats = worker.run("mail", None).await;

    assert_eq!(stats.jobs_completed, 3);
    assert_eq!(stats.jobs_retried, 1);
    assert_eq!(stats.jobs_removed, 1);
    assert_eq!(stats.backend_errors, 0);
    assert_eq!(calls("w-doomed"), 2);
    assert_eq!(calls("w-elsewhere"), 0);

    assert_eq!(assert_ok!(connection.size("mail").await), 0);
    assert_eq!(assert_ok!(connection.size("other").await), 1);
    assert!(
        cache
            .get(&FailedJob::cache_key_for(&doomed_id))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn worker_stops_on_shutdown_token() {
    let (connection, adapter) = memory_connection(Arc::new(InMemoryCache::new())).await;
    adapter.set_sleep(Duration::from_millis(10));

    let worker = Worker::new(adapter);
    let token = worker.shutdown_token();
    let handle = tokio::spawn(async move { worker.run("live", Some(1)).await });

    assert_ok!(connection.push(&Flaky::new("w-live").on("live")).await);
    while calls("w-live") == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    token.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker stopped")
        .unwrap();
    assert_eq!(stats.jobs_completed, 1);
}
