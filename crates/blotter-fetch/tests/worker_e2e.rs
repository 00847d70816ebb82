//! End-to-end pipeline tests: producer to worker to results, against an
//! in-memory store and a mock upstream API.

use std::{sync::Arc, time::Duration};

use blotter_core::{
    models::{JobKey, JobStatus},
    Clock, TestClock,
};
use blotter_fetch::{
    circuit::{CircuitBreaker, CircuitConfig},
    client::{ClientConfig, FetchClient},
    keypool::{KeyPool, DEFAULT_KEY_COOLDOWN},
    producer::Producer,
    storage::{mock::MockFetchStorage, FetchStorage},
    worker::{FetchWorker, WorkerConfig},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

struct Pipeline {
    producer: Producer,
    worker: Arc<FetchWorker>,
    storage: Arc<MockFetchStorage>,
}

fn pipeline(base_url: String, config: WorkerConfig) -> Pipeline {
    let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
    let keys = Arc::new(
        KeyPool::new(vec!["key-0001".to_string()], DEFAULT_KEY_COOLDOWN, clock.clone()).unwrap(),
    );
    let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone()));
    let client_config = ClientConfig {
        base_url,
        // High ceiling so the token bucket never delays tests.
        requests_per_second: 1000,
        ..ClientConfig::default()
    };
    let client = Arc::new(FetchClient::new(client_config, keys, circuits, clock.clone()).unwrap());

    let storage = Arc::new(MockFetchStorage::new());
    let fetch_storage = storage.clone() as Arc<dyn FetchStorage>;

    Pipeline {
        producer: Producer::new(fetch_storage.clone()),
        worker: Arc::new(FetchWorker::new(
            config,
            fetch_storage,
            client,
            clock,
            CancellationToken::new(),
        )),
        storage,
    }
}

fn twelve_tens_payload() -> serde_json::Value {
    json!({
        "actuals": {
            "Agency Offenses": {
                "01-2024": 10, "02-2024": 10, "03-2024": 10, "04-2024": 10,
                "05-2024": 10, "06-2024": 10, "07-2024": 10, "08-2024": 10,
                "09-2024": 10, "10-2024": 10, "11-2024": 10, "12-2024": 10
            }
        }
    })
}

#[tokio::test]
async fn fetch_lifecycle_completes_and_persists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nibrs/agency/X1/A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(twelve_tens_payload()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/participation/agency/X1/2024/2024"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{ "data_year": 2024, "months_reported": 12 }]
        })))
        .mount(&server)
        .await;

    let p = pipeline(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));

    let outcome =
        p.producer.enqueue("X1", &["A".to_string()], &[2024], false).await.unwrap();
    assert_eq!(outcome.created, 1);

    let key = JobKey::new("X1", "A", 2024);
    let pending = p.storage.ledger_entry(&key).await.unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert_eq!(pending.attempts, 0);

    assert_eq!(p.worker.run_once().await.unwrap(), 1);

    let entry = p.storage.ledger_entry(&key).await.unwrap();
    assert_eq!(entry.status, JobStatus::Completed);
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.worker_id, Some(p.worker.id()));

    let record = p.storage.record(&key).await.unwrap();
    assert_eq!(record.actual_count, 120);
    assert_eq!(record.months_reported, Some(12));
    assert!(record.parsed_ok);

    let stats = p.storage.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn producer_rerun_creates_no_duplicate_work() {
    let server = MockServer::start().await;
    let p = pipeline(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));

    let first = p.producer.enqueue("X1", &["A".to_string()], &[2024], false).await.unwrap();
    let second = p.producer.enqueue("X1", &["A".to_string()], &[2024], false).await.unwrap();

    assert_eq!(first.created, 1);
    assert_eq!(second.created, 0);
    assert_eq!(p.storage.publish_count().await, 1);
}

#[tokio::test]
async fn terminal_failure_is_recorded_and_dead_lettered() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let p = pipeline(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
    p.producer.enqueue("X1", &["A".to_string()], &[2024], false).await.unwrap();

    p.worker.run_once().await.unwrap();

    let key = JobKey::new("X1", "A", 2024);
    let entry = p.storage.ledger_entry(&key).await.unwrap();
    assert_eq!(entry.status, JobStatus::Failed);
    assert_eq!(entry.attempts, 1);
    assert!(entry.last_error.is_some());

    let dead = p.storage.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].ori, "X1");

    let stats = p.storage.queue_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn open_circuit_fails_items_without_touching_the_network() {
    let server = MockServer::start().await;
    // Three attempts from the first item trip the partition's circuit; the
    // second item must fail fast without a request. expect(3) verifies the
    // request count when the server drops.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = WorkerConfig::standard(vec!["A".to_string()]);
    config.item_concurrency = 1;
    let p = pipeline(server.uri(), config);

    p.producer.enqueue("R1001", &["A".to_string()], &[2024], false).await.unwrap();
    p.producer.enqueue("R1002", &["A".to_string()], &[2024], false).await.unwrap();

    assert_eq!(p.worker.run_once().await.unwrap(), 1);
    assert_eq!(p.worker.run_once().await.unwrap(), 1);

    let first = p.storage.ledger_entry(&JobKey::new("R1001", "A", 2024)).await.unwrap();
    assert_eq!(first.status, JobStatus::Failed);

    let second = p.storage.ledger_entry(&JobKey::new("R1002", "A", 2024)).await.unwrap();
    assert_eq!(second.status, JobStatus::Failed);
    assert!(second.last_error.unwrap().contains("circuit open for partition R1"));

    assert_eq!(p.storage.dead_letters().await.len(), 2);
}

#[tokio::test]
async fn failed_items_can_be_requeued_and_complete() {
    let server = MockServer::start().await;
    let p = pipeline(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
    p.producer.enqueue("X1", &["A".to_string()], &[2024], false).await.unwrap();

    // Upstream misroutes the first pass. 404s exhaust the item's attempts
    // without tripping the partition circuit.
    let outage = Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(3)
        .mount_as_scoped(&server)
        .await;
    p.worker.run_once().await.unwrap();
    drop(outage);

    let key = JobKey::new("X1", "A", 2024);
    assert_eq!(p.storage.ledger_entry(&key).await.unwrap().status, JobStatus::Failed);

    Mock::given(method("GET"))
        .and(path("/nibrs/agency/X1/A"))
        .respond_with(ResponseTemplate::new(200).set_body_json(twelve_tens_payload()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/participation/agency/X1/2024/2024"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert_eq!(p.producer.requeue_failed().await.unwrap(), 1);
    p.worker.run_once().await.unwrap();

    let entry = p.storage.ledger_entry(&key).await.unwrap();
    assert_eq!(entry.status, JobStatus::Completed);
    assert_eq!(p.storage.record(&key).await.unwrap().actual_count, 120);
}
