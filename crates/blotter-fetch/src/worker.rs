//! Fetch worker: claims work items from the queue and processes them.
//!
//! Each claimed item runs the full sequence: ledger transition to
//! in-progress, the counts range query, the best-effort participation
//! query for agencies, defensive parsing, upsert into the results store,
//! and the terminal ledger transition. Messages are acknowledged whether
//! the item succeeded or failed; terminal failures live in the ledger and
//! the dead-letter log, not in queue redelivery.

use std::{sync::Arc, time::Duration};

use blotter_core::{
    models::{CrimeRecord, JobKey, QueueMessage, WorkerId},
    Clock,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    client::FetchClient,
    error::{FetchError, Result},
    parse::{parse_year, participation_months},
    storage::FetchStorage,
    target::{range_params, FetchTarget},
};

/// Pause before retrying after a worker iteration error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Per-worker processing parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Claim lease; unacked items become redeliverable after this.
    pub claim_lease: Duration,
    /// Items claimed and processed concurrently per iteration.
    pub item_concurrency: usize,
    /// Per-call upstream timeout.
    pub request_timeout: Duration,
    /// Attempts per counts query before the item fails.
    pub max_attempts: u32,
    /// Pause between batches, used by the heavy-lift profile.
    pub inter_item_pause: Duration,
    /// Full requested offense set, for enrichment status computation.
    pub offense_catalogue: Vec<String>,
}

impl WorkerConfig {
    /// Standard profile for ordinary agencies and aggregates.
    pub fn standard(offense_catalogue: Vec<String>) -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(60),
            item_concurrency: 5,
            request_timeout: Duration::from_secs(15),
            max_attempts: 3,
            inter_item_pause: Duration::ZERO,
            offense_catalogue,
        }
    }

    /// Gentler profile for unusually large agencies: one item at a time,
    /// a longer timeout, more attempts, and a pause between items.
    pub fn heavy_lift(offense_catalogue: Vec<String>) -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            claim_lease: Duration::from_secs(120),
            item_concurrency: 1,
            request_timeout: Duration::from_secs(60),
            max_attempts: 5,
            inter_item_pause: Duration::from_secs(2),
            offense_catalogue,
        }
    }
}

/// A single fetch worker. Run several for competing-consumer throughput.
pub struct FetchWorker {
    id: WorkerId,
    config: WorkerConfig,
    storage: Arc<dyn FetchStorage>,
    client: Arc<FetchClient>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl FetchWorker {
    /// Creates a worker with a fresh identity.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn FetchStorage>,
        client: Arc<FetchClient>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id: WorkerId::new(), config, storage, client, clock, cancel }
    }

    /// This worker's identity, as recorded on claimed ledger entries.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Runs the claim-process loop until cancelled.
    ///
    /// Cancellation is observed at the top of each iteration and during
    /// sleeps, never mid-batch: items already claimed are processed and
    /// acknowledged before the loop exits.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            worker = %self.id,
            item_concurrency = self.config.item_concurrency,
            "fetch worker started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {},
                    }
                },
                Ok(processed) => {
                    tracing::debug!(worker = %self.id, processed, "batch processed");
                    if !self.config.inter_item_pause.is_zero() {
                        tokio::select! {
                            () = self.cancel.cancelled() => break,
                            () = self.clock.sleep(self.config.inter_item_pause) => {},
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "worker iteration failed");
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(ERROR_BACKOFF) => {},
                    }
                },
            }
        }

        tracing::info!(worker = %self.id, "fetch worker stopped");
    }

    /// Claims up to `item_concurrency` messages and processes them
    /// concurrently. Returns the number of messages processed.
    pub async fn run_once(self: &Arc<Self>) -> Result<usize> {
        let consumer = format!("worker-{}", self.id);

        let mut claimed = Vec::new();
        for _ in 0..self.config.item_concurrency {
            match self.storage.claim(consumer.clone(), self.config.claim_lease).await? {
                Some(message) => claimed.push(message),
                None => break,
            }
        }

        if claimed.is_empty() {
            return Ok(0);
        }

        let count = claimed.len();
        let mut tasks = JoinSet::new();
        for message in claimed {
            let worker = Arc::clone(self);
            tasks.spawn(async move { worker.process_message(message).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(worker = %self.id, error = %e, "item task panicked");
            }
        }

        Ok(count)
    }

    /// Processes one claimed message through to a terminal ledger state.
    ///
    /// The message is acknowledged regardless of outcome so a failed item
    /// is not redelivered; requeueing failures is an explicit operation.
    async fn process_message(&self, message: QueueMessage) {
        let job = message.job().clone();
        let key = job.key.clone();

        match self.process_item(&key).await {
            Ok(()) => tracing::info!(item = %key, "work item completed"),
            Err(e) => {
                tracing::warn!(item = %key, error = %e, "work item failed");
                if let Err(se) = self.storage.mark_failed(key.clone(), e.to_string()).await {
                    tracing::error!(item = %key, error = %se, "failed to record item failure");
                }
                if let Err(se) = self.storage.dead_letter(job, e.to_string()).await {
                    tracing::error!(item = %key, error = %se, "failed to dead-letter item");
                }
            },
        }

        if let Err(e) = self.storage.ack(message.id).await {
            tracing::error!(message_id = message.id, error = %e, "failed to ack message");
        }
    }

    async fn process_item(&self, key: &JobKey) -> Result<()> {
        let attempt = self.storage.mark_in_progress(key.clone(), self.id).await?;
        tracing::debug!(item = %key, attempt, "fetching work item");

        let record = self.fetch_item(key).await?;
        let parse_failure = record.parse_error.clone();

        // The raw payload is persisted even when parsing failed, so the
        // shape problem can be diagnosed and replayed later.
        self.storage.upsert_record(record).await?;

        if let Some(message) = parse_failure {
            return Err(FetchError::parse(message));
        }

        self.storage.mark_completed(key.clone()).await?;

        if matches!(FetchTarget::from_ori(&key.ori), FetchTarget::Agency { .. }) {
            let status = self
                .storage
                .mark_offense_enriched(
                    key.ori.clone(),
                    key.offense.clone(),
                    self.config.offense_catalogue.clone(),
                )
                .await?;
            tracing::debug!(ori = %key.ori, offense = %key.offense, status = %status, "enrichment advanced");
        }

        Ok(())
    }

    /// Fetches and parses one work item into a record.
    ///
    /// The counts query is mandatory and retried; the participation query
    /// only runs for agencies and is best effort.
    async fn fetch_item(&self, key: &JobKey) -> Result<CrimeRecord> {
        let target = FetchTarget::from_ori(&key.ori);
        let partition = target.partition();

        if !self.client.partition_available(&partition).await {
            return Err(FetchError::circuit_open(partition));
        }

        let params = range_params(key.year, key.year);
        let payload = self
            .client
            .get_with_retry(
                &target.counts_path(&key.offense),
                &params,
                &partition,
                self.config.request_timeout,
                self.config.max_attempts,
            )
            .await;

        let Some(payload) = payload else {
            if !self.client.partition_available(&partition).await {
                return Err(FetchError::circuit_open(partition));
            }
            return Err(FetchError::network(format!(
                "no payload after {} attempts",
                self.config.max_attempts
            )));
        };

        let months_reported = match target.participation_path(key.year, key.year) {
            Some(path) => self
                .client
                .get(&path, &[], &partition, self.config.request_timeout)
                .await
                .and_then(|p| participation_months(&p, key.year)),
            None => None,
        };

        let fetched_at = self.clock.now_utc();

        Ok(match parse_year(&payload, key.year) {
            Ok(parsed) => {
                if !parsed.has_offense_data {
                    tracing::debug!(item = %key, "no offense data reported for year");
                }
                CrimeRecord {
                    ori: key.ori.clone(),
                    offense: key.offense.clone(),
                    year: key.year,
                    actual_count: parsed.actual_count,
                    clearance_count: parsed.clearance_count,
                    months_reported,
                    population: parsed.population,
                    population_pct: parsed.coverage_pct,
                    parsed_ok: true,
                    parse_error: None,
                    raw_json: sqlx::types::Json(payload),
                    fetched_at,
                }
            },
            Err(e) => CrimeRecord {
                ori: key.ori.clone(),
                offense: key.offense.clone(),
                year: key.year,
                actual_count: 0,
                clearance_count: None,
                months_reported,
                population: None,
                population_pct: None,
                parsed_ok: false,
                parse_error: Some(e.to_string()),
                raw_json: sqlx::types::Json(payload),
                fetched_at,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use blotter_core::{
        models::{EnrichmentStatus, JobStatus},
        TestClock,
    };
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        circuit::{CircuitBreaker, CircuitConfig},
        client::ClientConfig,
        keypool::{KeyPool, DEFAULT_KEY_COOLDOWN},
        storage::mock::MockFetchStorage,
    };

    struct Harness {
        worker: Arc<FetchWorker>,
        storage: Arc<MockFetchStorage>,
        cancel: CancellationToken,
    }

    fn harness(base_url: String, config: WorkerConfig) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let keys = Arc::new(
            KeyPool::new(vec!["key-0001".to_string()], DEFAULT_KEY_COOLDOWN, clock.clone())
                .unwrap(),
        );
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone()));
        let client_config = ClientConfig {
            base_url,
            // High ceiling so the token bucket never delays tests.
            requests_per_second: 1000,
            ..ClientConfig::default()
        };
        let client =
            Arc::new(FetchClient::new(client_config, keys, circuits, clock.clone()).unwrap());
        let storage = Arc::new(MockFetchStorage::new());
        let cancel = CancellationToken::new();

        let worker = Arc::new(FetchWorker::new(
            config,
            storage.clone() as Arc<dyn FetchStorage>,
            client,
            clock,
            cancel.clone(),
        ));

        Harness { worker, storage, cancel }
    }

    fn counts_payload() -> serde_json::Value {
        json!({
            "actuals": {
                "Agency Offenses": { "01-2024": 4, "02-2024": 6 },
                "Agency Clearances": { "01-2024": 1 }
            }
        })
    }

    #[tokio::test]
    async fn completed_item_persists_record_and_acks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nibrs/agency/X1/A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(counts_payload()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/participation/agency/X1/2024/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "data_year": 2024, "months_reported": 12 }]
            })))
            .mount(&server)
            .await;

        let h = harness(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
        h.storage.register_agency("X1").await;
        let key = JobKey::new("X1", "A", 2024);
        assert!(h.storage.create_job(key.clone()).await.unwrap());

        assert_eq!(h.worker.run_once().await.unwrap(), 1);

        let entry = h.storage.ledger_entry(&key).await.unwrap();
        assert_eq!(entry.status, JobStatus::Completed);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.worker_id, Some(h.worker.id()));

        let record = h.storage.record(&key).await.unwrap();
        assert_eq!(record.actual_count, 10);
        assert_eq!(record.clearance_count, Some(1));
        assert_eq!(record.months_reported, Some(12));
        assert!(record.parsed_ok);

        let stats = h.storage.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.acked, 1);

        assert_eq!(h.storage.enrichment_status("X1").await, Some(EnrichmentStatus::Complete));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_dead_letter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let h = harness(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
        let key = JobKey::new("X1", "A", 2024);
        h.storage.create_job(key.clone()).await.unwrap();

        assert_eq!(h.worker.run_once().await.unwrap(), 1);

        let entry = h.storage.ledger_entry(&key).await.unwrap();
        assert_eq!(entry.status, JobStatus::Failed);
        assert!(entry.last_error.is_some());

        let dead = h.storage.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].ori, "X1");

        // Failed items are still acknowledged, never redelivered.
        let stats = h.storage.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn parse_failure_keeps_raw_payload_and_fails_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nibrs/agency/X1/A"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "results": [] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/participation/agency/X1/2024/2024"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let h = harness(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
        let key = JobKey::new("X1", "A", 2024);
        h.storage.create_job(key.clone()).await.unwrap();

        h.worker.run_once().await.unwrap();

        let record = h.storage.record(&key).await.unwrap();
        assert!(!record.parsed_ok);
        assert!(record.parse_error.is_some());
        assert!(record.raw_json.0.get("results").is_some());

        let entry = h.storage.ledger_entry(&key).await.unwrap();
        assert_eq!(entry.status, JobStatus::Failed);
        assert_eq!(h.storage.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn aggregate_identity_skips_participation_and_enrichment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nibrs/state/ZZ/A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "actuals": { "Zedland Offenses": { "06-2024": 3 } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
        let key = JobKey::new("STATE_ZZ", "A", 2024);
        h.storage.create_job(key.clone()).await.unwrap();

        h.worker.run_once().await.unwrap();

        let record = h.storage.record(&key).await.unwrap();
        assert_eq!(record.actual_count, 3);
        assert_eq!(record.months_reported, None);

        let entry = h.storage.ledger_entry(&key).await.unwrap();
        assert_eq!(entry.status, JobStatus::Completed);
        assert_eq!(h.storage.enrichment_status("STATE_ZZ").await, None);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nibrs/agency/X1/A"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(counts_payload())
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/participation/agency/X1/2024/2024"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let h = harness(server.uri(), WorkerConfig::standard(vec!["A".to_string()]));
        let key = JobKey::new("X1", "A", 2024);
        h.storage.create_job(key.clone()).await.unwrap();

        let run = tokio::spawn(h.worker.clone().run());

        // Cancel while the counts call is still waiting on the upstream.
        // The claimed item must reach a terminal state and be acked before
        // the loop exits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.cancel.cancel();
        run.await.unwrap();

        let entry = h.storage.ledger_entry(&key).await.unwrap();
        assert_eq!(entry.status, JobStatus::Completed);

        let stats = h.storage.queue_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.acked, 1);
    }

    #[tokio::test]
    async fn empty_queue_processes_nothing() {
        let server = MockServer::start().await;
        let h = harness(server.uri(), WorkerConfig::standard(Vec::new()));
        assert_eq!(h.worker.run_once().await.unwrap(), 0);
    }
}
