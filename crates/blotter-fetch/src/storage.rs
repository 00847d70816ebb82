//! Storage abstraction for the fetch pipeline.
//!
//! Trait-based abstraction over ledger, queue, results, and enrichment
//! operations so worker and producer logic can be tested without a
//! database. Production uses the concrete `blotter_core::storage::Storage`;
//! tests use the in-memory mock below.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use blotter_core::{
    error::Result,
    models::{
        CrimeRecord, EnrichmentStatus, Job, JobKey, JobStatus, LedgerEntry, QueueMessage,
        QueueStats, WorkerId,
    },
    Clock,
};

/// Storage operations required by the producer and workers.
///
/// Methods take owned arguments so implementations can move them into the
/// returned futures.
pub trait FetchStorage: Send + Sync + 'static {
    /// Idempotently creates a pending ledger entry and, only when the
    /// entry is newly created, publishes the job onto the delivery queue.
    ///
    /// Returns whether the entry was newly created.
    fn create_job(&self, key: JobKey) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Claims the next deliverable queue message for `consumer`.
    fn claim(
        &self,
        consumer: String,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueMessage>>> + Send + '_>>;

    /// Acknowledges a queue message so it is never redelivered.
    fn ack(&self, message_id: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Appends a permanently failed job to the dead-letter log.
    fn dead_letter(
        &self,
        job: Job,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Transitions a ledger entry to in-progress, recording the worker and
    /// incrementing attempts. Returns the new attempt count.
    fn mark_in_progress(
        &self,
        key: JobKey,
        worker: WorkerId,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>>;

    /// Transitions a ledger entry to completed.
    fn mark_completed(&self, key: JobKey)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Transitions a ledger entry to failed with the error text.
    fn mark_failed(
        &self,
        key: JobKey,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Upserts a fetched record, last write wins.
    fn upsert_record(
        &self,
        record: CrimeRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Offense codes that have completed for an agency. Unknown agencies
    /// report an empty set.
    fn enriched_offenses(
        &self,
        ori: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>>;

    /// Records a completed offense for an agency and recomputes its
    /// enrichment status against the requested catalogue.
    fn mark_offense_enriched(
        &self,
        ori: String,
        offense: String,
        catalogue: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<EnrichmentStatus>> + Send + '_>>;

    /// Overwrites an agency's enrichment status.
    fn set_enrichment_status(
        &self,
        ori: String,
        status: EnrichmentStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Fetches a ledger entry, for lifecycle verification and dashboards.
    fn find_ledger(
        &self,
        key: JobKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LedgerEntry>>> + Send + '_>>;

    /// Queue depth counters.
    fn queue_stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>>;

    /// Ledger entry counts grouped by status.
    fn ledger_histogram(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(JobStatus, i64)>>> + Send + '_>>;

    /// Resets every failed ledger entry to pending with zero attempts and
    /// republishes them. Returns how many were requeued.
    fn requeue_failed(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;
}

/// Production storage implementation over PostgreSQL repositories.
pub struct PostgresFetchStorage {
    storage: Arc<blotter_core::storage::Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresFetchStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<blotter_core::storage::Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl FetchStorage for PostgresFetchStorage {
    fn create_job(&self, key: JobKey) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move {
            let created = storage.ledger.create_pending(&key, now).await?;
            if created {
                storage.queue.publish(&Job::new(key, now), now).await?;
            }
            Ok(created)
        })
    }

    fn claim(
        &self,
        consumer: String,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueueMessage>>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.queue.claim(&consumer, lease, now).await })
    }

    fn ack(&self, message_id: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.queue.ack(message_id, now).await })
    }

    fn dead_letter(
        &self,
        job: Job,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.queue.dead_letter(&job, &error, now).await })
    }

    fn mark_in_progress(
        &self,
        key: JobKey,
        worker: WorkerId,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.ledger.mark_in_progress(&key, worker, now).await })
    }

    fn mark_completed(
        &self,
        key: JobKey,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.ledger.mark_completed(&key, now).await })
    }

    fn mark_failed(
        &self,
        key: JobKey,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.ledger.mark_failed(&key, &error).await })
    }

    fn upsert_record(
        &self,
        record: CrimeRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.results.upsert(&record).await })
    }

    fn enriched_offenses(
        &self,
        ori: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.agencies.enriched_offenses(&ori).await })
    }

    fn mark_offense_enriched(
        &self,
        ori: String,
        offense: String,
        catalogue: Vec<String>,
    ) -> Pin<Box<dyn Future<Output = Result<EnrichmentStatus>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move {
            storage.agencies.mark_offense_enriched(&ori, &offense, &catalogue, now).await
        })
    }

    fn set_enrichment_status(
        &self,
        ori: String,
        status: EnrichmentStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.agencies.set_enrichment_status(&ori, status).await })
    }

    fn find_ledger(
        &self,
        key: JobKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LedgerEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.ledger.find(&key).await })
    }

    fn queue_stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.queue.stats().await })
    }

    fn ledger_histogram(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<(JobStatus, i64)>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.ledger.status_histogram().await })
    }

    fn requeue_failed(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move {
            let keys = storage.ledger.requeue_failed().await?;
            let count = keys.len();
            for key in keys {
                storage.queue.publish(&Job::new(key, now), now).await?;
            }
            Ok(count)
        })
    }
}

/// In-memory mock storage for DB-free worker and producer tests.
pub mod mock {
    use std::collections::HashMap;

    use blotter_core::models::DeadLetter;
    use blotter_core::storage::agencies::derive_status;
    use chrono::Utc;
    use tokio::sync::RwLock;

    use super::*;

    #[derive(Debug, Default)]
    struct MockState {
        ledger: HashMap<JobKey, LedgerEntry>,
        messages: Vec<MockMessage>,
        dead: Vec<DeadLetter>,
        records: HashMap<JobKey, CrimeRecord>,
        enriched: HashMap<String, Vec<String>>,
        statuses: HashMap<String, EnrichmentStatus>,
        next_ledger_id: i64,
        next_message_id: i64,
    }

    #[derive(Debug, Clone)]
    struct MockMessage {
        id: i64,
        job: Job,
        claimed_by: Option<String>,
        lease_expires_at: Option<std::time::Instant>,
        acked: bool,
    }

    /// In-memory `FetchStorage` with inspection helpers for assertions.
    #[derive(Debug, Default)]
    pub struct MockFetchStorage {
        state: RwLock<MockState>,
    }

    impl MockFetchStorage {
        /// Creates an empty mock store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers an agency so enrichment tracking applies to it.
        pub async fn register_agency(&self, ori: &str) {
            let mut state = self.state.write().await;
            state.enriched.entry(ori.to_string()).or_default();
            state.statuses.entry(ori.to_string()).or_insert(EnrichmentStatus::Pending);
        }

        /// Ledger entry for an identity, if any.
        pub async fn ledger_entry(&self, key: &JobKey) -> Option<LedgerEntry> {
            self.state.read().await.ledger.get(key).cloned()
        }

        /// Stored record for an identity, if any.
        pub async fn record(&self, key: &JobKey) -> Option<CrimeRecord> {
            self.state.read().await.records.get(key).cloned()
        }

        /// All dead-letter entries.
        pub async fn dead_letters(&self) -> Vec<DeadLetter> {
            self.state.read().await.dead.clone()
        }

        /// Total messages ever published.
        pub async fn publish_count(&self) -> usize {
            self.state.read().await.messages.len()
        }

        /// Current enrichment status for an agency, if registered.
        pub async fn enrichment_status(&self, ori: &str) -> Option<EnrichmentStatus> {
            self.state.read().await.statuses.get(ori).copied()
        }
    }

    impl FetchStorage for MockFetchStorage {
        fn create_job(
            &self,
            key: JobKey,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.ledger.contains_key(&key) {
                    return Ok(false);
                }

                state.next_ledger_id += 1;
                let id = state.next_ledger_id;
                let now = Utc::now();
                state.ledger.insert(
                    key.clone(),
                    LedgerEntry {
                        id,
                        ori: key.ori.clone(),
                        offense: key.offense.clone(),
                        year: key.year,
                        status: JobStatus::Pending,
                        attempts: 0,
                        last_error: None,
                        worker_id: None,
                        created_at: now,
                        started_at: None,
                        completed_at: None,
                    },
                );

                state.next_message_id += 1;
                let message_id = state.next_message_id;
                state.messages.push(MockMessage {
                    id: message_id,
                    job: Job::new(key, now),
                    claimed_by: None,
                    lease_expires_at: None,
                    acked: false,
                });

                Ok(true)
            })
        }

        fn claim(
            &self,
            consumer: String,
            lease: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Option<QueueMessage>>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let now = Utc::now();
                let deadline = std::time::Instant::now();

                // Unclaimed, or claimed but unacked past its lease (the
                // holder is presumed crashed).
                let Some(message) = state.messages.iter_mut().find(|m| {
                    !m.acked
                        && (m.claimed_by.is_none()
                            || m.lease_expires_at.is_some_and(|t| t <= deadline))
                }) else {
                    return Ok(None);
                };

                message.claimed_by = Some(consumer.clone());
                message.lease_expires_at = Some(deadline + lease);

                Ok(Some(QueueMessage {
                    id: message.id,
                    job: sqlx::types::Json(message.job.clone()),
                    enqueued_at: message.job.created_at,
                    claimed_by: Some(consumer),
                    claimed_at: Some(now),
                    acked_at: None,
                }))
            })
        }

        fn ack(&self, message_id: i64) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) {
                    message.acked = true;
                }
                Ok(())
            })
        }

        fn dead_letter(
            &self,
            job: Job,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.dead.push(DeadLetter {
                    ori: job.key.ori,
                    offense: job.key.offense,
                    year: job.key.year,
                    error,
                    failed_at: Utc::now(),
                });
                Ok(())
            })
        }

        fn mark_in_progress(
            &self,
            key: JobKey,
            worker: WorkerId,
        ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let entry = state.ledger.get_mut(&key).ok_or_else(|| {
                    blotter_core::CoreError::NotFound(format!("no ledger entry for {key}"))
                })?;

                entry.status = JobStatus::InProgress;
                entry.attempts += 1;
                entry.worker_id = Some(worker);
                entry.started_at = Some(Utc::now());

                Ok(entry.attempts)
            })
        }

        fn mark_completed(
            &self,
            key: JobKey,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(entry) = state.ledger.get_mut(&key) {
                    entry.status = JobStatus::Completed;
                    entry.completed_at = Some(Utc::now());
                    entry.last_error = None;
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            key: JobKey,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if let Some(entry) = state.ledger.get_mut(&key) {
                    entry.status = JobStatus::Failed;
                    entry.last_error = Some(error);
                }
                Ok(())
            })
        }

        fn upsert_record(
            &self,
            record: CrimeRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let key = JobKey::new(record.ori.clone(), record.offense.clone(), record.year);
                self.state.write().await.records.insert(key, record);
                Ok(())
            })
        }

        fn enriched_offenses(
            &self,
            ori: String,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + '_>> {
            Box::pin(async move {
                Ok(self.state.read().await.enriched.get(&ori).cloned().unwrap_or_default())
            })
        }

        fn mark_offense_enriched(
            &self,
            ori: String,
            offense: String,
            catalogue: Vec<String>,
        ) -> Pin<Box<dyn Future<Output = Result<EnrichmentStatus>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let Some(enriched) = state.enriched.get_mut(&ori) else {
                    return Ok(EnrichmentStatus::Pending);
                };

                if !enriched.iter().any(|o| *o == offense) {
                    enriched.push(offense);
                }
                let status = derive_status(enriched, &catalogue);
                state.statuses.insert(ori, status);

                Ok(status)
            })
        }

        fn set_enrichment_status(
            &self,
            ori: String,
            status: EnrichmentStatus,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if state.statuses.contains_key(&ori) {
                    state.statuses.insert(ori, status);
                }
                Ok(())
            })
        }

        fn find_ledger(
            &self,
            key: JobKey,
        ) -> Pin<Box<dyn Future<Output = Result<Option<LedgerEntry>>> + Send + '_>> {
            Box::pin(async move { Ok(self.state.read().await.ledger.get(&key).cloned()) })
        }

        fn queue_stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let acked = state.messages.iter().filter(|m| m.acked).count() as i64;
                let pending = state.messages.len() as i64 - acked;
                Ok(QueueStats { pending, acked, dead_lettered: state.dead.len() as i64 })
            })
        }

        fn ledger_histogram(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<(JobStatus, i64)>>> + Send + '_>> {
            Box::pin(async move {
                let state = self.state.read().await;
                let mut counts: HashMap<JobStatus, i64> = HashMap::new();
                for entry in state.ledger.values() {
                    *counts.entry(entry.status).or_default() += 1;
                }
                Ok(counts.into_iter().collect())
            })
        }

        fn requeue_failed(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let now = Utc::now();

                let failed: Vec<JobKey> = state
                    .ledger
                    .values()
                    .filter(|e| e.status == JobStatus::Failed)
                    .map(LedgerEntry::key)
                    .collect();

                for key in &failed {
                    if let Some(entry) = state.ledger.get_mut(key) {
                        entry.status = JobStatus::Pending;
                        entry.attempts = 0;
                        entry.last_error = None;
                        entry.worker_id = None;
                        entry.started_at = None;
                    }
                    state.next_message_id += 1;
                    let id = state.next_message_id;
                    state.messages.push(MockMessage {
                        id,
                        job: Job::new(key.clone(), now),
                        claimed_by: None,
                        lease_expires_at: None,
                        acked: false,
                    });
                }

                Ok(failed.len())
            })
        }
    }
}
