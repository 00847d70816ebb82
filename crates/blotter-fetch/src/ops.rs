//! Operational snapshot of the whole pipeline, for logs and dashboards.

use std::collections::HashMap;

use blotter_core::models::{JobStatus, QueueStats};
use serde::Serialize;

use crate::{
    circuit::CircuitSnapshot,
    client::{ClientStats, FetchClient},
    error::Result,
    keypool::KeyStats,
    storage::FetchStorage,
};

/// Point-in-time view of queue depth, ledger progress, circuit state, and
/// credential usage.
#[derive(Debug, Serialize)]
pub struct OpsSnapshot {
    /// Queue depth counters.
    pub queue: QueueStats,
    /// Ledger entry counts by status.
    pub ledger: HashMap<JobStatus, i64>,
    /// Partitions whose circuit is currently open, with detail.
    pub open_circuits: HashMap<String, CircuitSnapshot>,
    /// Per-key usage, redacted to suffixes.
    pub keys: Vec<KeyStats>,
    /// Aggregate request counters.
    pub client: ClientStats,
}

impl OpsSnapshot {
    /// Collects a snapshot from storage and the client.
    ///
    /// # Errors
    ///
    /// Returns error if a storage query fails.
    pub async fn collect(storage: &dyn FetchStorage, client: &FetchClient) -> Result<Self> {
        let queue = storage.queue_stats().await?;
        let ledger = storage.ledger_histogram().await?.into_iter().collect();
        let open_circuits = client.circuits().all_open().await;
        let keys = client.keys().stats().await;

        Ok(Self { queue, ledger, open_circuits, keys, client: client.stats() })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use blotter_core::{models::JobKey, Clock, TestClock};

    use super::*;
    use crate::{
        circuit::{CircuitBreaker, CircuitConfig},
        client::ClientConfig,
        keypool::{KeyPool, DEFAULT_KEY_COOLDOWN},
        storage::mock::MockFetchStorage,
    };

    #[tokio::test]
    async fn snapshot_reflects_queue_and_circuit_state() {
        let clock: Arc<dyn Clock> = Arc::new(TestClock::new());
        let keys = Arc::new(
            KeyPool::new(vec!["key-0001".to_string()], DEFAULT_KEY_COOLDOWN, clock.clone())
                .unwrap(),
        );
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default(), clock.clone()));
        let client =
            FetchClient::new(ClientConfig::default(), keys, circuits.clone(), clock).unwrap();

        let storage = MockFetchStorage::new();
        storage.create_job(JobKey::new("X1", "A", 2024)).await.unwrap();
        for _ in 0..3 {
            circuits.record_failure("R1").await;
        }

        let snapshot = OpsSnapshot::collect(&storage, &client).await.unwrap();

        assert_eq!(snapshot.queue.pending, 1);
        assert_eq!(snapshot.ledger.get(&blotter_core::models::JobStatus::Pending), Some(&1));
        assert!(snapshot.open_circuits.contains_key("R1"));
        assert_eq!(snapshot.keys.len(), 1);
    }
}
