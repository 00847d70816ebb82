//! Producer: expands an extraction request into queued work items.
//!
//! For plain agencies the producer consults enrichment tracking and skips
//! offenses that already completed, unless forced. Aggregate identities
//! (state and national) are not tracked and are always refetched; their
//! published figures are revised upstream long after initial release.
//! Either way the ledger's uniqueness guard makes re-runs safe: an
//! identity already in the ledger is never enqueued twice.

use std::sync::Arc;

use blotter_core::{
    models::{EnrichmentStatus, JobKey},
    storage::agencies::derive_status,
};

use crate::{error::Result, storage::FetchStorage, target::FetchTarget};

/// What an enqueue request produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Work items newly created and published.
    pub created: usize,
    /// Offenses skipped because they already completed for this agency.
    pub skipped_enriched: usize,
    /// Enrichment classification after accounting for the request.
    pub status: EnrichmentStatus,
}

/// Expands (identity, offenses, years) requests into ledger entries and
/// queue messages.
pub struct Producer {
    storage: Arc<dyn FetchStorage>,
}

impl Producer {
    /// Creates a producer over the given storage.
    pub fn new(storage: Arc<dyn FetchStorage>) -> Self {
        Self { storage }
    }

    /// Enqueues the offense/year grid for one identity.
    ///
    /// `force` bypasses enrichment skipping for plain agencies; it does not
    /// bypass the ledger, so identities that already ran are still not
    /// re-enqueued.
    ///
    /// # Errors
    ///
    /// Returns error if any storage operation fails.
    pub async fn enqueue(
        &self,
        ori: &str,
        offenses: &[String],
        years: &[i32],
        force: bool,
    ) -> Result<EnqueueOutcome> {
        let is_agency = matches!(FetchTarget::from_ori(ori), FetchTarget::Agency { .. });

        let enriched = if is_agency {
            self.storage.enriched_offenses(ori.to_string()).await?
        } else {
            Vec::new()
        };

        let mut created = 0;
        let mut skipped_enriched = 0;

        for offense in offenses {
            if is_agency && !force && enriched.contains(offense) {
                skipped_enriched += 1;
                continue;
            }

            for &year in years {
                let key = JobKey::new(ori, offense.clone(), year);
                if self.storage.create_job(key).await? {
                    created += 1;
                }
            }
        }

        let status = derive_status(&enriched, offenses);
        if is_agency {
            self.storage.set_enrichment_status(ori.to_string(), status).await?;
        }

        tracing::info!(ori, created, skipped_enriched, status = %status, "enqueued work items");

        Ok(EnqueueOutcome { created, skipped_enriched, status })
    }

    /// Resets every failed ledger entry to pending and republishes it.
    ///
    /// # Errors
    ///
    /// Returns error if the reset or republish fails.
    pub async fn requeue_failed(&self) -> Result<usize> {
        let requeued = self.storage.requeue_failed().await?;
        tracing::info!(requeued, "requeued failed work items");
        Ok(requeued)
    }
}
