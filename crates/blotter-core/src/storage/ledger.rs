//! Repository for job ledger operations.
//!
//! The ledger is the durable source of truth for whether a work item was
//! ever attempted, how many times, and what happened. Rows are never
//! deleted; uniqueness on (ori, offense, year) is the idempotency backbone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{JobKey, JobStatus, LedgerEntry, WorkerId},
};

/// Repository for job ledger database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a pending entry for the given identity if none exists.
    ///
    /// Returns `true` only when the row was newly created. Duplicate
    /// enqueue attempts are no-ops, which is what lets the producer re-run
    /// safely against a partially or fully completed universe.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_pending(&self, key: &JobKey, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_ledger (ori, offense, year, status, attempts, created_at)
            VALUES ($1, $2, $3, 'pending', 0, $4)
            ON CONFLICT (ori, offense, year) DO NOTHING
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Transitions an entry to `in_progress`, recording the claiming worker
    /// and incrementing the attempt counter.
    ///
    /// Returns the new attempt count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no entry exists for the identity.
    pub async fn mark_in_progress(
        &self,
        key: &JobKey,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let attempts: i32 = sqlx::query_scalar(
            r#"
            UPDATE job_ledger
            SET status = 'in_progress', attempts = attempts + 1,
                worker_id = $4, started_at = $5
            WHERE ori = $1 AND offense = $2 AND year = $3
            RETURNING attempts
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .bind(worker_id)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Transitions an entry to `completed` and stamps the completion time.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(&self, key: &JobKey, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_ledger
            SET status = 'completed', completed_at = $4, last_error = NULL
            WHERE ori = $1 AND offense = $2 AND year = $3
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Transitions an entry to `failed` with the error text.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, key: &JobKey, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_ledger
            SET status = 'failed', last_error = $4
            WHERE ori = $1 AND offense = $2 AND year = $3
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks an entry `skipped`, excluding it from fetching without
    /// deleting the audit trail.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_skipped(&self, key: &JobKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE job_ledger
            SET status = 'skipped'
            WHERE ori = $1 AND offense = $2 AND year = $3
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Fetches the ledger entry for an identity, if present.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, key: &JobKey) -> Result<Option<LedgerEntry>> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT id, ori, offense, year, status, attempts, last_error,
                   worker_id, created_at, started_at, completed_at
            FROM job_ledger
            WHERE ori = $1 AND offense = $2 AND year = $3
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Returns entry counts grouped by status, for dashboards.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn status_histogram(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM job_ledger GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }

    /// Resets every `failed` entry back to `pending` with zero attempts.
    ///
    /// Returns the identities that were reset so the caller can republish
    /// them onto the delivery queue.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_failed(&self) -> Result<Vec<JobKey>> {
        let rows: Vec<(String, String, i32)> = sqlx::query_as(
            r#"
            UPDATE job_ledger
            SET status = 'pending', attempts = 0, last_error = NULL,
                worker_id = NULL, started_at = NULL
            WHERE status = 'failed'
            RETURNING ori, offense, year
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(|(ori, offense, year)| JobKey::new(ori, offense, year)).collect())
    }
}
