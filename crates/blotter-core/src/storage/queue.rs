//! Repository for the delivery queue and dead-letter log.
//!
//! The queue is an append-only message table with competing-consumer
//! semantics. Claims use `FOR UPDATE SKIP LOCKED` so workers never block
//! each other; a claim holds a lease, and unacked messages whose lease has
//! expired become redeliverable (at-least-once delivery). Terminal
//! failures go to a separate dead-letter table, independent of the main
//! queue's redelivery mechanics.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DeadLetter, Job, QueueMessage, QueueStats},
};

/// Repository for delivery queue database operations.
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

    /// Publishes a job onto the queue. Returns the message id.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn publish(&self, job: &Job, now: DateTime<Utc>) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queue_messages (job, enqueued_at)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(sqlx::types::Json(job))
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Claims the next deliverable message for `consumer`.
    ///
    /// A message is deliverable when it is unacked and either unclaimed or
    /// its previous claim is older than `lease` (the holder is presumed
    /// crashed). Claims are taken in publish order. Returns `None` when the
    /// queue is empty.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim(
        &self,
        consumer: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueMessage>> {
        let lease_cutoff = now
            - chrono::Duration::from_std(lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut tx = self.pool.begin().await?;

        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM queue_messages
            WHERE acked_at IS NULL
              AND (claimed_at IS NULL OR claimed_at < $1)
            ORDER BY enqueued_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(lease_cutoff)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            tx.rollback().await?;
            return Ok(None);
        };

        let message = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE queue_messages
            SET claimed_by = $2, claimed_at = $3
            WHERE id = $1
            RETURNING id, job, enqueued_at, claimed_by, claimed_at, acked_at
            "#,
        )
        .bind(id)
        .bind(consumer)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(message))
    }

    /// Acknowledges a message so it is never redelivered.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn ack(&self, message_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_messages SET acked_at = $2 WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Appends a permanently failed job to the dead-letter log.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn dead_letter(&self, job: &Job, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (ori, offense, year, error, failed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&job.key.ori)
        .bind(&job.key.offense)
        .bind(job.key.year)
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns pending/acked/dead-lettered counts for observability.
    ///
    /// # Errors
    ///
    /// Returns error if the queries fail.
    pub async fn stats(&self) -> Result<QueueStats> {
        let (pending, acked): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE acked_at IS NULL),
                COUNT(*) FILTER (WHERE acked_at IS NOT NULL)
            FROM queue_messages
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        let dead_lettered: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters").fetch_one(&*self.pool).await?;

        Ok(QueueStats { pending, acked, dead_lettered })
    }

    /// Lists dead-letter entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT ori, offense, year, error, failed_at
            FROM dead_letters
            ORDER BY failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
