//! Repository for the fetched crime-record results store.
//!
//! Upserts are keyed by (ori, offense, year) with last-write-wins
//! semantics: redelivered work overwrites rather than duplicates.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{CrimeRecord, JobKey},
};

/// Repository for crime record database operations.
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

    /// Inserts or overwrites the record for its identity.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, record: &CrimeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crime_records (
                ori, offense, year, actual_count, clearance_count,
                months_reported, population, population_pct,
                parsed_ok, parse_error, raw_json, fetched_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (ori, offense, year) DO UPDATE SET
                actual_count = EXCLUDED.actual_count,
                clearance_count = EXCLUDED.clearance_count,
                months_reported = EXCLUDED.months_reported,
                population = EXCLUDED.population,
                population_pct = EXCLUDED.population_pct,
                parsed_ok = EXCLUDED.parsed_ok,
                parse_error = EXCLUDED.parse_error,
                raw_json = EXCLUDED.raw_json,
                fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(&record.ori)
        .bind(&record.offense)
        .bind(record.year)
        .bind(record.actual_count)
        .bind(record.clearance_count)
        .bind(record.months_reported)
        .bind(record.population)
        .bind(record.population_pct)
        .bind(record.parsed_ok)
        .bind(&record.parse_error)
        .bind(&record.raw_json)
        .bind(record.fetched_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Fetches the record for an identity, if present.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, key: &JobKey) -> Result<Option<CrimeRecord>> {
        let record = sqlx::query_as::<_, CrimeRecord>(
            r#"
            SELECT ori, offense, year, actual_count, clearance_count,
                   months_reported, population, population_pct,
                   parsed_ok, parse_error, raw_json, fetched_at
            FROM crime_records
            WHERE ori = $1 AND offense = $2 AND year = $3
            "#,
        )
        .bind(&key.ori)
        .bind(&key.offense)
        .bind(key.year)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }
}
