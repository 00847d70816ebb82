//! Repository for agency reference data and enrichment tracking.
//!
//! Enrichment tracking records which offenses have completed per agency
//! so the producer can skip work that already ran. Aggregate identities
//! (state and national) are not tracked here; they are always refetched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Agency, EnrichmentStatus},
};

/// Repository for agency database operations.
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

    /// Inserts or updates an agency reference row.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, agency: &Agency) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agencies (
                ori, name, is_heavy_lift, enriched_offenses,
                enrichment_status, last_enriched_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (ori) DO UPDATE SET
                name = EXCLUDED.name,
                is_heavy_lift = EXCLUDED.is_heavy_lift
            "#,
        )
        .bind(&agency.ori)
        .bind(&agency.name)
        .bind(agency.is_heavy_lift)
        .bind(&agency.enriched_offenses)
        .bind(agency.enrichment_status)
        .bind(agency.last_enriched_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Fetches an agency by ORI, if present.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, ori: &str) -> Result<Option<Agency>> {
        let agency = sqlx::query_as::<_, Agency>(
            r#"
            SELECT ori, name, is_heavy_lift, enriched_offenses,
                   enrichment_status, last_enriched_at
            FROM agencies
            WHERE ori = $1
            "#,
        )
        .bind(ori)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(agency)
    }

    /// Offense codes that have completed for this agency.
    ///
    /// Unknown agencies report no completed offenses rather than erroring,
    /// so the producer can enqueue for identities without a reference row.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn enriched_offenses(&self, ori: &str) -> Result<Vec<String>> {
        let offenses: Option<sqlx::types::Json<Vec<String>>> =
            sqlx::query_scalar("SELECT enriched_offenses FROM agencies WHERE ori = $1")
                .bind(ori)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(offenses.map(|j| j.0).unwrap_or_default())
    }

    /// Records that `offense` completed for `ori` and recomputes the
    /// enrichment status against `catalogue`, the full requested offense
    /// set. Returns the new status.
    ///
    /// No-op returning `Pending` when the agency has no reference row.
    ///
    /// # Errors
    ///
    /// Returns error if the read or update fails.
    pub async fn mark_offense_enriched(
        &self,
        ori: &str,
        offense: &str,
        catalogue: &[String],
        now: DateTime<Utc>,
    ) -> Result<EnrichmentStatus> {
        let mut enriched = match self.find(ori).await? {
            Some(agency) => agency.enriched_offenses.0,
            None => return Ok(EnrichmentStatus::Pending),
        };

        if !enriched.iter().any(|o| o == offense) {
            enriched.push(offense.to_string());
        }

        let status = derive_status(&enriched, catalogue);

        sqlx::query(
            r#"
            UPDATE agencies
            SET enriched_offenses = $2, enrichment_status = $3, last_enriched_at = $4
            WHERE ori = $1
            "#,
        )
        .bind(ori)
        .bind(sqlx::types::Json(&enriched))
        .bind(status)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(status)
    }

    /// Overwrites the enrichment status for an agency.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn set_enrichment_status(&self, ori: &str, status: EnrichmentStatus) -> Result<()> {
        sqlx::query("UPDATE agencies SET enrichment_status = $2 WHERE ori = $1")
            .bind(ori)
            .bind(status)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}

/// Classifies enrichment from the completed set against the requested set.
pub fn derive_status(enriched: &[String], catalogue: &[String]) -> EnrichmentStatus {
    let completed = catalogue.iter().filter(|o| enriched.contains(o)).count();

    if completed == 0 {
        EnrichmentStatus::Pending
    } else if completed < catalogue.len() {
        EnrichmentStatus::Partial
    } else {
        EnrichmentStatus::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn status_pending_when_nothing_completed() {
        let status = derive_status(&[], &codes(&["V", "HOM", "BUR"]));
        assert_eq!(status, EnrichmentStatus::Pending);
    }

    #[test]
    fn status_partial_when_some_completed() {
        let status = derive_status(&codes(&["V"]), &codes(&["V", "HOM", "BUR"]));
        assert_eq!(status, EnrichmentStatus::Partial);
    }

    #[test]
    fn status_complete_when_all_completed() {
        let status = derive_status(&codes(&["HOM", "V", "BUR"]), &codes(&["V", "HOM", "BUR"]));
        assert_eq!(status, EnrichmentStatus::Complete);
    }

    #[test]
    fn offenses_outside_catalogue_do_not_count() {
        let status = derive_status(&codes(&["ARSON"]), &codes(&["V", "HOM"]));
        assert_eq!(status, EnrichmentStatus::Pending);
    }
}
