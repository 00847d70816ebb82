//! Database access layer implementing the repository pattern for the
//! ingestion pipeline.
//!
//! The repository layer translates between domain models and database
//! schemas. All database operations go through these repositories; direct
//! SQL outside this module is forbidden to keep the schema evolvable.

use std::sync::Arc;

use sqlx::PgPool;

pub mod agencies;
pub mod ledger;
pub mod queue;
pub mod results;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
///
/// Manages a shared connection pool and provides type-safe access to each
/// domain repository.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the durable job ledger.
    pub ledger: Arc<ledger::Repository>,

    /// Repository for the delivery queue and dead-letter log.
    pub queue: Arc<queue::Repository>,

    /// Repository for fetched crime records.
    pub results: Arc<results::Repository>,

    /// Repository for agency reference and enrichment tracking.
    pub agencies: Arc<agencies::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool behind an `Arc`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            ledger: Arc::new(ledger::Repository::new(pool.clone())),
            queue: Arc::new(queue::Repository::new(pool.clone())),
            results: Arc::new(results::Repository::new(pool.clone())),
            agencies: Arc::new(agencies::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or the
    /// query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.ledger.pool()).await?;

        Ok(())
    }
}
