//! Core domain types and storage layer for the blotter ingestion pipeline.
//!
//! Provides the durable job ledger, the Postgres-backed delivery queue,
//! the results store for fetched crime records, agency enrichment tracking,
//! and the clock abstraction used for deterministic testing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    CrimeRecord, DeadLetter, EnrichmentStatus, Job, JobKey, JobStatus, LedgerEntry, QueueMessage,
    QueueStats, WorkerId,
};
pub use time::{Clock, RealClock, TestClock};
