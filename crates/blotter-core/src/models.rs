//! Domain models and strongly-typed identifiers.
//!
//! Defines work items, ledger entries, queue messages, and fetched crime
//! records, along with database serialization traits for each.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Identity of a single unit of fetch work.
///
/// One key corresponds to one (agency, offense code, year) triple. The
/// ledger and the results store both enforce uniqueness on this triple,
/// which is what makes producer re-runs and message redelivery safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    /// Originating agency identifier (ORI), or an aggregate identity such
    /// as `STATE_CA` or `NATIONAL_US`.
    pub ori: String,
    /// Offense classification code.
    pub offense: String,
    /// Calendar year of the data being fetched.
    pub year: i32,
}

impl JobKey {
    /// Creates a new job key.
    pub fn new(ori: impl Into<String>, offense: impl Into<String>, year: i32) -> Self {
        Self { ori: ori.into(), offense: offense.into(), year }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.ori, self.offense, self.year)
    }
}

/// A work item as carried on the delivery queue.
///
/// Immutable once created; the attempt counter reflects the value at
/// enqueue time, the authoritative count lives in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Work item identity.
    #[serde(flatten)]
    pub key: JobKey,
    /// Attempt count at the time this message was published.
    pub attempts: i32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a fresh job for the given key.
    pub fn new(key: JobKey, created_at: DateTime<Utc>) -> Self {
        Self { key, attempts: 0, created_at }
    }
}

/// Lifecycle status of a ledger entry.
///
/// ```text
/// Pending -> InProgress -> Completed
///                       -> Failed (dead-lettered; requeue resets to Pending)
/// Skipped is set administratively and never entered by workers.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created by the producer, not yet claimed.
    Pending,
    /// A worker has claimed the item and is fetching.
    InProgress,
    /// Fetch succeeded and the result was persisted.
    Completed,
    /// Fetch failed terminally; a dead-letter entry exists.
    Failed,
    /// Administratively excluded from fetching.
    Skipped,
}

impl JobStatus {
    /// Stable string form used in the database.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid job status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for JobStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Strongly-typed worker identifier.
///
/// Recorded on ledger entries when a worker claims an item, so stuck or
/// crashed work can be traced back to the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Creates a new random worker ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for WorkerId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for WorkerId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for WorkerId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for WorkerId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Durable record of a work item's lifecycle.
///
/// Never deleted; serves as audit trail and as the idempotency guard
/// against re-enqueueing work that already ran.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    /// Row identifier.
    pub id: i64,
    /// Agency or aggregate identity.
    pub ori: String,
    /// Offense classification code.
    pub offense: String,
    /// Calendar year.
    pub year: i32,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Number of times a worker has started this item.
    pub attempts: i32,
    /// Error text from the most recent failure.
    pub last_error: Option<String>,
    /// Worker that most recently claimed this item.
    pub worker_id: Option<WorkerId>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When a worker last started processing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the item reached `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    /// Work item identity for this entry.
    pub fn key(&self) -> JobKey {
        JobKey::new(self.ori.clone(), self.offense.clone(), self.year)
    }
}

/// A message on the delivery queue.
///
/// The queue owns the message until acknowledged. A claim stamps
/// `claimed_by`/`claimed_at`; an unacked message whose claim lease has
/// expired becomes redeliverable to another consumer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueMessage {
    /// Message identifier, used as the delivery handle for `ack`.
    pub id: i64,
    /// The work item being delivered.
    pub job: sqlx::types::Json<Job>,
    /// When the message was published.
    pub enqueued_at: DateTime<Utc>,
    /// Consumer currently holding the claim, if any.
    pub claimed_by: Option<String>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the message was acknowledged, if ever.
    pub acked_at: Option<DateTime<Utc>>,
}

impl QueueMessage {
    /// The carried job.
    pub fn job(&self) -> &Job {
        &self.job.0
    }
}

/// An entry on the dead-letter log.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeadLetter {
    /// Agency or aggregate identity.
    pub ori: String,
    /// Offense classification code.
    pub offense: String,
    /// Calendar year.
    pub year: i32,
    /// Why the item failed.
    pub error: String,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// Queue depth counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages published but not yet acknowledged.
    pub pending: i64,
    /// Messages acknowledged.
    pub acked: i64,
    /// Entries on the dead-letter log.
    pub dead_lettered: i64,
}

/// A fetched and parsed crime statistic, upserted into the results store.
///
/// Keyed by (ori, offense, year) with last-write-wins semantics. The raw
/// upstream payload is retained for forensic replay.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrimeRecord {
    /// Agency or aggregate identity.
    pub ori: String,
    /// Offense classification code.
    pub offense: String,
    /// Calendar year.
    pub year: i32,
    /// Sum of reported monthly offense counts for the year.
    pub actual_count: i64,
    /// Sum of reported monthly clearance counts, when present upstream.
    pub clearance_count: Option<i64>,
    /// Number of months the agency reported data for this year.
    pub months_reported: Option<i32>,
    /// Population covered by the agency, when known.
    pub population: Option<i64>,
    /// Percent-of-population coverage reported upstream.
    pub population_pct: Option<f64>,
    /// Whether the payload parsed cleanly.
    pub parsed_ok: bool,
    /// Parse failure detail, if any.
    pub parse_error: Option<String>,
    /// Raw upstream payload.
    pub raw_json: sqlx::types::Json<serde_json::Value>,
    /// When the record was fetched.
    pub fetched_at: DateTime<Utc>,
}

/// How much of a requested offense set has been fetched for an agency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// No requested offense has completed yet.
    Pending,
    /// Some, but not all, requested offenses have completed.
    Partial,
    /// Every requested offense has completed.
    Complete,
}

impl EnrichmentStatus {
    /// Stable string form used in the database.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for EnrichmentStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EnrichmentStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "partial" => Ok(Self::Partial),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("invalid enrichment status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for EnrichmentStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Reference row for an agency whose data can be fetched.
///
/// The enrichment fields let the producer skip offenses that already
/// completed for this agency. `is_heavy_lift` marks unusually large
/// agencies routed to the low-concurrency worker profile.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agency {
    /// Agency identifier.
    pub ori: String,
    /// Human-readable agency name.
    pub name: String,
    /// Whether this agency routes to the heavy-lift worker profile.
    pub is_heavy_lift: bool,
    /// Offense codes that have completed for this agency.
    pub enriched_offenses: sqlx::types::Json<Vec<String>>,
    /// Derived enrichment classification.
    pub enrichment_status: EnrichmentStatus,
    /// When enrichment last advanced.
    pub last_enriched_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_display_matches_database_form() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert_eq!(JobStatus::Skipped.to_string(), "skipped");
    }

    #[test]
    fn job_key_display_is_slash_separated() {
        let key = JobKey::new("CA0010000", "V", 2024);
        assert_eq!(key.to_string(), "CA0010000/V/2024");
    }

    #[test]
    fn job_serializes_with_flattened_key() {
        let job = Job::new(JobKey::new("X1", "A", 2024), Utc::now());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["ori"], "X1");
        assert_eq!(value["offense"], "A");
        assert_eq!(value["year"], 2024);
        assert_eq!(value["attempts"], 0);
    }
}
