//! Job ledger: the durable record of conversion state per scene
//!
//! The ledger is the single source of truth consulted by status polling and
//! by the tile/info layer to resolve a scene identifier to a storage
//! location. All writes funnel through the orchestrator; reads are cheap and
//! side-effect free.
//!
//! The single-flight guarantee lives here: [`JobLedger::try_claim`] is a
//! conditional write keyed on `source_id` that only succeeds when the job is
//! absent, terminal (`not_available`/`error`), or stuck in `processing`
//! longer than the staleness window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgJobLedger;

/// Conversion job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotAvailable,
    Processing,
    Ready,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::NotAvailable => "not_available",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Error => "error",
        }
    }

    /// Statuses from which a new pipeline run may be claimed
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::NotAvailable | JobStatus::Error)
    }
}

impl From<&str> for JobStatus {
    fn from(s: &str) -> Self {
        match s {
            "processing" => JobStatus::Processing,
            "ready" => JobStatus::Ready,
            "error" => JobStatus::Error,
            _ => JobStatus::NotAvailable,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical address of an uploaded COG artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub bucket: String,
    pub path: String,
}

impl ArtifactLocation {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Canonical URI used by the ledger and the tile renderer
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.path)
    }
}

/// One row of the ledger: the lifecycle record for a single scene
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub source_id: String,
    pub status: JobStatus,
    pub bucket: Option<String>,
    pub path: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionJob {
    /// Artifact location, present only when the job is ready
    pub fn location(&self) -> Option<ArtifactLocation> {
        match (&self.status, &self.bucket, &self.path) {
            (JobStatus::Ready, Some(bucket), Some(path)) => {
                Some(ArtifactLocation::new(bucket.clone(), path.clone()))
            },
            _ => None,
        }
    }
}

/// Outcome of a conditional claim attempt
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The caller now owns the job; it transitioned to `processing`.
    Claimed,
    /// Another pipeline run is already in flight for this scene.
    AlreadyProcessing(ConversionJob),
    /// The artifact already exists; no work to do.
    Ready(ConversionJob),
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger backend unavailable: {0}")]
    Unavailable(String),
}

/// Durable keyed store of conversion jobs with conditional writes
///
/// Implementations must keep transitions totally ordered per `source_id`:
/// the claim is the only entry point into `processing`, and
/// `mark_ready`/`mark_error` only apply to a job currently `processing`.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Side-effect-free read of the current job state
    async fn get(&self, source_id: &str) -> Result<Option<ConversionJob>, LedgerError>;

    /// Atomically claim the job for a new pipeline run
    async fn try_claim(&self, source_id: &str) -> Result<ClaimOutcome, LedgerError>;

    /// Transition `processing` -> `ready` with the confirmed artifact location
    async fn mark_ready(
        &self,
        source_id: &str,
        location: &ArtifactLocation,
    ) -> Result<(), LedgerError>;

    /// Transition `processing` -> `error` with the failing stage and cause
    async fn mark_error(&self, source_id: &str, detail: &str) -> Result<(), LedgerError>;

    /// Refresh `updated_at` on a live `processing` claim. Workers call this
    /// periodically while a job is queued or executing, so the staleness
    /// window only ever reclaims claims whose worker died.
    async fn touch(&self, source_id: &str) -> Result<(), LedgerError>;

    /// Backend connectivity check for `/health`
    async fn ping(&self) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::NotAvailable,
            JobStatus::Processing,
            JobStatus::Ready,
            JobStatus::Error,
        ] {
            assert_eq!(JobStatus::from(status.as_str()), status);
        }
    }

    #[test]
    fn test_unknown_status_maps_to_not_available() {
        assert_eq!(JobStatus::from("bogus"), JobStatus::NotAvailable);
    }

    #[test]
    fn test_location_uri() {
        let location = ArtifactLocation::new("cog-bucket", "cogs/scene-a_rgb.tif");
        assert_eq!(location.uri(), "s3://cog-bucket/cogs/scene-a_rgb.tif");
    }

    #[test]
    fn test_location_only_when_ready() {
        let mut job = ConversionJob {
            source_id: "scene-a".to_string(),
            status: JobStatus::Processing,
            bucket: Some("cog-bucket".to_string()),
            path: Some("cogs/scene-a_rgb.tif".to_string()),
            error_detail: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(job.location().is_none());

        job.status = JobStatus::Ready;
        assert_eq!(job.location().map(|l| l.uri()).as_deref(), Some("s3://cog-bucket/cogs/scene-a_rgb.tif"));
    }
}
