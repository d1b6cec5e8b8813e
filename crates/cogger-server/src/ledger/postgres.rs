//! Postgres-backed job ledger
//!
//! Uses the runtime sqlx query API; the schema lives in `migrations/` and is
//! embedded via `sqlx::migrate!` at startup. The claim is a single
//! INSERT .. ON CONFLICT DO UPDATE with a status guard, so two concurrent
//! submitters can never both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{instrument, warn};

use super::{ArtifactLocation, ClaimOutcome, ConversionJob, JobLedger, JobStatus, LedgerError};

#[derive(Debug, FromRow)]
struct JobRow {
    source_id: String,
    status: String,
    bucket: Option<String>,
    path: Option<String>,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for ConversionJob {
    fn from(row: JobRow) -> Self {
        ConversionJob {
            source_id: row.source_id,
            status: JobStatus::from(row.status.as_str()),
            bucket: row.bucket,
            path: row.path,
            error_detail: row.error_detail,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Production ledger over a Postgres pool
#[derive(Clone)]
pub struct PgJobLedger {
    pool: PgPool,
    stale_after: Duration,
}

impl PgJobLedger {
    /// `stale_after` bounds how long a `processing` row blocks re-submission
    /// after a worker crash before a fresh claim may take it over.
    pub fn new(pool: PgPool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }

    async fn fetch(&self, source_id: &str) -> Result<Option<ConversionJob>, LedgerError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT source_id, status, bucket, path, error_detail, created_at, updated_at
            FROM scene_cogs
            WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ConversionJob::from))
    }
}

#[async_trait]
impl JobLedger for PgJobLedger {
    #[instrument(skip(self))]
    async fn get(&self, source_id: &str) -> Result<Option<ConversionJob>, LedgerError> {
        self.fetch(source_id).await
    }

    #[instrument(skip(self))]
    async fn try_claim(&self, source_id: &str) -> Result<ClaimOutcome, LedgerError> {
        // Single conditional write: wins only when the row is absent,
        // terminal, or processing past the staleness window.
        let result = sqlx::query(
            r#"
            INSERT INTO scene_cogs (source_id, status, created_at, updated_at)
            VALUES ($1, 'processing', NOW(), NOW())
            ON CONFLICT (source_id) DO UPDATE
            SET status = 'processing', error_detail = NULL, updated_at = NOW()
            WHERE scene_cogs.status IN ('not_available', 'error')
               OR (scene_cogs.status = 'processing'
                   AND scene_cogs.updated_at < NOW() - make_interval(secs => $2))
            "#,
        )
        .bind(source_id)
        .bind(self.stale_after.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        // Lost the claim: report the current state. The row must exist, since
        // an absent row always wins the insert.
        match self.fetch(source_id).await? {
            Some(job) if job.status == JobStatus::Ready => Ok(ClaimOutcome::Ready(job)),
            Some(job) => Ok(ClaimOutcome::AlreadyProcessing(job)),
            None => Err(LedgerError::Unavailable(format!(
                "claim lost but no ledger row for {source_id}"
            ))),
        }
    }

    #[instrument(skip(self, location))]
    async fn mark_ready(
        &self,
        source_id: &str,
        location: &ArtifactLocation,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE scene_cogs
            SET status = 'ready', bucket = $2, path = $3, error_detail = NULL, updated_at = NOW()
            WHERE source_id = $1 AND status = 'processing'
            "#,
        )
        .bind(source_id)
        .bind(&location.bucket)
        .bind(&location.path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(%source_id, "mark_ready skipped: job no longer processing");
        }

        Ok(())
    }

    #[instrument(skip(self, detail))]
    async fn mark_error(&self, source_id: &str, detail: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE scene_cogs
            SET status = 'error', error_detail = $2, updated_at = NOW()
            WHERE source_id = $1 AND status = 'processing'
            "#,
        )
        .bind(source_id)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(%source_id, "mark_error skipped: job no longer processing");
        }

        Ok(())
    }

    async fn touch(&self, source_id: &str) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE scene_cogs
            SET updated_at = NOW()
            WHERE source_id = $1 AND status = 'processing'
            "#,
        )
        .bind(source_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
