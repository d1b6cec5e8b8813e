//! In-memory job ledger
//!
//! Same claim/transition semantics as the Postgres ledger, backed by a
//! mutex-guarded map. Used for local development without a database and by
//! the orchestrator test suites.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{ArtifactLocation, ClaimOutcome, ConversionJob, JobLedger, JobStatus, LedgerError};

pub struct MemoryLedger {
    jobs: Mutex<HashMap<String, ConversionJob>>,
    stale_after: Duration,
}

impl MemoryLedger {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversionJob>> {
        // A poisoned ledger mutex means a panic mid-write; propagate the
        // inner state anyway, the map itself is always consistent.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(7200))
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn get(&self, source_id: &str) -> Result<Option<ConversionJob>, LedgerError> {
        Ok(self.lock().get(source_id).cloned())
    }

    async fn try_claim(&self, source_id: &str) -> Result<ClaimOutcome, LedgerError> {
        let mut jobs = self.lock();
        let now = Utc::now();

        match jobs.get_mut(source_id) {
            None => {
                jobs.insert(
                    source_id.to_string(),
                    ConversionJob {
                        source_id: source_id.to_string(),
                        status: JobStatus::Processing,
                        bucket: None,
                        path: None,
                        error_detail: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            },
            Some(job) => {
                let stale = job.status == JobStatus::Processing
                    && (now - job.updated_at).to_std().unwrap_or_default() > self.stale_after;

                if job.status.is_claimable() || stale {
                    job.status = JobStatus::Processing;
                    job.error_detail = None;
                    job.updated_at = now;
                    Ok(ClaimOutcome::Claimed)
                } else if job.status == JobStatus::Ready {
                    Ok(ClaimOutcome::Ready(job.clone()))
                } else {
                    Ok(ClaimOutcome::AlreadyProcessing(job.clone()))
                }
            },
        }
    }

    async fn mark_ready(
        &self,
        source_id: &str,
        location: &ArtifactLocation,
    ) -> Result<(), LedgerError> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(source_id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Ready;
                job.bucket = Some(location.bucket.clone());
                job.path = Some(location.path.clone());
                job.error_detail = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_error(&self, source_id: &str, detail: &str) -> Result<(), LedgerError> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(source_id) {
            if job.status == JobStatus::Processing {
                job.status = JobStatus::Error;
                job.error_detail = Some(detail.to_string());
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn touch(&self, source_id: &str) -> Result<(), LedgerError> {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(source_id) {
            if job.status == JobStatus::Processing {
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}
