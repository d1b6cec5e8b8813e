//! Conversion pipeline: fetch, convert, upload
//!
//! The [`Orchestrator`] drives a scene through the three stages behind the
//! ledger's single-flight claim. Stages are trait objects so the pipeline can
//! run against stubs in tests and against the real provider, converter, and
//! object store in production.

use async_trait::async_trait;
use cogger_common::checksum::Checksum;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::fetch::SceneHandle;
use crate::ledger::{ArtifactLocation, ClaimOutcome, JobLedger, LedgerError};

mod error;

pub use error::{PipelineError, Stage, StageError};

/// Default end-to-end budget for one conversion job
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default number of jobs allowed to execute concurrently
pub const DEFAULT_WORKER_SLOTS: usize = 1;

/// Default interval at which a running job refreshes its ledger claim
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Object key for a scene's finished artifact
pub fn cog_key(source_id: &str) -> String {
    format!("cogs/{source_id}_rgb.tif")
}

/// Hash a finished artifact off the async runtime
async fn artifact_checksum(path: &Path) -> Result<Checksum, StageError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || Checksum::from_file(&path))
        .await
        .map_err(|e| StageError::DataCorruption(format!("checksum task failed: {e}")))?
        .map_err(|e| StageError::DataCorruption(format!("artifact unreadable: {e}")))
}

/// Check a scene identifier before it reaches the ledger or the provider.
/// Scene identifiers are path components in object keys and URLs, so only a
/// conservative character set is accepted.
pub fn validate_source_id(source_id: &str) -> Result<(), SubmitError> {
    if source_id.is_empty() || source_id.len() > 256 {
        return Err(SubmitError::InvalidSourceId(source_id.to_string()));
    }
    if !source_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(SubmitError::InvalidSourceId(source_id.to_string()));
    }
    Ok(())
}

/// Local handle to a converted artifact awaiting upload; the scratch
/// directory is deleted on drop.
#[derive(Debug)]
pub struct CogHandle {
    _scratch: TempDir,
    path: PathBuf,
}

impl CogHandle {
    pub fn new(scratch: TempDir, path: PathBuf) -> Self {
        Self {
            _scratch: scratch,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolves a scene identifier to local band files
#[async_trait]
pub trait SceneSource: Send + Sync {
    async fn fetch(&self, source_id: &str) -> Result<SceneHandle, StageError>;
}

/// Composites fetched bands into a cloud-optimized artifact
#[async_trait]
pub trait CogConverter: Send + Sync {
    async fn convert(&self, source_id: &str, scene: SceneHandle) -> Result<CogHandle, StageError>;
}

/// Durable sink for finished artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Upload a local file under `key`; must only return `Ok` once the
    /// object is confirmed present in the store.
    async fn store(&self, key: &str, path: &Path) -> Result<(), StageError>;
}

/// Errors surfaced directly to a submit caller
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid scene identifier: {0}")]
    InvalidSourceId(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// What happened to a conversion request
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Claim won; a background job is now running
    Accepted,
    /// Another request already holds the claim
    AlreadyProcessing,
    /// The artifact already exists
    Ready(ArtifactLocation),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub job_timeout: Duration,
    pub worker_slots: usize,
    /// How often a claimed job refreshes `updated_at` while queued or
    /// running; must stay well under the ledger's staleness window
    pub heartbeat_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            job_timeout: DEFAULT_JOB_TIMEOUT,
            worker_slots: DEFAULT_WORKER_SLOTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Drives conversion jobs from claim to terminal status
pub struct Orchestrator {
    ledger: Arc<dyn JobLedger>,
    source: Arc<dyn SceneSource>,
    converter: Arc<dyn CogConverter>,
    store: Arc<dyn ArtifactStore>,
    slots: Arc<Semaphore>,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        source: Arc<dyn SceneSource>,
        converter: Arc<dyn CogConverter>,
        store: Arc<dyn ArtifactStore>,
        config: PipelineConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.worker_slots.max(1)));
        Self {
            ledger,
            source,
            converter,
            store,
            slots,
            config,
        }
    }

    /// Submit a scene for conversion. Exactly one concurrent submit per
    /// scene wins the claim and spawns a job; the rest observe the current
    /// ledger state.
    #[instrument(skip(self))]
    pub async fn submit(self: &Arc<Self>, source_id: &str) -> Result<SubmitOutcome, SubmitError> {
        validate_source_id(source_id)?;

        match self.ledger.try_claim(source_id).await? {
            ClaimOutcome::Claimed => {
                info!(%source_id, "claim won, starting conversion job");
                let orchestrator = Arc::clone(self);
                let id = source_id.to_string();
                tokio::spawn(async move {
                    orchestrator.run_job(&id).await;
                });
                Ok(SubmitOutcome::Accepted)
            },
            ClaimOutcome::AlreadyProcessing(_) => Ok(SubmitOutcome::AlreadyProcessing),
            ClaimOutcome::Ready(job) => match job.location() {
                Some(location) => Ok(SubmitOutcome::Ready(location)),
                None => {
                    // A ready row without a location is a ledger defect;
                    // reclaiming it here would fight the claim grammar, so
                    // report it as in-flight and let the stale window recover.
                    warn!(%source_id, "ready job has no artifact location");
                    Ok(SubmitOutcome::AlreadyProcessing)
                },
            },
        }
    }

    /// Execute one claimed job end to end and record the terminal status.
    /// The timeout clock starts when an execution slot is acquired, not when
    /// the claim was won.
    async fn run_job(&self, source_id: &str) {
        // Keep the claim visibly alive for the whole lifetime of the job,
        // including time spent queued behind the worker slots. Without this
        // a healthy queued claim would age past the staleness window and a
        // resubmit could spawn a second pipeline for the same scene.
        let heartbeat = {
            let ledger = Arc::clone(&self.ledger);
            let id = source_id.to_string();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = ledger.touch(&id).await {
                        warn!(source_id = %id, error = %e, "claim heartbeat failed");
                    }
                }
            })
        };

        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                heartbeat.abort();
                error!(%source_id, "worker slots closed, abandoning job");
                return;
            },
        };

        let current_stage = Arc::new(Mutex::new(Stage::Fetch));
        let result = tokio::time::timeout(
            self.config.job_timeout,
            self.execute(source_id, &current_stage),
        )
        .await;
        drop(permit);

        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => {
                let stage = *current_stage.lock().unwrap_or_else(|e| e.into_inner());
                Err(PipelineError {
                    stage,
                    source: StageError::Timeout(self.config.job_timeout),
                })
            },
        };

        match outcome {
            Ok(location) => {
                info!(%source_id, uri = %location.uri(), "conversion job complete");
                if let Err(e) = self.ledger.mark_ready(source_id, &location).await {
                    error!(%source_id, error = %e, "failed to record ready status");
                }
            },
            Err(e) => {
                warn!(%source_id, error = %e, "conversion job failed");
                if let Err(le) = self.ledger.mark_error(source_id, &e.to_string()).await {
                    error!(%source_id, error = %le, "failed to record error status");
                }
            },
        }

        // A late heartbeat after the terminal write is harmless: touch only
        // refreshes rows still in processing.
        heartbeat.abort();
    }

    async fn execute(
        &self,
        source_id: &str,
        current_stage: &Arc<Mutex<Stage>>,
    ) -> Result<ArtifactLocation, PipelineError> {
        let set_stage = |stage: Stage| {
            *current_stage.lock().unwrap_or_else(|e| e.into_inner()) = stage;
        };

        set_stage(Stage::Fetch);
        let scene = self
            .source
            .fetch(source_id)
            .await
            .map_err(|e| PipelineError::new(Stage::Fetch, e))?;

        set_stage(Stage::Convert);
        let cog = self
            .converter
            .convert(source_id, scene)
            .await
            .map_err(|e| PipelineError::new(Stage::Convert, e))?;

        set_stage(Stage::Upload);
        let digest = artifact_checksum(cog.path())
            .await
            .map_err(|e| PipelineError::new(Stage::Upload, e))?;
        info!(%source_id, checksum = %digest, "artifact ready for upload");

        let key = cog_key(source_id);
        self.store
            .store(&key, cog.path())
            .await
            .map_err(|e| PipelineError::new(Stage::Upload, e))?;

        Ok(ArtifactLocation {
            bucket: self.store.bucket().to_string(),
            path: key,
        })
    }
}
