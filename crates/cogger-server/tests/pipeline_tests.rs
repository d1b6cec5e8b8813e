//! End-to-end pipeline behavior over an in-memory ledger and scripted stages

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use cogger_server::fetch::SceneHandle;
use cogger_server::ledger::{memory::MemoryLedger, JobLedger, JobStatus};
use cogger_server::pipeline::{
    ArtifactStore, CogConverter, CogHandle, Orchestrator, PipelineConfig, SceneSource,
    StageError, SubmitError, SubmitOutcome,
};

fn make_scene() -> SceneHandle {
    SceneHandle::new(tempfile::tempdir().unwrap(), HashMap::new())
}

fn make_cog() -> CogHandle {
    let scratch = tempfile::tempdir().unwrap();
    let path = scratch.path().join("out.tif");
    std::fs::write(&path, b"tiff bytes").unwrap();
    CogHandle::new(scratch, path)
}

/// Scene source that fails with the scripted errors before succeeding
struct ScriptedSource {
    failures: Mutex<VecDeque<StageError>>,
}

impl ScriptedSource {
    fn succeeding() -> Self {
        Self::with_failures(vec![])
    }

    fn with_failures(failures: Vec<StageError>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
        }
    }
}

#[async_trait]
impl SceneSource for ScriptedSource {
    async fn fetch(&self, _source_id: &str) -> Result<SceneHandle, StageError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(make_scene())
    }
}

/// Converter that can stall until released, tracking its peak concurrency
struct StubConverter {
    gate: Option<Arc<Notify>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl StubConverter {
    fn instant() -> Self {
        Self {
            gate: None,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::instant()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::instant()
        }
    }
}

#[async_trait]
impl CogConverter for StubConverter {
    async fn convert(
        &self,
        _source_id: &str,
        _scene: SceneHandle,
    ) -> Result<CogHandle, StageError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(make_cog())
    }
}

/// Upload sink that records stored keys
#[derive(Default)]
struct RecordingStore {
    keys: Mutex<Vec<String>>,
}

#[async_trait]
impl ArtifactStore for RecordingStore {
    fn bucket(&self) -> &str {
        "cogs"
    }

    async fn store(&self, key: &str, _path: &Path) -> Result<(), StageError> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

struct Harness {
    ledger: Arc<MemoryLedger>,
    store: Arc<RecordingStore>,
    orchestrator: Arc<Orchestrator>,
}

fn harness(
    source: Arc<dyn SceneSource>,
    converter: Arc<dyn CogConverter>,
    config: PipelineConfig,
) -> Harness {
    let ledger = Arc::new(MemoryLedger::new(Duration::from_secs(7200)));
    let store = Arc::new(RecordingStore::default());
    let orchestrator = Arc::new(Orchestrator::new(
        ledger.clone(),
        source,
        converter,
        store.clone(),
        config,
    ));
    Harness {
        ledger,
        store,
        orchestrator,
    }
}

async fn wait_for_terminal(ledger: &MemoryLedger, source_id: &str) -> JobStatus {
    for _ in 0..500 {
        if let Some(job) = ledger.get(source_id).await.unwrap() {
            match job.status {
                JobStatus::Ready | JobStatus::Error => return job.status,
                _ => {},
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached a terminal status");
}

#[tokio::test]
async fn test_successful_job_lands_in_ready() {
    let h = harness(
        Arc::new(ScriptedSource::succeeding()),
        Arc::new(StubConverter::instant()),
        PipelineConfig::default(),
    );

    let outcome = h.orchestrator.submit("scene-a").await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Accepted));

    assert_eq!(wait_for_terminal(&h.ledger, "scene-a").await, JobStatus::Ready);

    let job = h.ledger.get("scene-a").await.unwrap().unwrap();
    let location = job.location().unwrap();
    assert_eq!(location.bucket, "cogs");
    assert_eq!(location.path, "cogs/scene-a_rgb.tif");
    assert_eq!(location.uri(), "s3://cogs/cogs/scene-a_rgb.tif");
    assert_eq!(h.store.keys.lock().unwrap().as_slice(), ["cogs/scene-a_rgb.tif"]);
}

#[tokio::test]
async fn test_single_flight_while_processing() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        Arc::new(ScriptedSource::succeeding()),
        Arc::new(StubConverter::gated(gate.clone())),
        PipelineConfig::default(),
    );

    assert!(matches!(
        h.orchestrator.submit("scene-b").await.unwrap(),
        SubmitOutcome::Accepted
    ));

    // Allow the spawned job to claim its slot and stall in the converter
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A concurrent submit joins the in-flight run instead of starting one
    assert!(matches!(
        h.orchestrator.submit("scene-b").await.unwrap(),
        SubmitOutcome::AlreadyProcessing
    ));

    gate.notify_waiters();
    assert_eq!(wait_for_terminal(&h.ledger, "scene-b").await, JobStatus::Ready);

    // Once ready, submits replay the stored location without new work
    match h.orchestrator.submit("scene-b").await.unwrap() {
        SubmitOutcome::Ready(location) => {
            assert_eq!(location.path, "cogs/scene-b_rgb.tif");
        },
        other => panic!("expected Ready, got {other:?}"),
    }
    assert_eq!(h.store.keys.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_fatal_fetch_error_recorded_with_stage() {
    let h = harness(
        Arc::new(ScriptedSource::with_failures(vec![StageError::NotFound(
            "scene scene-c not found".to_string(),
        )])),
        Arc::new(StubConverter::instant()),
        PipelineConfig::default(),
    );

    h.orchestrator.submit("scene-c").await.unwrap();
    assert_eq!(wait_for_terminal(&h.ledger, "scene-c").await, JobStatus::Error);

    let job = h.ledger.get("scene-c").await.unwrap().unwrap();
    let detail = job.error_detail.as_deref().unwrap();
    assert!(detail.starts_with("fetch:"), "detail = {detail}");
    assert!(detail.contains("not found"));
    assert!(job.location().is_none());

    // A failed scene is claimable again
    assert!(matches!(
        h.orchestrator.submit("scene-c").await.unwrap(),
        SubmitOutcome::Accepted
    ));
    assert_eq!(wait_for_terminal(&h.ledger, "scene-c").await, JobStatus::Ready);
}

#[tokio::test]
async fn test_timeout_names_the_running_stage() {
    let h = harness(
        Arc::new(ScriptedSource::succeeding()),
        Arc::new(StubConverter::slow(Duration::from_secs(30))),
        PipelineConfig {
            job_timeout: Duration::from_millis(100),
            worker_slots: 1,
            ..PipelineConfig::default()
        },
    );

    h.orchestrator.submit("scene-d").await.unwrap();
    assert_eq!(wait_for_terminal(&h.ledger, "scene-d").await, JobStatus::Error);

    let detail = h
        .ledger
        .get("scene-d")
        .await
        .unwrap()
        .unwrap()
        .error_detail
        .unwrap();
    assert!(detail.starts_with("convert:"), "detail = {detail}");
    assert!(detail.contains("timed out"), "detail = {detail}");
}

#[tokio::test]
async fn test_one_worker_slot_serializes_jobs() {
    let converter = Arc::new(StubConverter::slow(Duration::from_millis(50)));
    let h = harness(
        Arc::new(ScriptedSource::succeeding()),
        converter.clone(),
        PipelineConfig {
            job_timeout: Duration::from_secs(30),
            worker_slots: 1,
            ..PipelineConfig::default()
        },
    );

    h.orchestrator.submit("scene-e").await.unwrap();
    h.orchestrator.submit("scene-f").await.unwrap();

    assert_eq!(wait_for_terminal(&h.ledger, "scene-e").await, JobStatus::Ready);
    assert_eq!(wait_for_terminal(&h.ledger, "scene-f").await, JobStatus::Ready);

    assert_eq!(converter.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_queued_job_claim_stays_fresh() {
    // One scene holds the single slot; a second waits queued far longer than
    // the staleness window. Its heartbeat must keep the claim fresh so a
    // resubmit joins the queued run instead of spawning a duplicate.
    let gate = Arc::new(Notify::new());
    let ledger = Arc::new(MemoryLedger::new(Duration::from_millis(100)));
    let store = Arc::new(RecordingStore::default());
    let orchestrator = Arc::new(Orchestrator::new(
        ledger.clone(),
        Arc::new(ScriptedSource::succeeding()),
        Arc::new(StubConverter::gated(gate.clone())),
        store.clone(),
        PipelineConfig {
            job_timeout: Duration::from_secs(30),
            worker_slots: 1,
            heartbeat_interval: Duration::from_millis(10),
        },
    ));

    assert!(matches!(
        orchestrator.submit("scene-g").await.unwrap(),
        SubmitOutcome::Accepted
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(matches!(
        orchestrator.submit("scene-h").await.unwrap(),
        SubmitOutcome::Accepted
    ));

    // Age the queued claim well past the staleness window
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        orchestrator.submit("scene-h").await.unwrap(),
        SubmitOutcome::AlreadyProcessing
    ));

    // Release the gate until both runs drain through the single slot
    for _ in 0..500 {
        gate.notify_waiters();
        if let Some(job) = ledger.get("scene-h").await.unwrap() {
            if job.status == JobStatus::Ready {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(wait_for_terminal(&ledger, "scene-g").await, JobStatus::Ready);
    assert_eq!(wait_for_terminal(&ledger, "scene-h").await, JobStatus::Ready);

    let keys = store.keys.lock().unwrap();
    assert_eq!(
        keys.iter().filter(|k| k.contains("scene-h")).count(),
        1,
        "stored keys: {keys:?}"
    );
}

#[tokio::test]
async fn test_invalid_source_id_rejected_before_claim() {
    let h = harness(
        Arc::new(ScriptedSource::succeeding()),
        Arc::new(StubConverter::instant()),
        PipelineConfig::default(),
    );

    let err = h.orchestrator.submit("../secrets").await.unwrap_err();
    assert!(matches!(err, SubmitError::InvalidSourceId(_)));
    assert!(h.ledger.get("../secrets").await.unwrap().is_none());
}
