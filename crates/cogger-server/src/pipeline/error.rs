//! Stage error taxonomy
//!
//! Retry policy is attached to the error kind, not scattered through control
//! flow: only `Transient` failures are retried inside a stage, everything
//! else aborts the pipeline and is recorded verbatim in the ledger.

use std::time::Duration;
use thiserror::Error;

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Convert,
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Convert => write!(f, "convert"),
            Stage::Upload => write!(f, "upload"),
        }
    }
}

/// Failure of a single pipeline stage
#[derive(Debug, Error)]
pub enum StageError {
    /// Network-level hiccup; retried with backoff inside the stage.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Provider credentials rejected; fatal, never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Scene or asset does not exist upstream; fatal.
    #[error("not found: {0}")]
    NotFound(String),

    /// Source rasters unreadable or inconsistent; fatal.
    #[error("corrupt source data: {0}")]
    DataCorruption(String),

    /// Disk or memory exhausted; fatal, surfaced apart from data errors so
    /// operators can tell the two apart.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// End-to-end wall clock budget exceeded.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    /// Map an I/O failure, distinguishing exhaustion from everything else
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::OutOfMemory => {
                StageError::ResourceExhaustion(err.to_string())
            },
            _ => StageError::DataCorruption(err.to_string()),
        }
    }
}

/// A stage failure tagged with the stage that produced it; its rendering is
/// what lands in the ledger's `error_detail`.
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: StageError) -> Self {
        Self { stage, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(StageError::Transient("503".into()).is_retryable());
        assert!(!StageError::Auth("bad credentials".into()).is_retryable());
        assert!(!StageError::NotFound("scene".into()).is_retryable());
        assert!(!StageError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_pipeline_error_names_stage() {
        let err = PipelineError::new(Stage::Fetch, StageError::NotFound("scene-a".into()));
        assert_eq!(err.to_string(), "fetch: not found: scene-a");
    }

    #[test]
    fn test_io_exhaustion_mapping() {
        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space left");
        assert!(matches!(
            StageError::from_io(full),
            StageError::ResourceExhaustion(_)
        ));

        let other = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated");
        assert!(matches!(StageError::from_io(other), StageError::DataCorruption(_)));
    }
}
