//! Object storage: artifact uploads and ranged reads
//!
//! Two seams are cut here. [`ArtifactStore`] is the pipeline's upload sink:
//! `store` only succeeds once the object is confirmed present, so a `ready`
//! ledger row always points at a real artifact. [`ObjectStore`] is the read
//! side used by the metadata and tile endpoints, which pull small byte ranges
//! out of large artifacts instead of whole objects.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::{ArtifactStore, StageError};

pub mod config;
pub mod fs;

/// Attempts for an artifact upload before the job fails
const UPLOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Read-side access to stored objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read `len` bytes starting at `start`; short reads at end of object
    /// are returned as-is.
    async fn read_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<u8>, StorageError>;

    /// Cheap backend liveness check for health reporting
    async fn ping(&self) -> Result<(), StorageError>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing storage for bucket: {}", config.bucket);

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "cogger-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    #[instrument(skip(self))]
    async fn upload_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .context("Failed to open artifact for upload")?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("image/tiff")
            .body(body)
            .send()
            .await
            .context("Failed to upload artifact to S3")?;

        info!("Uploaded artifact to s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let text = e.to_string();
                if text.contains("NotFound") || text.contains("404") {
                    Ok(false)
                } else {
                    Err(StorageError::Backend(text))
                }
            },
        }
    }
}

#[async_trait]
impl ArtifactStore for Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn store(&self, key: &str, path: &Path) -> Result<(), StageError> {
        let mut last_error = None;

        for attempt in 1..=UPLOAD_ATTEMPTS {
            match self.upload_file(key, path).await {
                Ok(()) => {
                    last_error = None;
                    break;
                },
                Err(e) if attempt < UPLOAD_ATTEMPTS => {
                    warn!(key, attempt, error = %e, "artifact upload failed, retrying");
                    last_error = Some(e);
                    tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await;
                },
                Err(e) => last_error = Some(e),
            }
        }
        if let Some(e) = last_error {
            return Err(StageError::Transient(format!("artifact upload failed: {e}")));
        }

        // Confirm the object landed before the ledger is allowed to say so
        match self.head(&self.bucket, key).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(StageError::Transient(format!(
                "uploaded artifact not visible at s3://{}/{}",
                self.bucket, key
            ))),
            Err(e) => Err(StageError::Transient(format!("upload confirmation failed: {e}"))),
        }
    }
}

#[async_trait]
impl ObjectStore for Storage {
    #[instrument(skip(self))]
    async fn read_range(
        &self,
        bucket: &str,
        key: &str,
        start: u64,
        len: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let range = format!("bytes={}-{}", start, start + len - 1);

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| {
                let text = e.to_string();
                if text.contains("NoSuchKey") || text.contains("404") {
                    StorageError::NotFound(format!("s3://{bucket}/{key}"))
                } else {
                    StorageError::Backend(text)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .into_bytes()
            .to_vec();

        debug!("Read {} bytes from s3://{}/{}", data.len(), bucket, key);
        Ok(data)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
