use anyhow::{Context, Result};

/// Object storage connection settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Custom endpoint URL (MinIO or other S3-compatible stores); None for AWS
    pub endpoint: Option<String>,
    pub region: String,
    /// Bucket finished artifacts are written to
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Path-style addressing, required by MinIO
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: std::env::var("S3_BUCKET").context("S3_BUCKET must be set")?,
            access_key: std::env::var("S3_ACCESS_KEY").context("S3_ACCESS_KEY must be set")?,
            secret_key: std::env::var("S3_SECRET_KEY").context("S3_SECRET_KEY must be set")?,
            path_style: std::env::var("S3_PATH_STYLE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }
}
