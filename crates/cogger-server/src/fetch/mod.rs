//! Source fetcher: authenticated scene downloads from the imagery provider
//!
//! Resolves a scene identifier to its RGB band assets (B02/B03/B04) and
//! streams them into a scratch directory owned by the returned
//! [`SceneHandle`]. Transient transport failures are retried with exponential
//! backoff; authentication and missing-scene failures are fatal.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::{SceneSource, StageError};

/// Default CDSE identity endpoint
pub const DEFAULT_TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";

/// Default scene catalog base URL
pub const DEFAULT_CATALOG_URL: &str = "https://catalogue.dataspace.copernicus.eu/scenes";

/// Slack subtracted from the token lifetime so a token is never used at the
/// edge of expiry
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(10);

/// The three 10 m bands composited into the RGB artifact
pub const REQUIRED_BANDS: [&str; 3] = ["B02", "B03", "B04"];

/// Fetcher configuration
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub token_url: String,
    pub catalog_url: String,
    pub username: String,
    pub password: String,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub request_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            token_url: DEFAULT_TOKEN_URL.to_string(),
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            username: String::new(),
            password: String::new(),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: std::time::Instant,
}

#[derive(Debug, Deserialize)]
struct AssetEntry {
    href: String,
}

#[derive(Debug, Deserialize)]
struct SceneDocument {
    assets: HashMap<String, AssetEntry>,
}

/// Local handle to a fetched scene; the scratch directory is deleted when the
/// handle is dropped, success or failure.
#[derive(Debug)]
pub struct SceneHandle {
    _scratch: TempDir,
    bands: HashMap<String, PathBuf>,
}

impl SceneHandle {
    pub fn new(scratch: TempDir, bands: HashMap<String, PathBuf>) -> Self {
        Self {
            _scratch: scratch,
            bands,
        }
    }

    /// Path to a band file by name (`B02`, `B03`, `B04`)
    pub fn band(&self, name: &str) -> Option<&Path> {
        self.bands.get(name).map(PathBuf::as_path)
    }
}

/// Authenticated HTTP fetcher against the imagery provider
pub struct SceneFetcher {
    client: Client,
    config: FetchConfig,
    token: Mutex<Option<CachedToken>>,
}

impl SceneFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent("cogger-server/0.1")
            .build()?;

        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    /// Get a provider access token, refreshing the cached one when expired
    async fn access_token(&self) -> Result<String, StageError> {
        let mut guard = self.token.lock().await;

        if let Some(cached) = guard.as_ref() {
            if std::time::Instant::now() < cached.expires_at {
                return Ok(cached.token.clone());
            }
        }

        debug!("requesting new provider access token");
        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("client_id", "cdse-public"),
                ("grant_type", "password"),
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("token request failed: {e}")))?;

        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(StageError::Auth(format!(
                "provider rejected credentials: {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(StageError::Transient(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| StageError::Auth(format!("invalid token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_SLACK);
        *guard = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: std::time::Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Resolve the band asset URLs for a scene
    async fn lookup_scene(&self, source_id: &str) -> Result<HashMap<String, String>, StageError> {
        let url = format!("{}/{}", self.config.catalog_url.trim_end_matches('/'), source_id);
        let token = self.access_token().await?;

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("scene lookup failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(StageError::NotFound(format!("scene {source_id} not found")));
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(StageError::Auth(format!(
                    "scene lookup rejected: {}",
                    response.status()
                )));
            },
            status if !status.is_success() => {
                return Err(StageError::Transient(format!("scene lookup returned {status}")));
            },
            _ => {},
        }

        let document: SceneDocument = response
            .json()
            .await
            .map_err(|e| StageError::DataCorruption(format!("invalid scene document: {e}")))?;

        let mut bands = HashMap::new();
        for name in REQUIRED_BANDS {
            match document.assets.get(name) {
                Some(asset) => {
                    bands.insert(name.to_string(), asset.href.clone());
                },
                None => {
                    return Err(StageError::DataCorruption(format!(
                        "scene {source_id} is missing required band {name}"
                    )));
                },
            }
        }

        Ok(bands)
    }

    /// Stream one band to disk, retrying transient failures with backoff
    async fn download_band(&self, url: &str, dest: &Path) -> Result<(), StageError> {
        let mut refreshed = false;
        let mut last_error = None;

        for attempt in 1..=self.config.max_retries {
            match self.try_download(url, dest).await {
                Ok(bytes) => {
                    debug!(%url, bytes, "band download complete");
                    return Ok(());
                },
                Err(StageError::Auth(msg)) if !refreshed => {
                    // One token refresh per band: an expired token mid-run is
                    // expected, a second rejection is a real credential error.
                    warn!(%url, "download rejected, refreshing token");
                    self.invalidate_token().await;
                    refreshed = true;
                    last_error = Some(StageError::Auth(msg));
                },
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = self.config.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        %url, attempt, max = self.config.max_retries, error = %e,
                        "transient download failure, backing off {backoff:?}"
                    );
                    last_error = Some(e);
                    tokio::time::sleep(backoff).await;
                },
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| StageError::Transient("download retries exhausted".to_string())))
    }

    async fn try_download(&self, url: &str, dest: &Path) -> Result<u64, StageError> {
        let token = self.access_token().await?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| StageError::Transient(format!("band request failed: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(StageError::NotFound(format!("band asset not found: {url}")));
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(StageError::Auth(format!(
                    "band download rejected: {}",
                    response.status()
                )));
            },
            status if !status.is_success() => {
                return Err(StageError::Transient(format!("band download returned {status}")));
            },
            _ => {},
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(StageError::from_io)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| StageError::Transient(format!("band stream failed: {e}")))?;
            file.write_all(&chunk).await.map_err(StageError::from_io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(StageError::from_io)?;

        if written == 0 {
            return Err(StageError::DataCorruption(format!("band download was empty: {url}")));
        }

        Ok(written)
    }
}

#[async_trait]
impl SceneSource for SceneFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, source_id: &str) -> Result<SceneHandle, StageError> {
        let assets = self.lookup_scene(source_id).await?;

        let scratch = tempfile::tempdir().map_err(StageError::from_io)?;
        let mut bands = HashMap::new();

        for (name, url) in &assets {
            let dest = scratch.path().join(format!("{name}.tif"));
            info!(%source_id, band = %name, "downloading band");
            self.download_band(url, &dest).await?;
            bands.insert(name.clone(), dest);
        }

        Ok(SceneHandle::new(scratch, bands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_document_parsing() {
        let doc: SceneDocument = serde_json::from_str(
            r#"{"assets": {"B02": {"href": "https://example.com/b02.tif"},
                            "B03": {"href": "https://example.com/b03.tif"},
                            "B04": {"href": "https://example.com/b04.tif"}}}"#,
        )
        .unwrap();
        assert_eq!(doc.assets.len(), 3);
        assert_eq!(doc.assets["B04"].href, "https://example.com/b04.tif");
    }

    #[test]
    fn test_scene_handle_band_lookup() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("B02.tif");
        let handle = SceneHandle::new(
            scratch,
            HashMap::from([("B02".to_string(), path.clone())]),
        );
        assert_eq!(handle.band("B02"), Some(path.as_path()));
        assert!(handle.band("B08").is_none());
    }
}
