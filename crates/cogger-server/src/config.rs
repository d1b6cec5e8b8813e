//! Configuration management

use serde::{Deserialize, Serialize};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/cogger";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default end-to-end budget for one conversion job (1 hour).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

/// Default number of conversion jobs allowed to run at once.
pub const DEFAULT_WORKER_SLOTS: usize = 1;

/// Default interval at which a claimed job refreshes its ledger row, in
/// seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

/// Default transient-failure retry count for provider downloads.
pub const DEFAULT_FETCH_MAX_RETRIES: u32 = 3;

/// Default base backoff for provider download retries, in milliseconds.
pub const DEFAULT_FETCH_BACKOFF_MS: u64 = 500;

/// Default per-request timeout for provider downloads, in seconds.
pub const DEFAULT_FETCH_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Default capacity of the tile service header cache.
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 128;

/// Default lifetime of a cached artifact header, in seconds.
pub const DEFAULT_TILE_CACHE_TTL_SECS: u64 = 300;

/// Default CORS allowed origin for local development.
pub const DEFAULT_CORS_ALLOWED_ORIGIN: &str = "http://localhost:3000";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub provider: ProviderConfig,
    pub pipeline: PipelineSettings,
    pub tiler: TilerConfig,
    pub storage: StorageSettings,
    pub cors: CorsConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// API authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared key required in the X-API-Key header; empty disables auth
    pub api_key: String,
}

/// Imagery provider credentials and endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub token_url: String,
    pub catalog_url: String,
    pub username: String,
    pub password: String,
}

/// Conversion pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub job_timeout_secs: u64,
    /// Age after which an in-flight claim may be taken over
    pub stale_claim_secs: u64,
    /// How often a live job refreshes its claim's `updated_at`
    pub heartbeat_secs: u64,
    pub worker_slots: usize,
    pub fetch_max_retries: u32,
    pub fetch_backoff_ms: u64,
    pub fetch_request_timeout_secs: u64,
}

/// Tile service tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilerConfig {
    pub header_cache_capacity: usize,
    pub header_cache_ttl_secs: u64,
}

/// Which object storage backend to run against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// "s3" or "fs"
    pub backend: String,
    /// Root directory for the fs backend
    pub fs_root: String,
    /// Bucket name, used by both backends
    pub bucket: String,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let job_timeout_secs = env_parsed("JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT_SECS);

        let config = Config {
            server: ServerConfig {
                host: std::env::var("COGGER_HOST")
                    .unwrap_or_else(|_| DEFAULT_SERVER_HOST.to_string()),
                port: env_parsed("COGGER_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_parsed(
                    "COGGER_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parsed(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_parsed(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_parsed(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            auth: AuthConfig {
                api_key: std::env::var("API_KEY").unwrap_or_default(),
            },
            provider: ProviderConfig {
                token_url: std::env::var("CDSE_TOKEN_URL")
                    .unwrap_or_else(|_| crate::fetch::DEFAULT_TOKEN_URL.to_string()),
                catalog_url: std::env::var("CDSE_CATALOG_URL")
                    .unwrap_or_else(|_| crate::fetch::DEFAULT_CATALOG_URL.to_string()),
                username: std::env::var("CDSE_USERNAME").unwrap_or_default(),
                password: std::env::var("CDSE_PASSWORD").unwrap_or_default(),
            },
            pipeline: PipelineSettings {
                job_timeout_secs,
                // Claims older than two job budgets are presumed orphaned
                stale_claim_secs: env_parsed("STALE_CLAIM_SECS", job_timeout_secs * 2),
                heartbeat_secs: env_parsed("HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS),
                worker_slots: env_parsed("WORKER_SLOTS", DEFAULT_WORKER_SLOTS),
                fetch_max_retries: env_parsed("FETCH_MAX_RETRIES", DEFAULT_FETCH_MAX_RETRIES),
                fetch_backoff_ms: env_parsed("FETCH_BACKOFF_MS", DEFAULT_FETCH_BACKOFF_MS),
                fetch_request_timeout_secs: env_parsed(
                    "FETCH_REQUEST_TIMEOUT_SECS",
                    DEFAULT_FETCH_REQUEST_TIMEOUT_SECS,
                ),
            },
            tiler: TilerConfig {
                header_cache_capacity: env_parsed(
                    "TILE_CACHE_CAPACITY",
                    DEFAULT_TILE_CACHE_CAPACITY,
                ),
                header_cache_ttl_secs: env_parsed(
                    "TILE_CACHE_TTL_SECS",
                    DEFAULT_TILE_CACHE_TTL_SECS,
                ),
            },
            storage: StorageSettings {
                backend: std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "s3".to_string()),
                fs_root: std::env::var("FS_STORAGE_ROOT")
                    .unwrap_or_else(|_| "./data/storage".to_string()),
                bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "cogs".to_string()),
            },
            cors: CorsConfig {
                allowed_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                    .unwrap_or_else(|_| DEFAULT_CORS_ALLOWED_ORIGIN.to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
                allow_credentials: env_parsed("CORS_ALLOW_CREDENTIALS", true),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.pipeline.job_timeout_secs == 0 {
            anyhow::bail!("Job timeout must be greater than 0");
        }

        if self.pipeline.stale_claim_secs < self.pipeline.job_timeout_secs {
            anyhow::bail!("Stale claim window must be at least the job timeout");
        }

        if self.pipeline.heartbeat_secs == 0
            || self.pipeline.heartbeat_secs >= self.pipeline.stale_claim_secs
        {
            anyhow::bail!("Heartbeat interval must be nonzero and shorter than the stale claim window");
        }

        if self.pipeline.worker_slots == 0 {
            anyhow::bail!("Worker slots must be greater than 0");
        }

        match self.storage.backend.as_str() {
            "s3" | "fs" => {},
            other => anyhow::bail!("Unknown storage backend: {other}"),
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            auth: AuthConfig {
                api_key: String::new(),
            },
            provider: ProviderConfig {
                token_url: crate::fetch::DEFAULT_TOKEN_URL.to_string(),
                catalog_url: crate::fetch::DEFAULT_CATALOG_URL.to_string(),
                username: String::new(),
                password: String::new(),
            },
            pipeline: PipelineSettings {
                job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
                stale_claim_secs: DEFAULT_JOB_TIMEOUT_SECS * 2,
                heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
                worker_slots: DEFAULT_WORKER_SLOTS,
                fetch_max_retries: DEFAULT_FETCH_MAX_RETRIES,
                fetch_backoff_ms: DEFAULT_FETCH_BACKOFF_MS,
                fetch_request_timeout_secs: DEFAULT_FETCH_REQUEST_TIMEOUT_SECS,
            },
            tiler: TilerConfig {
                header_cache_capacity: DEFAULT_TILE_CACHE_CAPACITY,
                header_cache_ttl_secs: DEFAULT_TILE_CACHE_TTL_SECS,
            },
            storage: StorageSettings {
                backend: "s3".to_string(),
                fs_root: "./data/storage".to_string(),
                bucket: "cogs".to_string(),
            },
            cors: CorsConfig {
                allowed_origins: vec![DEFAULT_CORS_ALLOWED_ORIGIN.to_string()],
                allow_credentials: true,
            },
        }
    }
}
